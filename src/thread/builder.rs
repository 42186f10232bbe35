use super::ThreadId;
use crate::errors::{ThreadError, ThreadResult};
use crate::mem::StackSizeClass;
use crate::runtime::Runtime;

/// Spawn configuration for a single thread.
///
/// Anything left unset falls back to the runtime's configuration.
#[derive(Debug, Default)]
pub struct ThreadBuilder {
    stack_size: Option<StackSizeClass>,
    name: Option<String>,
}

impl ThreadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stack_size(mut self, size: StackSizeClass) -> Self {
        self.stack_size = Some(size);
        self
    }

    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Spawn `f` on the runtime driving the calling OS thread.
    pub fn spawn<F>(self, f: F) -> ThreadResult<ThreadId>
    where
        F: FnOnce() + 'static,
    {
        Runtime::with_current(|rt| rt.spawn_with(self.name, self.stack_size, f))
            .unwrap_or_else(|| Err(ThreadError::no_runtime()))
    }
}
