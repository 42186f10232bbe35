//! Stack pool allocator for thread stacks.
//!
//! Stacks come in a handful of size classes. Released stacks go back to a
//! bounded per-class free list so a runtime that keeps spawning short-lived
//! threads does not hit the allocator for every one of them.

use crate::errors::{MemoryError, ThreadResult};
use portable_atomic::{AtomicUsize, Ordering};
use spin::Mutex;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

/// Alignment of every stack allocation.
const STACK_ALIGN: usize = 16;

/// Free stacks kept per size class; extras are returned to the allocator.
const MAX_CACHED_PER_CLASS: usize = 16;

/// Value written at the lowest stack address to detect overflow.
pub const STACK_CANARY: u64 = 0xDEAD_BEEF_CAFE_BABE;

/// Stack size classes for the pool allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSizeClass {
    /// Small stack: 4 KiB
    Small = 4096,
    /// Medium stack: 16 KiB
    Medium = 16384,
    /// Large stack: 64 KiB
    Large = 65536,
    /// Extra large stack: 256 KiB
    ExtraLarge = 262144,
}

impl StackSizeClass {
    /// Get the size in bytes for this stack class.
    pub fn size(self) -> usize {
        self as usize
    }

    /// Choose the smallest size class that can hold `requested_size` bytes.
    ///
    /// Returns `None` if the request is larger than the biggest class.
    pub fn for_size(requested_size: usize) -> Option<Self> {
        match requested_size {
            0..=4096 => Some(Self::Small),
            4097..=16384 => Some(Self::Medium),
            16385..=65536 => Some(Self::Large),
            65537..=262144 => Some(Self::ExtraLarge),
            _ => None,
        }
    }

    fn index(self) -> usize {
        match self {
            StackSizeClass::Small => 0,
            StackSizeClass::Medium => 1,
            StackSizeClass::Large => 2,
            StackSizeClass::ExtraLarge => 3,
        }
    }
}

/// A thread stack.
///
/// Owns its memory; dropping a `Stack` frees it.
pub struct Stack {
    /// Lowest address of the stack memory
    memory: NonNull<u8>,
    size_class: StackSizeClass,
}

impl Stack {
    /// Usable stack size in bytes.
    pub fn size(&self) -> usize {
        self.size_class.size()
    }

    /// Stack size class.
    pub fn size_class(&self) -> StackSizeClass {
        self.size_class
    }

    /// Lowest address of the stack. Stacks grow down towards it.
    pub fn base(&self) -> *mut u8 {
        self.memory.as_ptr()
    }

    /// One past the highest address, aligned down to 16 bytes.
    pub fn top(&self) -> *mut u8 {
        let top = self.memory.as_ptr() as usize + self.size();
        (top & !0xF) as *mut u8
    }

    /// Write the canary at the lowest address of the stack.
    pub fn install_canary(&self, canary: u64) {
        // SAFETY: base is 16-byte aligned and the stack is at least 4 KiB.
        unsafe { self.base().cast::<u64>().write(canary) }
    }

    /// Whether the canary written by [`install_canary`](Self::install_canary)
    /// is still intact.
    pub fn check_canary(&self, expected_canary: u64) -> bool {
        // SAFETY: as in `install_canary`.
        unsafe { self.base().cast::<u64>().read() == expected_canary }
    }

    fn layout(size_class: StackSizeClass) -> Option<Layout> {
        Layout::from_size_align(size_class.size(), STACK_ALIGN).ok()
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        if let Some(layout) = Self::layout(self.size_class) {
            // SAFETY: `memory` came from `alloc` with this exact layout.
            unsafe { dealloc(self.memory.as_ptr(), layout) }
        }
    }
}

impl core::fmt::Debug for Stack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.memory)
            .field("size_class", &self.size_class)
            .finish()
    }
}

/// Pool-based allocator for thread stacks.
pub struct StackPool {
    /// Free stacks for each size class
    free_stacks: [Mutex<Vec<Stack>>; 4],
    stats: StackPoolStats,
}

#[derive(Debug)]
struct StackPoolStats {
    /// Stacks obtained from the allocator
    allocated: AtomicUsize,
    /// Stacks handed back to the pool
    released: AtomicUsize,
    /// Stacks currently owned by threads
    in_use: AtomicUsize,
}

impl Default for StackPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StackPool {
    pub const fn new() -> Self {
        Self {
            free_stacks: [
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
                Mutex::new(Vec::new()),
            ],
            stats: StackPoolStats {
                allocated: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                in_use: AtomicUsize::new(0),
            },
        }
    }

    /// Allocate a stack of the given size class.
    ///
    /// Reuses a released stack when one is cached, otherwise asks the
    /// global allocator.
    pub fn allocate(&self, size_class: StackSizeClass) -> ThreadResult<Stack> {
        let cached = self.free_stacks[size_class.index()].lock().pop();
        let stack = match cached {
            Some(stack) => stack,
            None => {
                let stack = Self::allocate_new_stack(size_class)?;
                self.stats.allocated.fetch_add(1, Ordering::AcqRel);
                stack
            }
        };
        self.stats.in_use.fetch_add(1, Ordering::AcqRel);
        Ok(stack)
    }

    /// Return a stack to the pool.
    ///
    /// The memory stays mapped while cached, so a thread may release its own
    /// stack before its final switch away from it.
    pub fn release(&self, stack: Stack) {
        self.stats.in_use.fetch_sub(1, Ordering::AcqRel);
        self.stats.released.fetch_add(1, Ordering::AcqRel);

        let mut free_list = self.free_stacks[stack.size_class.index()].lock();
        if free_list.len() < MAX_CACHED_PER_CLASS {
            free_list.push(stack);
        }
    }

    /// Pool statistics as `(allocated, released, in_use)`.
    pub fn stats(&self) -> (usize, usize, usize) {
        (
            self.stats.allocated.load(Ordering::Acquire),
            self.stats.released.load(Ordering::Acquire),
            self.stats.in_use.load(Ordering::Acquire),
        )
    }

    fn allocate_new_stack(size_class: StackSizeClass) -> ThreadResult<Stack> {
        let layout = Stack::layout(size_class).ok_or(MemoryError::InvalidLayout)?;
        // SAFETY: layout has a non-zero size.
        let memory = unsafe { alloc(layout) };
        let memory = NonNull::new(memory).ok_or(MemoryError::OutOfMemory)?;
        Ok(Stack {
            memory,
            size_class,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_size_class_for_size() {
        assert_eq!(StackSizeClass::for_size(1024), Some(StackSizeClass::Small));
        assert_eq!(StackSizeClass::for_size(4096), Some(StackSizeClass::Small));
        assert_eq!(StackSizeClass::for_size(8192), Some(StackSizeClass::Medium));
        assert_eq!(StackSizeClass::for_size(32768), Some(StackSizeClass::Large));
        assert_eq!(StackSizeClass::for_size(131072), Some(StackSizeClass::ExtraLarge));
        assert_eq!(StackSizeClass::for_size(500000), None);
    }

    #[test]
    fn test_stack_pool_reuses_released_stack() {
        let pool = StackPool::new();
        let stack = pool.allocate(StackSizeClass::Small).unwrap();
        let base = stack.base();
        assert_eq!(stack.size(), 4096);
        assert_eq!(base as usize % STACK_ALIGN, 0);
        assert_eq!(stack.top() as usize, base as usize + 4096);

        pool.release(stack);
        let (_, released, in_use) = pool.stats();
        assert_eq!(released, 1);
        assert_eq!(in_use, 0);

        let again = pool.allocate(StackSizeClass::Small).unwrap();
        assert_eq!(again.base(), base);
        pool.release(again);
    }

    #[test]
    fn test_stack_canary() {
        let pool = StackPool::new();
        let stack = pool.allocate(StackSizeClass::Small).unwrap();

        stack.install_canary(STACK_CANARY);
        assert!(stack.check_canary(STACK_CANARY));
        assert!(!stack.check_canary(0x1234_5678_90AB_CDEF));

        // Simulate the thread running off the end of its stack.
        unsafe { stack.base().write(0) };
        assert!(!stack.check_canary(STACK_CANARY));

        pool.release(stack);
    }

    #[test]
    fn test_size_classes_are_separate() {
        let pool = StackPool::new();
        let small = pool.allocate(StackSizeClass::Small).unwrap();
        pool.release(small);

        let medium = pool.allocate(StackSizeClass::Medium).unwrap();
        assert_eq!(medium.size_class(), StackSizeClass::Medium);
        assert_eq!(medium.size(), 16384);
        pool.release(medium);
    }
}
