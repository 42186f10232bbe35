//! FIFO queue used for the ready list and semaphore wait lists.
//!
//! A singly linked list stored in a slab: nodes live in a `Vec` and link to
//! each other by index, with vacated slots threaded onto a free list. This
//! keeps enqueue/dequeue O(1) without an allocation per element once the
//! slab has grown to the queue's high-water mark.

use crate::errors::{DestroyError, ThreadError, ThreadResult};

/// Slab slot.
enum Slot<T> {
    Occupied { value: T, next: Option<usize> },
    Vacant { next_free: Option<usize> },
}

/// Ordered container of elements, oldest first.
pub struct Queue<T> {
    slots: Vec<Slot<T>>,
    /// Oldest element
    head: Option<usize>,
    /// Newest element
    tail: Option<usize>,
    free: Option<usize>,
    len: usize,
}

impl<T> Queue<T> {
    /// Create an empty queue. Does not allocate.
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            head: None,
            tail: None,
            free: None,
            len: 0,
        }
    }

    /// Destroy the queue.
    ///
    /// Queues never drain themselves: destroying one that still holds
    /// elements fails and returns it untouched.
    pub fn destroy(self) -> Result<(), DestroyError<Self>> {
        if self.len > 0 {
            return Err(DestroyError::new(self));
        }
        Ok(())
    }

    /// Number of elements currently queued.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the queue holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `value` at the tail.
    pub fn enqueue(&mut self, value: T) -> ThreadResult<()> {
        let index = self.alloc_slot(value, None)?;
        match self.tail {
            Some(tail) => self.set_next(tail, Some(index)),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
        Ok(())
    }

    /// Insert `value` at the head, ahead of everything already queued.
    pub fn enqueue_front(&mut self, value: T) -> ThreadResult<()> {
        let index = self.alloc_slot(value, self.head)?;
        if self.tail.is_none() {
            self.tail = Some(index);
        }
        self.head = Some(index);
        self.len += 1;
        Ok(())
    }

    /// Remove and return the oldest element.
    pub fn dequeue(&mut self) -> Option<T> {
        let index = self.head?;
        let (value, next) = self.release_slot(index);
        self.head = next;
        if next.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(value)
    }

    /// Iterate head to tail without mutating the queue.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            cursor: self.head,
        }
    }

    /// Invoke `f` once per element, head to tail.
    ///
    /// `f` gets the queue itself and may delete the element it was handed;
    /// the successor is captured before the call so traversal continues.
    pub fn iterate<F>(&mut self, mut f: F)
    where
        T: Clone,
        F: FnMut(&mut Self, T),
    {
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let (value, next) = match &self.slots[index] {
                Slot::Occupied { value, next } => (value.clone(), *next),
                Slot::Vacant { .. } => break,
            };
            f(self, value);
            cursor = next;
        }
    }

    fn alloc_slot(&mut self, value: T, next: Option<usize>) -> ThreadResult<usize> {
        let slot = Slot::Occupied { value, next };
        match self.free {
            Some(index) => {
                if let Slot::Vacant { next_free } = self.slots[index] {
                    self.free = next_free;
                }
                self.slots[index] = slot;
                Ok(index)
            }
            None => {
                self.slots
                    .try_reserve(1)
                    .map_err(|_| ThreadError::allocation_failure())?;
                self.slots.push(slot);
                Ok(self.slots.len() - 1)
            }
        }
    }

    /// Vacate `index`, returning its value and successor.
    fn release_slot(&mut self, index: usize) -> (T, Option<usize>) {
        let vacant = Slot::Vacant {
            next_free: self.free,
        };
        match core::mem::replace(&mut self.slots[index], vacant) {
            Slot::Occupied { value, next } => {
                self.free = Some(index);
                (value, next)
            }
            // Linked indices always point at occupied slots.
            Slot::Vacant { .. } => unreachable!("queue link points at a vacant slot"),
        }
    }

    fn next_of(&self, index: usize) -> Option<usize> {
        match &self.slots[index] {
            Slot::Occupied { next, .. } => *next,
            Slot::Vacant { .. } => None,
        }
    }

    fn set_next(&mut self, index: usize, to: Option<usize>) {
        if let Slot::Occupied { next, .. } = &mut self.slots[index] {
            *next = to;
        }
    }
}

impl<T: PartialEq> Queue<T> {
    /// Remove the first element equal to `value`.
    ///
    /// Elements are compared by identity: queue handles, not the records
    /// they refer to.
    pub fn delete(&mut self, value: &T) -> ThreadResult<()> {
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(index) = cursor {
            let next = self.next_of(index);
            let hit = matches!(&self.slots[index], Slot::Occupied { value: v, .. } if v == value);
            if hit {
                match prev {
                    Some(p) => self.set_next(p, next),
                    None => self.head = next,
                }
                if next.is_none() {
                    self.tail = prev;
                }
                self.release_slot(index);
                self.len -= 1;
                return Ok(());
            }
            prev = Some(index);
            cursor = next;
        }
        Err(ThreadError::NotFound)
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only iterator over a [`Queue`].
pub struct Iter<'a, T> {
    queue: &'a Queue<T>,
    cursor: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let index = self.cursor?;
        match &self.queue.slots[index] {
            Slot::Occupied { value, next } => {
                self.cursor = *next;
                Some(value)
            }
            Slot::Vacant { .. } => None,
        }
    }
}
