//! Bounded double-ended FIFO over arena storage.
//!
//! Capacity is a runtime value chosen at registration time, so the backing
//! slots come from the [`Arena`](crate::arena::Arena) rather than a const
//! generic.  Indices are modular over the capacity with an explicit length.
//!
//! Not interrupt-safe on its own: the reactor brackets every mutation with
//! its interrupt-masking lock.

use crate::arena::Arena;

pub struct Queue<T> {
    buf: *mut T,
    cap: u8,
    /// Index of the oldest element.
    head: u8,
    /// Index of the first free slot.
    tail: u8,
    len: u8,
}

// SAFETY: the buffer is arena-owned for the rest of the program and only
// touched through &mut self.
unsafe impl<T: Send> Send for Queue<T> {}

impl<T: Copy> Queue<T> {
    /// Allocate a queue of `cap` slots (at least one).
    pub fn with_capacity(arena: &Arena, cap: u8) -> Self {
        let cap = if cap == 0 { 1 } else { cap };
        Self {
            buf: arena.alloc_array::<T>(cap as usize).as_ptr(),
            cap,
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> u8 {
        self.cap
    }

    pub fn len(&self) -> u8 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.cap
    }

    #[inline]
    fn step(&self, index: u8) -> u8 {
        if index + 1 == self.cap { 0 } else { index + 1 }
    }

    #[inline]
    fn step_back(&self, index: u8) -> u8 {
        if index == 0 { self.cap - 1 } else { index - 1 }
    }

    /// Append at the tail; fails when full.
    pub fn try_push_back(&mut self, value: T) -> bool {
        if self.is_full() {
            return false;
        }
        // SAFETY: `tail < cap` and the slot is free.
        unsafe { self.buf.add(self.tail as usize).write(value) };
        self.tail = self.step(self.tail);
        self.len += 1;
        true
    }

    /// Prepend at the head; fails when full.
    pub fn try_push_front(&mut self, value: T) -> bool {
        if self.is_full() {
            return false;
        }
        self.head = self.step_back(self.head);
        // SAFETY: `head < cap` and the slot is free.
        unsafe { self.buf.add(self.head as usize).write(value) };
        self.len += 1;
        true
    }

    /// Remove the oldest element.
    pub fn try_pop_front(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        // SAFETY: `head` indexes a live element.
        let value = unsafe { self.buf.add(self.head as usize).read() };
        self.head = self.step(self.head);
        self.len -= 1;
        Some(value)
    }

    /// Remove the newest element.
    pub fn try_pop_back(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        self.tail = self.step_back(self.tail);
        // SAFETY: `tail` now indexes a live element.
        let value = unsafe { self.buf.add(self.tail as usize).read() };
        self.len -= 1;
        Some(value)
    }

    /// Append at the tail; when full, the oldest element is dropped.
    /// Never fails — the newest value always lands.
    pub fn push_overwrite(&mut self, value: T) {
        if self.is_full() {
            self.head = self.step(self.head);
            self.len -= 1;
        }
        // SAFETY: a slot is free after the eviction above.
        unsafe { self.buf.add(self.tail as usize).write(value) };
        self.tail = self.step(self.tail);
        self.len += 1;
    }
}
