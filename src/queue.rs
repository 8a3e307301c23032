// Copyright (c) 2013-2017 Sandstorm Development Group, Inc. and contributors
// Licensed under the MIT License:
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! A fixed-capacity FIFO index allocator.
//!
//! `Queue` hands out slot indexes into an external storage abstraction in
//! ring-buffer order. It backs the bounded call buffers: an unresolved
//! capability may only queue so many calls before callers get an overloaded
//! answer instead.

/// Storage a `Queue` allocates slots out of.
pub trait Storage {
    fn capacity(&self) -> usize;

    /// Resets the slot at `index` to its vacant state.
    fn clear(&mut self, index: usize);
}

/// `Vec<Option<T>>`-backed storage.
pub struct Slots<T> {
    slots: Vec<Option<T>>,
}

impl<T> Slots<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::new();
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    pub fn put(&mut self, index: usize, value: T) {
        assert!(self.slots[index].is_none(), "slot {index} is occupied");
        self.slots[index] = Some(value);
    }

    pub fn take(&mut self, index: usize) -> Option<T> {
        self.slots[index].take()
    }
}

impl<T> Storage for Slots<T> {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn clear(&mut self, index: usize) {
        self.slots[index] = None;
    }
}

/// Circular index allocator over `S`.
pub struct Queue<S: Storage> {
    storage: S,
    front: usize,
    count: usize,
}

impl<S: Storage> Queue<S> {
    /// `initial_count` slots starting at index 0 are considered already occupied.
    pub fn new(storage: S, initial_count: usize) -> Self {
        assert!(initial_count <= storage.capacity());
        Self {
            storage,
            front: 0,
            count: initial_count,
        }
    }

    /// Claims the next free slot, or `None` when the queue is full. The caller
    /// is responsible for actually storing something there.
    pub fn push(&mut self) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        let index = (self.front + self.count) % self.storage.capacity();
        self.count += 1;
        Some(index)
    }

    /// The oldest occupied slot, or `None` when empty.
    pub fn front(&self) -> Option<usize> {
        if self.is_empty() {
            None
        } else {
            Some(self.front)
        }
    }

    /// Clears the front slot and advances past it.
    pub fn pop(&mut self) {
        if self.is_empty() {
            return;
        }
        self.storage.clear(self.front);
        self.front = (self.front + 1) % self.storage.capacity();
        self.count -= 1;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.storage.capacity()
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }
}

impl<T> Queue<Slots<T>> {
    pub fn with_capacity(capacity: usize) -> Self {
        Queue::new(Slots::with_capacity(capacity), 0)
    }

    /// Enqueues `value`, handing it back if the queue is full.
    pub fn push_value(&mut self, value: T) -> Result<(), T> {
        match self.push() {
            Some(index) => {
                self.storage_mut().put(index, value);
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Dequeues the oldest value.
    pub fn pop_value(&mut self) -> Option<T> {
        let index = self.front()?;
        let value = self.storage_mut().take(index);
        self.pop();
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_across_wraparound() {
        let mut q: Queue<Slots<u32>> = Queue::with_capacity(5);
        for v in [10, 11, 12] {
            q.push_value(v).unwrap();
        }
        assert_eq!(q.pop_value(), Some(10));
        assert_eq!(q.pop_value(), Some(11));
        for v in [13, 14, 15, 16] {
            q.push_value(v).unwrap();
        }
        assert!(q.is_full());
        let mut drained = Vec::new();
        while let Some(v) = q.pop_value() {
            drained.push(v);
        }
        assert_eq!(drained, vec![12, 13, 14, 15, 16]);
    }

    #[test]
    fn push_on_full_returns_the_value() {
        let mut q: Queue<Slots<&str>> = Queue::with_capacity(2);
        q.push_value("a").unwrap();
        q.push_value("b").unwrap();
        assert_eq!(q.push_value("c"), Err("c"));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn pop_on_empty_is_a_no_op() {
        let mut q: Queue<Slots<u8>> = Queue::with_capacity(3);
        q.pop();
        assert_eq!(q.front(), None);
        q.push_value(1).unwrap();
        assert_eq!(q.pop_value(), Some(1));
        assert!(q.is_empty());
    }

    #[test]
    fn initial_count_marks_slots_occupied() {
        let storage: Slots<u8> = Slots::with_capacity(4);
        let q = Queue::new(storage, 2);
        assert_eq!(q.len(), 2);
        assert_eq!(q.front(), Some(0));
    }
}
