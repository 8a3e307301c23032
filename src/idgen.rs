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

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Allocates table ids densely: freed ids are reused, lowest first, before the
/// counter is extended. Question, export, and embargo ids all come from here.
#[derive(Default)]
pub struct IdGen {
    free_ids: BinaryHeap<Reverse<u32>>,
    next_id: u32,
}

impl IdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u32 {
        match self.free_ids.pop() {
            Some(Reverse(id)) => id,
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        }
    }

    /// Returns `id` to the pool. The caller must not hand back an id that is
    /// still live or was never allocated.
    pub fn remove(&mut self, id: u32) {
        self.free_ids.push(Reverse(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense() {
        let mut gen = IdGen::new();
        for expected in 0..10 {
            assert_eq!(gen.next(), expected);
        }
    }

    #[test]
    fn freed_id_comes_back_before_fresh_ones() {
        let mut gen = IdGen::new();
        for _ in 0..5 {
            gen.next();
        }
        gen.remove(2);
        assert_eq!(gen.next(), 2);
        assert_eq!(gen.next(), 5);
    }

    #[test]
    fn lowest_freed_id_wins() {
        let mut gen = IdGen::new();
        for _ in 0..4 {
            gen.next();
        }
        gen.remove(3);
        gen.remove(1);
        assert_eq!(gen.next(), 1);
        assert_eq!(gen.next(), 3);
        assert_eq!(gen.next(), 4);
    }
}
