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

use std::collections::BTreeMap;

use futures::channel::oneshot;

/// A set of values waiting on a single event, drained exactly once in
/// insertion order.
pub struct SenderQueue<In, Out> {
    map: BTreeMap<u64, (In, oneshot::Sender<Out>)>,
    next_id: u64,
}

impl<In, Out> SenderQueue<In, Out>
where
    Out: 'static,
{
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Enqueues a value whose completion nobody is going to wait on.
    pub fn push_detach(&mut self, value: In) {
        let (sender, _receiver) = oneshot::channel();
        self.map.insert(self.next_id, (value, sender));
        self.next_id += 1;
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (In, oneshot::Sender<Out>)> {
        std::mem::take(&mut self.map).into_values()
    }
}

impl<In, Out> Default for SenderQueue<In, Out>
where
    Out: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
