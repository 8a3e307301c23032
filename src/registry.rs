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

//! Dispatch tables for locally-implemented interfaces.
//!
//! Interfaces are identified by 64-bit ids and methods by dense 16-bit
//! ordinals, mirroring how calls name their targets on the wire. A `Registry`
//! is plain data owned by whoever sets up the vat; nothing here is global.

use std::collections::HashMap;
use std::rc::Rc;

use crate::capability::Promise;
use crate::payload::Payload;
use crate::Error;

/// A method implementation. Takes the call's params and eventually produces
/// a results payload.
pub type Method = Rc<dyn Fn(Payload) -> Promise<Payload, Error>>;

/// The methods of one interface, indexed by ordinal.
pub struct MethodTable {
    interface_id: u64,
    methods: Vec<Option<Method>>,
}

impl MethodTable {
    pub fn new(interface_id: u64) -> Self {
        Self {
            interface_id,
            methods: Vec::new(),
        }
    }

    pub fn interface_id(&self) -> u64 {
        self.interface_id
    }

    pub fn set_method<F>(&mut self, method_id: u16, method: F)
    where
        F: Fn(Payload) -> Promise<Payload, Error> + 'static,
    {
        let index = method_id as usize;
        if index >= self.methods.len() {
            self.methods.resize_with(index + 1, || None);
        }
        self.methods[index] = Some(Rc::new(method));
    }

    pub fn get(&self, method_id: u16) -> Option<&Method> {
        self.methods.get(method_id as usize).and_then(|m| m.as_ref())
    }

    pub fn contains(&self, method_id: u16) -> bool {
        self.get(method_id).is_some()
    }
}

/// The set of interfaces a vat knows how to dispatch.
#[derive(Default)]
pub struct Registry {
    interfaces: HashMap<u64, Rc<MethodTable>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            interfaces: HashMap::new(),
        }
    }

    pub fn register(&mut self, table: MethodTable) -> Rc<MethodTable> {
        let table = Rc::new(table);
        self.interfaces.insert(table.interface_id(), table.clone());
        table
    }

    pub fn get(&self, interface_id: u64) -> Option<&Rc<MethodTable>> {
        self.interfaces.get(&interface_id)
    }

    /// Whether a call naming this interface and method could be dispatched.
    pub fn contains(&self, interface_id: u64, method_id: u16) -> bool {
        self.get(interface_id)
            .map_or(false, |table| table.contains(method_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_respects_interface_and_ordinal() {
        let mut table = MethodTable::new(0xdead);
        table.set_method(3, |_params| Promise::ok(Payload::new()));
        let mut registry = Registry::new();
        registry.register(table);

        assert!(registry.contains(0xdead, 3));
        assert!(!registry.contains(0xdead, 0));
        assert!(!registry.contains(0xbeef, 3));
    }
}
