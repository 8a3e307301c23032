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

//! Dynamically-typed structured values.
//!
//! Params and results are structs whose fields are addressed by offset:
//! scalar fields live in a data section, and pointer fields hold nested
//! structs, blobs, text, or capability-table indexes. This is the surface
//! that promise pipelining transforms operate on.

use crate::capability::Client;
use crate::{Error, Result};

/// A pointer field of a struct.
#[derive(Clone, Debug, Default)]
pub enum Ptr {
    #[default]
    Null,
    Struct(Box<StructValue>),
    Data(Vec<u8>),
    Text(String),

    /// Index into the enclosing payload's capability table.
    Capability(u32),
}

static NULL_PTR: Ptr = Ptr::Null;

impl From<StructValue> for Ptr {
    fn from(value: StructValue) -> Self {
        Ptr::Struct(Box::new(value))
    }
}

/// A struct value: scalar fields by data offset, pointer fields by pointer offset.
///
/// Unset fields read as their default (zero or null). Both sections grow on
/// demand when a field is set.
#[derive(Clone, Debug, Default)]
pub struct StructValue {
    data: Vec<u64>,
    pointers: Vec<Ptr>,
}

impl StructValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_uint64(&mut self, offset: usize, value: u64) {
        if self.data.len() <= offset {
            self.data.resize(offset + 1, 0);
        }
        self.data[offset] = value;
    }

    pub fn get_uint64(&self, offset: usize) -> u64 {
        self.data.get(offset).copied().unwrap_or(0)
    }

    pub fn set_int64(&mut self, offset: usize, value: i64) {
        self.set_uint64(offset, value as u64);
    }

    pub fn get_int64(&self, offset: usize) -> i64 {
        self.get_uint64(offset) as i64
    }

    pub fn set_bool(&mut self, offset: usize, value: bool) {
        self.set_uint64(offset, value as u64);
    }

    pub fn get_bool(&self, offset: usize) -> bool {
        self.get_uint64(offset) != 0
    }

    pub fn set_ptr(&mut self, offset: usize, ptr: Ptr) {
        if self.pointers.len() <= offset {
            self.pointers.resize_with(offset + 1, Ptr::default);
        }
        self.pointers[offset] = ptr;
    }

    pub fn get_ptr(&self, offset: usize) -> &Ptr {
        self.pointers.get(offset).unwrap_or(&NULL_PTR)
    }

    pub fn set_data(&mut self, offset: usize, value: Vec<u8>) {
        self.set_ptr(offset, Ptr::Data(value));
    }

    pub fn get_data(&self, offset: usize) -> Result<&[u8]> {
        match self.get_ptr(offset) {
            Ptr::Data(d) => Ok(d),
            Ptr::Null => Ok(&[]),
            _ => Err(Error::failed("pointer field is not a data blob".to_string())),
        }
    }

    pub fn set_text(&mut self, offset: usize, value: String) {
        self.set_ptr(offset, Ptr::Text(value));
    }

    pub fn get_text(&self, offset: usize) -> Result<&str> {
        match self.get_ptr(offset) {
            Ptr::Text(t) => Ok(t),
            Ptr::Null => Ok(""),
            _ => Err(Error::failed("pointer field is not text".to_string())),
        }
    }

    pub fn set_struct(&mut self, offset: usize, value: StructValue) {
        self.set_ptr(offset, Ptr::from(value));
    }

    pub fn get_struct(&self, offset: usize) -> Result<&StructValue> {
        match self.get_ptr(offset) {
            Ptr::Struct(s) => Ok(s),
            _ => Err(Error::failed("pointer field is not a struct".to_string())),
        }
    }

    /// Stores a capability-table index. See `Payload::set_cap` for the usual way in.
    pub fn set_capability(&mut self, offset: usize, index: u32) {
        self.set_ptr(offset, Ptr::Capability(index));
    }
}

/// One step of a pipeline transform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineOp {
    Noop,
    GetPointerField(u16),
}

/// Walks `ops` down a pointer tree. Reading a field of a null pointer yields
/// null; traversing through a non-struct pointer is an error.
pub fn transform_ptr<'a>(mut ptr: &'a Ptr, ops: &[PipelineOp]) -> Result<&'a Ptr> {
    for op in ops {
        match op {
            PipelineOp::Noop => (),
            PipelineOp::GetPointerField(field) => match ptr {
                Ptr::Struct(s) => ptr = s.get_ptr(*field as usize),
                Ptr::Null => ptr = &NULL_PTR,
                _ => {
                    return Err(Error::failed(
                        "pipeline transform passes through a non-struct pointer".to_string(),
                    ))
                }
            },
        }
    }
    Ok(ptr)
}

/// A root value plus the capability table its `Ptr::Capability` fields index into.
#[derive(Clone, Default)]
pub struct Payload {
    pub content: Ptr,
    pub cap_table: Vec<Option<Client>>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_struct(value: StructValue) -> Self {
        Self {
            content: Ptr::from(value),
            cap_table: Vec::new(),
        }
    }

    pub fn content_struct(&self) -> Result<&StructValue> {
        match &self.content {
            Ptr::Struct(s) => Ok(s),
            _ => Err(Error::failed("payload root is not a struct".to_string())),
        }
    }

    /// Like `content_struct`, but initializes a null root to an empty struct.
    pub fn content_struct_mut(&mut self) -> &mut StructValue {
        if !matches!(self.content, Ptr::Struct(_)) {
            self.content = Ptr::from(StructValue::new());
        }
        match &mut self.content {
            Ptr::Struct(s) => s,
            _ => unreachable!(),
        }
    }

    /// Adds a capability to the table and returns its index.
    pub fn add_cap(&mut self, client: Client) -> u32 {
        self.cap_table.push(Some(client));
        (self.cap_table.len() - 1) as u32
    }

    /// Stores `client` in the table and points root pointer field
    /// `pointer_field` at it.
    pub fn set_cap(&mut self, pointer_field: usize, client: Client) {
        let index = self.add_cap(client);
        self.content_struct_mut()
            .set_capability(pointer_field, index);
    }

    /// Reads the capability stored at root pointer field `pointer_field`.
    pub fn get_cap(&self, pointer_field: usize) -> Result<Client> {
        self.pipelined_cap(&[PipelineOp::GetPointerField(pointer_field as u16)])
    }

    pub fn capability_at(&self, index: u32) -> Result<Client> {
        match self.cap_table.get(index as usize) {
            Some(Some(client)) => Ok(client.clone()),
            _ => Err(Error::failed(
                "invalid capability table index".to_string(),
            )),
        }
    }

    /// Resolves a pipeline transform against this payload, ending at a capability.
    pub fn pipelined_cap(&self, ops: &[PipelineOp]) -> Result<Client> {
        match transform_ptr(&self.content, ops)? {
            Ptr::Capability(index) => self.capability_at(*index),
            Ptr::Null => Err(Error::failed(
                "pipeline target is a null capability".to_string(),
            )),
            _ => Err(Error::failed(
                "pipeline target is not a capability".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_fields_default_to_zero() {
        let mut s = StructValue::new();
        assert_eq!(s.get_int64(3), 0);
        s.set_int64(3, -7);
        assert_eq!(s.get_int64(3), -7);
        assert_eq!(s.get_uint64(0), 0);
        assert!(!s.get_bool(1));
    }

    #[test]
    fn transform_walks_nested_structs() {
        let mut leaf = StructValue::new();
        leaf.set_capability(2, 5);
        let mut root = StructValue::new();
        root.set_struct(1, leaf);
        let root = Ptr::from(root);

        let ops = [PipelineOp::GetPointerField(1), PipelineOp::GetPointerField(2)];
        match transform_ptr(&root, &ops).unwrap() {
            Ptr::Capability(5) => (),
            other => panic!("unexpected pointer: {other:?}"),
        }
    }

    #[test]
    fn transform_through_null_reads_null() {
        let root = Ptr::from(StructValue::new());
        let ops = [PipelineOp::GetPointerField(9), PipelineOp::GetPointerField(0)];
        assert!(matches!(
            transform_ptr(&root, &ops).unwrap(),
            Ptr::Null
        ));
    }

    #[test]
    fn transform_through_data_is_an_error() {
        let mut root = StructValue::new();
        root.set_data(0, vec![1, 2, 3]);
        let root = Ptr::from(root);
        let ops = [PipelineOp::GetPointerField(0), PipelineOp::GetPointerField(0)];
        assert!(transform_ptr(&root, &ops).is_err());
    }

    #[test]
    fn pipelined_cap_rejects_null_and_non_caps() {
        let mut payload = Payload::from_struct(StructValue::new());
        assert!(payload
            .pipelined_cap(&[PipelineOp::GetPointerField(0)])
            .is_err());
        payload.content_struct_mut().set_data(0, vec![0]);
        assert!(payload
            .pipelined_cap(&[PipelineOp::GetPointerField(0)])
            .is_err());
    }
}
