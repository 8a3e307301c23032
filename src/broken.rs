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

//! Capabilities and pipelines that always fail with a given error.

use std::rc::Rc;

use crate::capability::{self, Client, PipelineHook};
use crate::payload::PipelineOp;
use crate::Error;

pub struct ClientInner {
    error: Error,
}

impl ClientInner {
    pub(crate) fn error(&self) -> &Error {
        &self.error
    }
}

struct Pipeline {
    error: Error,
}

impl PipelineHook for Pipeline {
    fn get_pipelined_cap(&self, _ops: Vec<PipelineOp>) -> Client {
        new_client(self.error.clone())
    }
}

pub fn new_client(error: Error) -> Client {
    Client::from(Rc::new(ClientInner { error }))
}

pub(crate) fn new_pipeline(error: Error) -> capability::Pipeline {
    capability::Pipeline::new(Rc::new(Pipeline { error }))
}
