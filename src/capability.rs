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

//! Things that live in a capability table: clients, calls, answers, pipelines.

use std::cell::RefCell;
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::Future;

use crate::error::Error;
use crate::payload::{Payload, PipelineOp};

/// A promise for a result of type `T` that may fail with an error of type `E`.
pub struct Promise<T, E> {
    inner: PromiseInner<T, E>,
}

enum PromiseInner<T, E> {
    Immediate(Result<T, E>),
    Deferred(Pin<Box<dyn Future<Output = Result<T, E>> + 'static>>),
    Empty,
}

impl<T, E> Promise<T, E> {
    pub fn ok(value: T) -> Self {
        Self {
            inner: PromiseInner::Immediate(Ok(value)),
        }
    }

    pub fn err(error: E) -> Self {
        Self {
            inner: PromiseInner::Immediate(Err(error)),
        }
    }

    pub fn from_future<F>(f: F) -> Self
    where
        F: Future<Output = Result<T, E>> + 'static,
    {
        Self {
            inner: PromiseInner::Deferred(Box::pin(f)),
        }
    }
}

impl<T, E> Future for Promise<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.inner {
            PromiseInner::Empty => panic!("Promise polled after done."),
            ref mut imm @ PromiseInner::Immediate(_) => {
                match std::mem::replace(imm, PromiseInner::Empty) {
                    PromiseInner::Immediate(r) => Poll::Ready(r),
                    _ => unreachable!(),
                }
            }
            PromiseInner::Deferred(ref mut f) => match f.as_mut().poll(cx) {
                Poll::Ready(v) => {
                    this.inner = PromiseInner::Empty;
                    Poll::Ready(v)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<T, E> Unpin for Promise<T, E> {}

/// A method invocation: which method, with which arguments.
pub struct Call {
    pub interface_id: u64,
    pub method_id: u16,
    pub params: Payload,
}

impl Call {
    pub fn new(interface_id: u64, method_id: u16, params: Payload) -> Self {
        Self {
            interface_id,
            method_id,
            params,
        }
    }
}

/// The results of a finished call.
#[derive(Clone)]
pub struct Response {
    results: Rc<Payload>,
}

impl Response {
    pub(crate) fn new(results: Rc<Payload>) -> Self {
        Self { results }
    }

    pub fn get(&self) -> &Payload {
        &self.results
    }

    pub(crate) fn payload_rc(&self) -> Rc<Payload> {
        self.results.clone()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("content", &self.results.content)
            .field("cap_count", &self.results.cap_table.len())
            .finish()
    }
}

/// What you get back from `Client::call`: an eventual response, plus a
/// pipeline for reaching into the results before they arrive.
pub struct Answer {
    pub promise: Promise<Response, Error>,
    pub pipeline: Pipeline,
}

impl Answer {
    pub(crate) fn new(promise: Promise<Response, Error>, pipeline: Pipeline) -> Self {
        Self { promise, pipeline }
    }

    /// An answer that has already failed.
    pub fn error(error: Error) -> Self {
        Self {
            promise: Promise::err(error.clone()),
            pipeline: crate::broken::new_pipeline(error),
        }
    }

    /// Calls a method on a capability expected in these results, without
    /// waiting for them. `transform` names the pointer-field path to the
    /// capability.
    pub fn pipeline_call(&self, transform: &[u16], call: Call) -> Answer {
        let mut pipeline = self.pipeline.clone();
        for field in transform {
            pipeline = pipeline.get_pipeline(*field);
        }
        pipeline.as_cap().call(call)
    }
}

/// Where a pipeline ultimately gets its capabilities from.
pub(crate) trait PipelineHook {
    fn get_pipelined_cap(&self, ops: Vec<PipelineOp>) -> Client;
}

/// An answer plus a pointer-field path into its eventual results.
///
/// Pipelines are immutable: `get_pipeline` derives a child one field deeper,
/// and `transform` is the concatenation of the ancestor chain's ops, root to
/// leaf.
#[derive(Clone)]
pub struct Pipeline {
    hook: Rc<dyn PipelineHook>,
    ops: Vec<PipelineOp>,
    parent: Option<Rc<Pipeline>>,
}

impl Pipeline {
    pub(crate) fn new(hook: Rc<dyn PipelineHook>) -> Self {
        Self {
            hook,
            ops: Vec::new(),
            parent: None,
        }
    }

    /// Derives the pipeline for pointer field `pointer_field` of this one's target.
    pub fn get_pipeline(&self, pointer_field: u16) -> Pipeline {
        Pipeline {
            hook: self.hook.clone(),
            ops: vec![PipelineOp::GetPointerField(pointer_field)],
            parent: Some(Rc::new(self.clone())),
        }
    }

    pub fn transform(&self) -> Vec<PipelineOp> {
        let mut ops = match &self.parent {
            Some(parent) => parent.transform(),
            None => Vec::new(),
        };
        ops.extend_from_slice(&self.ops);
        ops
    }

    /// The capability this pipeline points at, usable immediately.
    pub fn as_cap(&self) -> Client {
        self.hook.get_pipelined_cap(self.transform())
    }

    pub(crate) fn extend_cap(&self, extra: &[PipelineOp]) -> Client {
        let mut ops = self.transform();
        ops.extend_from_slice(extra);
        self.hook.get_pipelined_cap(ops)
    }
}

/// A reference to a capability, local or remote. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    pub(crate) variant: ClientVariant,
}

#[derive(Clone)]
pub(crate) enum ClientVariant {
    /// A capability served by a method table in this process.
    Local(Rc<crate::local::ClientInner>),

    /// A capability hosted by the peer.
    Import(Rc<RefCell<crate::rpc::ImportClient>>),

    /// A capability expected in the results of an outstanding question.
    Pipeline(Rc<RefCell<crate::rpc::PipelineClient>>),

    /// A call-buffering wrapper around a capability that is not known yet.
    Queued(Rc<RefCell<crate::queued::ClientInner>>),

    /// A capability that always fails.
    Broken(Rc<crate::broken::ClientInner>),

    /// One unit of a reference-counted capability.
    Counted(crate::refcount::Ref),
}

impl Client {
    pub fn call(&self, call: Call) -> Answer {
        match &self.variant {
            ClientVariant::Local(inner) => crate::local::call(inner, call),
            ClientVariant::Import(inner) => crate::rpc::ImportClient::call(inner, call),
            ClientVariant::Pipeline(inner) => crate::rpc::PipelineClient::call(inner, call),
            ClientVariant::Queued(inner) => crate::queued::ClientInner::call(inner, call),
            ClientVariant::Broken(inner) => Answer::error(inner.error().clone()),
            ClientVariant::Counted(r) => r.target().call(call),
        }
    }

    /// Releases whatever this reference holds. Further calls through this
    /// handle (or clones of it) get error answers where that applies; closing
    /// again is a no-op.
    pub fn close(&self) {
        match &self.variant {
            ClientVariant::Import(inner) => inner.borrow_mut().release(),
            ClientVariant::Queued(inner) => crate::queued::ClientInner::reject(
                inner,
                Error::failed("capability was closed".to_string()),
            ),
            ClientVariant::Counted(r) => r.close(),
            ClientVariant::Local(_) | ClientVariant::Broken(_) | ClientVariant::Pipeline(_) => (),
        }
    }

    /// One unwrapping step: what this client currently redirects to, if anything.
    pub(crate) fn resolved(&self) -> Option<Client> {
        match &self.variant {
            ClientVariant::Pipeline(inner) => inner.borrow().redirect.clone(),
            ClientVariant::Queued(inner) => inner.borrow().redirect.clone(),
            ClientVariant::Counted(r) => Some(r.target()),
            _ => None,
        }
    }

    /// Follows redirects to the most-resolved client.
    pub(crate) fn unwrap_resolved(&self) -> Client {
        let mut client = self.clone();
        while let Some(inner) = client.resolved() {
            client = inner;
        }
        client
    }

    /// Identity key, for export deduplication.
    pub(crate) fn key(&self) -> usize {
        match &self.variant {
            ClientVariant::Local(rc) => Rc::as_ptr(rc) as usize,
            ClientVariant::Import(rc) => Rc::as_ptr(rc) as usize,
            ClientVariant::Pipeline(rc) => Rc::as_ptr(rc) as usize,
            ClientVariant::Queued(rc) => Rc::as_ptr(rc) as usize,
            ClientVariant::Broken(rc) => Rc::as_ptr(rc) as usize,
            ClientVariant::Counted(r) => r.target().key(),
        }
    }

    /// Identifies the connection a remote client points through, or 0 for
    /// anything hosted locally.
    pub(crate) fn brand(&self) -> usize {
        match &self.variant {
            ClientVariant::Import(rc) => rc.borrow().connection_ptr(),
            ClientVariant::Pipeline(rc) => rc.borrow().connection_ptr(),
            _ => 0,
        }
    }
}

impl From<Rc<crate::local::ClientInner>> for Client {
    fn from(inner: Rc<crate::local::ClientInner>) -> Self {
        Self {
            variant: ClientVariant::Local(inner),
        }
    }
}

impl From<Rc<RefCell<crate::rpc::ImportClient>>> for Client {
    fn from(inner: Rc<RefCell<crate::rpc::ImportClient>>) -> Self {
        Self {
            variant: ClientVariant::Import(inner),
        }
    }
}

impl From<Rc<RefCell<crate::rpc::PipelineClient>>> for Client {
    fn from(inner: Rc<RefCell<crate::rpc::PipelineClient>>) -> Self {
        Self {
            variant: ClientVariant::Pipeline(inner),
        }
    }
}

impl From<Rc<RefCell<crate::queued::ClientInner>>> for Client {
    fn from(inner: Rc<RefCell<crate::queued::ClientInner>>) -> Self {
        Self {
            variant: ClientVariant::Queued(inner),
        }
    }
}

impl From<Rc<crate::broken::ClientInner>> for Client {
    fn from(inner: Rc<crate::broken::ClientInner>) -> Self {
        Self {
            variant: ClientVariant::Broken(inner),
        }
    }
}

impl From<crate::refcount::Ref> for Client {
    fn from(r: crate::refcount::Ref) -> Self {
        Self {
            variant: ClientVariant::Counted(r),
        }
    }
}
