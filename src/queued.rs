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

//! Clients and pipelines that buffer operations until a capability is known.
//!
//! The buffer is bounded: once it fills up, further calls get an overloaded
//! error answer instead of queueing. On resolution the buffer drains strictly
//! first-in-first-out to the underlying client, after which the wrapper is a
//! passthrough. The embargo protocol reuses this same client, driven by the
//! disembargo round trip.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use futures::channel::oneshot;
use futures::future::Shared;
use futures::{Future, FutureExt, TryFutureExt};

use crate::capability::{self, Answer, Call, Client, PipelineHook, Promise, Response};
use crate::payload::PipelineOp;
use crate::queue::{Queue, Slots};
use crate::sender_queue::SenderQueue;
use crate::{broken, Error};

/// How many calls may pile up against an unresolved capability before callers
/// start getting overloaded answers.
pub(crate) const CALL_QUEUE_CAPACITY: usize = 64;

pub(crate) struct PipelineInner {
    // Once the answer is ready, the pipeline to forward to.
    redirect: Option<capability::Pipeline>,

    promise_clients_to_resolve: SenderQueue<(Weak<RefCell<ClientInner>>, Vec<PipelineOp>), ()>,

    promise_to_drive: Option<Shared<Promise<(), Error>>>,
}

impl PipelineInner {
    fn resolve(this: &Rc<RefCell<PipelineInner>>, result: Result<capability::Pipeline, Error>) {
        assert!(this.borrow().redirect.is_none(), "pipeline already resolved");
        let pipeline = match result {
            Ok(pipeline) => pipeline,
            Err(e) => broken::new_pipeline(e),
        };
        this.borrow_mut().redirect = Some(pipeline.clone());

        let waiters: Vec<_> = this
            .borrow_mut()
            .promise_clients_to_resolve
            .drain()
            .collect();
        for ((weak_client, ops), _waiter) in waiters {
            if let Some(client) = weak_client.upgrade() {
                ClientInner::resolve(&client, Ok(pipeline.extend_cap(&ops)));
            }
        }
    }
}

/// The fulfilling end of a queued pipeline. Dropping it without completing
/// fails the pipeline.
pub(crate) struct PipelineInnerSender {
    inner: Option<Weak<RefCell<PipelineInner>>>,
}

impl PipelineInnerSender {
    pub(crate) fn complete(mut self, pipeline: capability::Pipeline) {
        if let Some(weak) = self.inner.take() {
            if let Some(inner) = weak.upgrade() {
                PipelineInner::resolve(&inner, Ok(pipeline));
            }
        }
    }
}

impl Drop for PipelineInnerSender {
    fn drop(&mut self) {
        if let Some(weak) = self.inner.take() {
            if let Some(inner) = weak.upgrade() {
                PipelineInner::resolve(
                    &inner,
                    Err(Error::failed("answer was canceled".to_string())),
                );
            }
        }
    }
}

/// A pipeline over an answer that is still being computed.
pub(crate) struct Pipeline {
    inner: Rc<RefCell<PipelineInner>>,
}

impl Pipeline {
    pub(crate) fn new() -> (PipelineInnerSender, Self) {
        let inner = Rc::new(RefCell::new(PipelineInner {
            redirect: None,
            promise_clients_to_resolve: SenderQueue::new(),
            promise_to_drive: None,
        }));
        (
            PipelineInnerSender {
                inner: Some(Rc::downgrade(&inner)),
            },
            Self { inner },
        )
    }

    /// Attaches a future whose progress is required for this pipeline to ever
    /// resolve. Capabilities pulled out of the pipeline pick it up too, so
    /// that awaiting any of their answers drives the whole chain.
    pub(crate) fn drive<F>(&mut self, promise: F)
    where
        F: Future<Output = Result<(), Error>> + 'static,
    {
        let mut inner = self.inner.borrow_mut();
        let shared = match inner.promise_to_drive.take() {
            Some(existing) => Promise::from_future(
                futures::future::try_join(existing, Promise::from_future(promise)).map_ok(drop),
            )
            .shared(),
            None => Promise::from_future(promise).shared(),
        };
        inner.promise_to_drive = Some(shared);
    }
}

impl PipelineHook for Pipeline {
    fn get_pipelined_cap(&self, ops: Vec<PipelineOp>) -> Client {
        if let Some(redirect) = &self.inner.borrow().redirect {
            return redirect.extend_cap(&ops);
        }
        let client = ClientInner::new(Some(self.inner.clone()));
        if let Some(driver) = &self.inner.borrow().promise_to_drive {
            ClientInner::drive(&client, driver.clone());
        }
        self.inner
            .borrow_mut()
            .promise_clients_to_resolve
            .push_detach((Rc::downgrade(&client), ops));
        Client::from(client)
    }
}

struct QueuedCall {
    call: Call,
    response_fulfiller: oneshot::Sender<Promise<Response, Error>>,
    pipeline_sender: PipelineInnerSender,
}

/// A client that buffers calls until it learns what it really points at.
pub(crate) struct ClientInner {
    pub(crate) redirect: Option<Client>,

    // The pipeline this client came out of, kept alive so its resolution can
    // reach us.
    pipeline_inner: Option<Rc<RefCell<PipelineInner>>>,

    promise_to_drive: Option<Shared<Promise<(), Error>>>,

    calls: Queue<Slots<QueuedCall>>,
}

impl ClientInner {
    pub(crate) fn new(
        pipeline_inner: Option<Rc<RefCell<PipelineInner>>>,
    ) -> Rc<RefCell<ClientInner>> {
        Rc::new(RefCell::new(ClientInner {
            redirect: None,
            pipeline_inner,
            promise_to_drive: None,
            calls: Queue::with_capacity(CALL_QUEUE_CAPACITY),
        }))
    }

    pub(crate) fn drive<F>(this: &Rc<RefCell<ClientInner>>, promise: F)
    where
        F: Future<Output = Result<(), Error>> + 'static,
    {
        let mut inner = this.borrow_mut();
        let shared = match inner.promise_to_drive.take() {
            Some(existing) => Promise::from_future(
                futures::future::try_join(existing, Promise::from_future(promise)).map_ok(drop),
            )
            .shared(),
            None => Promise::from_future(promise).shared(),
        };
        inner.promise_to_drive = Some(shared);
    }

    pub(crate) fn call(this: &Rc<RefCell<ClientInner>>, call: Call) -> Answer {
        let mut inner = this.borrow_mut();
        if let Some(client) = &inner.redirect {
            let client = client.clone();
            drop(inner);
            return client.call(call);
        }

        let (response_fulfiller, response_receiver) = oneshot::channel();
        let (pipeline_sender, mut pipeline) = Pipeline::new();
        if let Some(driver) = &inner.promise_to_drive {
            pipeline.drive(driver.clone());
        }

        let queued = QueuedCall {
            call,
            response_fulfiller,
            pipeline_sender,
        };
        if inner.calls.push_value(queued).is_err() {
            return Answer::error(Error::overloaded(format!(
                "pipelined call queue is full ({} calls buffered)",
                inner.calls.len()
            )));
        }

        let response_promise = async move {
            response_receiver
                .await
                .map_err(crate::canceled_to_error)?
                .await
        };
        let promise = match &inner.promise_to_drive {
            Some(driver) => Promise::from_future(
                futures::future::try_join(driver.clone(), Box::pin(response_promise))
                    .map_ok(|v| v.1),
            ),
            None => Promise::from_future(response_promise),
        };

        Answer::new(promise, capability::Pipeline::new(Rc::new(pipeline)))
    }

    /// Redirects to `result` and drains the buffer, strictly in order.
    pub(crate) fn resolve(this: &Rc<RefCell<ClientInner>>, result: Result<Client, Error>) {
        if this.borrow().redirect.is_some() {
            return;
        }
        let client = match result {
            Ok(client) => client,
            Err(e) => broken::new_client(e),
        };
        this.borrow_mut().redirect = Some(client.clone());

        loop {
            let queued = this.borrow_mut().calls.pop_value();
            match queued {
                Some(QueuedCall {
                    call,
                    response_fulfiller,
                    pipeline_sender,
                }) => {
                    let answer = client.call(call);
                    let _ = response_fulfiller.send(answer.promise);
                    pipeline_sender.complete(answer.pipeline);
                }
                None => break,
            }
        }
        this.borrow_mut().pipeline_inner = None;
    }

    /// Fails every buffered call and every future one.
    pub(crate) fn reject(this: &Rc<RefCell<ClientInner>>, error: Error) {
        if this.borrow().redirect.is_some() {
            return;
        }
        Self::resolve(this, Err(error));
    }

    #[allow(dead_code)]
    pub(crate) fn is_passthrough(this: &Rc<RefCell<ClientInner>>) -> bool {
        let inner = this.borrow();
        inner.redirect.is_some() && inner.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;
    use crate::ErrorKind;
    use futures::executor::block_on;

    fn dummy_call() -> Call {
        Call::new(0, 0, Payload::new())
    }

    #[test]
    fn full_queue_overloads_new_callers() {
        let client = ClientInner::new(None);
        let queued: Vec<Answer> = (0..CALL_QUEUE_CAPACITY)
            .map(|_| ClientInner::call(&client, dummy_call()))
            .collect();
        let overflow = ClientInner::call(&client, dummy_call());
        let err = block_on(overflow.promise).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Overloaded);
        drop(queued);
    }

    #[test]
    fn rejection_fails_buffered_calls() {
        let client = ClientInner::new(None);
        let answer = ClientInner::call(&client, dummy_call());
        ClientInner::reject(&client, Error::failed("went away".to_string()));
        let err = block_on(answer.promise).unwrap_err();
        assert_eq!(err.description, "went away");
        assert!(ClientInner::is_passthrough(&client));

        // later calls fail immediately through the broken redirect
        let err = block_on(ClientInner::call(&client, dummy_call()).promise).unwrap_err();
        assert_eq!(err.description, "went away");
    }

    #[test]
    fn resolution_drains_in_order() {
        // resolve to a broken client and observe that every buffered call was
        // forwarded (each one gets the redirect's error, not a cancellation)
        let client = ClientInner::new(None);
        let answers: Vec<Answer> = (0..3)
            .map(|_| ClientInner::call(&client, dummy_call()))
            .collect();
        ClientInner::resolve(
            &client,
            Ok(broken::new_client(Error::failed("target".to_string()))),
        );
        for answer in answers {
            let err = block_on(answer.promise).unwrap_err();
            assert_eq!(err.description, "target");
        }
    }
}
