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

//! The state of a single connection: questions, answers, imports, exports,
//! and the message handlers that keep those four tables consistent with the
//! peer's mirror image of them.

use std::cell::RefCell;
use std::collections::HashMap;
use std::mem;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{self, Shared};
use futures::{Future, FutureExt};

use crate::capability::{self, Answer, Call, Client, ClientVariant, PipelineHook, Promise, Response};
use crate::error::ErrorKind;
use crate::idgen::IdGen;
use crate::message::{
    AnswerId, CapDescriptor, DisembargoContext, ExportId, ImportId, Message, MessageTarget,
    QuestionId, ReturnBody, WirePayload,
};
use crate::payload::{Payload, PipelineOp};
use crate::queue::{Queue, Slots};
use crate::registry::Registry;
use crate::task_set::{TaskReaper, TaskSet, TaskSetHandle};
use crate::{broken, queued, Error, Transport};

/// A slab keyed by the low-numbered ids the protocol favors. Freed ids are
/// reused lowest-first.
struct ExportTable<T> {
    slots: Vec<Option<T>>,
    ids: IdGen,
}

impl<T> ExportTable<T> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            ids: IdGen::new(),
        }
    }

    fn push(&mut self, value: T) -> u32 {
        let id = self.ids.next();
        let index = id as usize;
        if index == self.slots.len() {
            self.slots.push(Some(value));
        } else {
            debug_assert!(self.slots[index].is_none());
            self.slots[index] = Some(value);
        }
        id
    }

    fn find(&mut self, id: u32) -> Option<&mut T> {
        self.slots.get_mut(id as usize).and_then(|slot| slot.as_mut())
    }

    fn erase(&mut self, id: u32) -> Option<T> {
        let value = self.slots.get_mut(id as usize).and_then(|slot| slot.take());
        if value.is_some() {
            self.ids.remove(id);
        }
        value
    }

    fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.slots.iter_mut().filter_map(|slot| slot.take())
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|slot| slot.as_mut())
    }
}

/// An entry in the question table: a call we sent, awaiting its `Return`.
struct Question {
    is_awaiting_return: bool,

    /// Exports sent in the params, released if the `Return` asks us to.
    param_exports: Vec<ExportId>,

    /// Set when the peer answered with `Unimplemented`; it has no answer
    /// entry, so a `Finish` would be a protocol error.
    skip_finish: bool,

    /// What was called, for tagging remote exceptions. `None` for Bootstrap.
    method: Option<(u64, u16)>,

    self_ref: Option<Weak<RefCell<QuestionRef>>>,
}

impl Question {
    fn new() -> Self {
        Self {
            is_awaiting_return: true,
            param_exports: Vec::new(),
            skip_finish: false,
            method: None,
            self_ref: None,
        }
    }
}

/// The live handle to a question. Everything that still cares about the
/// answer holds one of these; when the last goes away, `Finish` is sent.
struct QuestionRef {
    connection_state: Rc<ConnectionState>,
    id: QuestionId,
    fulfiller: Option<oneshot::Sender<Result<Response, Error>>>,
}

impl QuestionRef {
    fn fulfill(&mut self, response: Response) {
        self.settle(Ok(response));
    }

    fn reject(&mut self, error: Error) {
        self.settle(Err(error));
    }

    fn settle(&mut self, result: Result<Response, Error>) {
        match self.fulfiller.take() {
            Some(fulfiller) => {
                let _ = fulfiller.send(result);
            }
            None => panic!("question {} was settled twice", self.id),
        }
    }
}

impl Drop for QuestionRef {
    fn drop(&mut self) {
        let state = self.connection_state.clone();
        let mut questions = state.questions.borrow_mut();
        if let Some(question) = questions.find(self.id) {
            if !question.skip_finish && state.connection.borrow().is_ok() {
                // If the answer never arrived, tell the peer to drop any caps
                // in it as well, since nobody is left to receive them.
                ConnectionState::send_message(
                    &state,
                    Message::Finish {
                        question_id: self.id,
                        release_result_caps: question.is_awaiting_return,
                    },
                );
            }
            if question.is_awaiting_return {
                // Keep the entry so the id is not reused before the Return.
                question.self_ref = None;
            } else {
                questions.erase(self.id);
            }
        }
    }
}

/// An entry in the answer table: a call we received, not yet finished.
struct AnswerEntry {
    return_has_been_sent: bool,

    /// The outcome, kept after the `Return` goes out so that late pipelined
    /// targets and `receiverAnswer` descriptors can be resolved against it.
    result: Option<Result<Rc<Payload>, Error>>,

    /// Calls pipelined on this answer before it returned.
    pending: Queue<Slots<PendingCall>>,

    /// Queued clients handed out for `receiverAnswer` descriptors naming
    /// this answer before it returned.
    pending_clients: Vec<(Rc<RefCell<queued::ClientInner>>, Vec<PipelineOp>)>,

    /// Dropping this cancels the dispatched call.
    call_canceler: Option<oneshot::Sender<()>>,

    result_exports: Vec<ExportId>,
}

impl AnswerEntry {
    fn new() -> Self {
        Self {
            return_has_been_sent: false,
            result: None,
            pending: Queue::with_capacity(queued::CALL_QUEUE_CAPACITY),
            pending_clients: Vec::new(),
            call_canceler: None,
            result_exports: Vec::new(),
        }
    }
}

struct PendingCall {
    answer_id: AnswerId,
    transform: Vec<PipelineOp>,
    interface_id: u64,
    method_id: u16,
    params: Payload,
}

struct Export {
    refcount: u32,
    client: Client,
}

struct Embargo {
    fulfiller: Option<oneshot::Sender<Result<(), Error>>>,
}

/// Reports background task failures by tearing down the connection.
struct ConnectionErrorHandler {
    connection_state: Weak<ConnectionState>,
}

impl TaskReaper<Error> for ConnectionErrorHandler {
    fn task_failed(&mut self, error: Error) {
        if let Some(state) = self.connection_state.upgrade() {
            ConnectionState::disconnect(&state, error);
        }
    }
}

pub(crate) struct ConnectionState {
    bootstrap_cap: Client,
    registry: Rc<Registry>,

    exports: RefCell<ExportTable<Export>>,
    questions: RefCell<ExportTable<Question>>,
    answers: RefCell<HashMap<AnswerId, AnswerEntry>>,
    imports: RefCell<HashMap<ImportId, Weak<RefCell<ImportClient>>>>,
    embargoes: RefCell<ExportTable<Embargo>>,

    /// Maps capability identity to export id, so re-sending the same cap
    /// bumps a refcount instead of minting a new export.
    exports_by_cap: RefCell<HashMap<usize, ExportId>>,

    tasks: RefCell<Option<TaskSetHandle<Error>>>,
    connection: RefCell<Result<Box<dyn Transport>, Error>>,
    disconnect_fulfiller: RefCell<Option<oneshot::Sender<Promise<(), Error>>>>,
}

impl ConnectionState {
    pub(crate) fn new(
        connection: Box<dyn Transport>,
        bootstrap_cap: Client,
        registry: Rc<Registry>,
        disconnect_fulfiller: oneshot::Sender<Promise<(), Error>>,
    ) -> (Rc<Self>, TaskSet<Error>, TaskSetHandle<Error>) {
        let state = Rc::new(ConnectionState {
            bootstrap_cap,
            registry,
            exports: RefCell::new(ExportTable::new()),
            questions: RefCell::new(ExportTable::new()),
            answers: RefCell::new(HashMap::new()),
            imports: RefCell::new(HashMap::new()),
            embargoes: RefCell::new(ExportTable::new()),
            exports_by_cap: RefCell::new(HashMap::new()),
            tasks: RefCell::new(None),
            connection: RefCell::new(Ok(connection)),
            disconnect_fulfiller: RefCell::new(Some(disconnect_fulfiller)),
        });
        let (mut handle, tasks) = TaskSet::new(Box::new(ConnectionErrorHandler {
            connection_state: Rc::downgrade(&state),
        }));
        *state.tasks.borrow_mut() = Some(handle.clone());
        handle.add(Self::message_loop(Rc::downgrade(&state)));
        (state, tasks, handle)
    }

    fn brand(state: &Rc<ConnectionState>) -> usize {
        Rc::as_ptr(state) as usize
    }

    fn add_task<F>(&self, task: F)
    where
        F: Future<Output = Result<(), Error>> + 'static,
    {
        if let Some(handle) = &mut *self.tasks.borrow_mut() {
            handle.add(task);
        }
    }

    fn send_message(state: &Rc<ConnectionState>, message: Message) {
        let promise = match *state.connection.borrow_mut() {
            Err(_) => return,
            Ok(ref mut connection) => connection.send_message(message),
        };
        // A failed write tears the connection down through the task reaper.
        state.add_task(promise);
    }

    fn message_loop(weak_state: Weak<ConnectionState>) -> Promise<(), Error> {
        let Some(state) = weak_state.upgrade() else {
            return Promise::err(Error::disconnected(
                "connection state was dropped".to_string(),
            ));
        };
        let receive = match *state.connection.borrow_mut() {
            Err(ref e) => return Promise::err(e.clone()),
            Ok(ref mut connection) => connection.recv_message(),
        };
        drop(state);
        Promise::from_future(async move {
            match receive.await? {
                Some(message) => {
                    ConnectionState::handle_message(&weak_state, message)?;
                    if let Some(state) = weak_state.upgrade() {
                        state.add_task(ConnectionState::message_loop(weak_state.clone()));
                    }
                    Ok(())
                }
                None => Err(Error::disconnected("Peer disconnected.".to_string())),
            }
        })
    }

    fn handle_message(weak_state: &Weak<ConnectionState>, message: Message) -> Result<(), Error> {
        let Some(state) = weak_state.upgrade() else {
            return Ok(());
        };
        match message {
            Message::Unimplemented(inner) => Self::handle_unimplemented(&state, *inner),
            Message::Abort(e) => Err(Error {
                kind: ErrorKind::Disconnected,
                description: format!("Peer aborted the connection: {}", e.description),
            }),
            Message::Bootstrap { question_id } => Self::handle_bootstrap(&state, question_id),
            Message::Call {
                question_id,
                target,
                interface_id,
                method_id,
                params,
            } => Self::handle_call(&state, question_id, target, interface_id, method_id, params),
            Message::Return {
                answer_id,
                release_param_caps,
                body,
            } => Self::handle_return(&state, answer_id, release_param_caps, body),
            Message::Finish {
                question_id,
                release_result_caps,
            } => Self::handle_finish(&state, question_id, release_result_caps),
            Message::Release {
                id,
                reference_count,
            } => Self::release_export(&state, id, reference_count),
            Message::Disembargo { target, context } => {
                Self::handle_disembargo(&state, target, context)
            }
        }
    }

    fn handle_unimplemented(state: &Rc<ConnectionState>, inner: Message) -> Result<(), Error> {
        let question_id = match inner {
            Message::Call { question_id, .. } | Message::Bootstrap { question_id } => question_id,
            _ => {
                return Err(Error::failed(
                    "Peer did not implement required RPC message type.".to_string(),
                ))
            }
        };
        // The peer refused the call without creating an answer entry.
        let (self_ref, param_exports) = {
            let mut questions = state.questions.borrow_mut();
            match questions.find(question_id) {
                None => {
                    return Err(Error::failed(
                        "Invalid question ID in 'Unimplemented' message.".to_string(),
                    ))
                }
                Some(question) => {
                    question.is_awaiting_return = false;
                    question.skip_finish = true;
                    (
                        question.self_ref.clone(),
                        mem::take(&mut question.param_exports),
                    )
                }
            }
        };
        // The params never reached the peer's tables, so nobody will send a
        // Release for their caps.
        for export_id in param_exports {
            Self::release_export(state, export_id, 1)?;
        }
        match self_ref.and_then(|weak| weak.upgrade()) {
            Some(question_ref) => question_ref.borrow_mut().reject(Error::unimplemented(
                "Remote vat does not implement the called method.".to_string(),
            )),
            None => {
                state.questions.borrow_mut().erase(question_id);
            }
        }
        Ok(())
    }

    fn handle_bootstrap(state: &Rc<ConnectionState>, answer_id: AnswerId) -> Result<(), Error> {
        if state.answers.borrow().contains_key(&answer_id) {
            return Err(Error::failed(
                "Duplicate question ID received from peer.".to_string(),
            ));
        }
        state.answers.borrow_mut().insert(answer_id, AnswerEntry::new());

        let mut payload = Payload::new();
        payload.content = crate::payload::Ptr::Capability(0);
        payload.cap_table.push(Some(state.bootstrap_cap.clone()));
        Self::fulfill_answer(state, answer_id, Rc::new(payload));
        Ok(())
    }

    fn handle_call(
        state: &Rc<ConnectionState>,
        answer_id: AnswerId,
        target: MessageTarget,
        interface_id: u64,
        method_id: u16,
        params: WirePayload,
    ) -> Result<(), Error> {
        if !state.registry.contains(interface_id, method_id) {
            // Refuse without creating an answer entry; the caller recovers
            // from the echo.
            Self::send_message(
                state,
                Message::Unimplemented(Box::new(Message::Call {
                    question_id: answer_id,
                    target,
                    interface_id,
                    method_id,
                    params,
                })),
            );
            return Ok(());
        }
        if let MessageTarget::PromisedAnswer { question_id, .. } = &target {
            if *question_id == answer_id {
                return Err(Error::failed(
                    "'Call' target points at the call's own answer.".to_string(),
                ));
            }
        }
        if state.answers.borrow().contains_key(&answer_id) {
            return Err(Error::failed(
                "Duplicate question ID received from peer.".to_string(),
            ));
        }
        let params = Self::receive_payload(state, params)?;
        state.answers.borrow_mut().insert(answer_id, AnswerEntry::new());

        match target {
            MessageTarget::ImportedCap(export_id) => {
                let client = match state.exports.borrow_mut().find(export_id) {
                    Some(export) => export.client.clone(),
                    None => {
                        return Err(Error::failed(
                            "Message target is not a current export ID.".to_string(),
                        ))
                    }
                };
                Self::dispatch_call(state, answer_id, client, interface_id, method_id, params);
            }
            MessageTarget::PromisedAnswer {
                question_id: target_qid,
                transform,
            } => {
                let ready: Option<Result<Client, Error>> = {
                    let answers = state.answers.borrow();
                    let Some(entry) = answers.get(&target_qid) else {
                        return Err(Error::failed(
                            "'Call' target answer does not exist.".to_string(),
                        ));
                    };
                    entry.result.as_ref().map(|result| match result {
                        Ok(payload) => payload.pipelined_cap(&transform),
                        Err(e) => Err(e.clone()),
                    })
                };
                match ready {
                    Some(Ok(client)) => {
                        Self::dispatch_call(state, answer_id, client, interface_id, method_id, params);
                    }
                    Some(Err(e)) => Self::reject_answer(state, answer_id, e),
                    None => {
                        let pending = PendingCall {
                            answer_id,
                            transform,
                            interface_id,
                            method_id,
                            params,
                        };
                        let overflowed = match state.answers.borrow_mut().get_mut(&target_qid) {
                            Some(entry) => entry.pending.push_value(pending).is_err(),
                            None => true,
                        };
                        if overflowed {
                            Self::reject_answer(
                                state,
                                answer_id,
                                Error::overloaded(
                                    "too many calls pipelined on a single answer".to_string(),
                                ),
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Runs `client.call` and routes the outcome into the answer entry. The
    /// task is abandoned if a `Finish` cancels the answer first.
    fn dispatch_call(
        state: &Rc<ConnectionState>,
        answer_id: AnswerId,
        client: Client,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) {
        let (canceler, cancel_receiver) = oneshot::channel::<()>();
        {
            let mut answers = state.answers.borrow_mut();
            match answers.get_mut(&answer_id) {
                None => return, // already finished
                Some(entry) => entry.call_canceler = Some(canceler),
            }
        }
        let answer = client.call(Call::new(interface_id, method_id, params));
        let weak_state = Rc::downgrade(state);
        let completion = async move {
            let result = answer.promise.await;
            if let Some(state) = weak_state.upgrade() {
                match result {
                    Ok(response) => {
                        ConnectionState::fulfill_answer(&state, answer_id, response.payload_rc());
                    }
                    Err(e) => ConnectionState::reject_answer(&state, answer_id, e),
                }
            }
            Ok::<(), Error>(())
        };
        state.add_task(future::select(Box::pin(completion), cancel_receiver).map(|_| Ok(())));
    }

    fn fulfill_answer(state: &Rc<ConnectionState>, answer_id: AnswerId, payload: Rc<Payload>) {
        {
            let answers = state.answers.borrow();
            match answers.get(&answer_id) {
                None => return,
                Some(entry) if entry.return_has_been_sent => return,
                Some(_) => (),
            }
        }
        let (cap_table, exports) = Self::write_descriptors(state, &payload.cap_table);
        Self::send_message(
            state,
            Message::Return {
                answer_id,
                release_param_caps: false,
                body: ReturnBody::Results(WirePayload {
                    content: payload.content.clone(),
                    cap_table,
                }),
            },
        );
        let (pending, pending_clients) = {
            let mut answers = state.answers.borrow_mut();
            let Some(entry) = answers.get_mut(&answer_id) else {
                return;
            };
            entry.return_has_been_sent = true;
            entry.result = Some(Ok(payload.clone()));
            entry.result_exports = exports;
            (
                mem::replace(&mut entry.pending, Queue::with_capacity(0)),
                mem::take(&mut entry.pending_clients),
            )
        };

        for (client, ops) in pending_clients {
            queued::ClientInner::resolve(&client, payload.pipelined_cap(&ops));
        }
        Self::drain_pending_calls(state, pending, &payload);
    }

    /// Releases calls that were pipelined on an answer, now that the answer's
    /// results are known. Calls aimed at the same capability share one queued
    /// client, so their order is kept while distinct targets proceed
    /// independently.
    fn drain_pending_calls(
        state: &Rc<ConnectionState>,
        mut pending: Queue<Slots<PendingCall>>,
        payload: &Rc<Payload>,
    ) {
        let mut groups: Vec<(usize, Client, Rc<RefCell<queued::ClientInner>>)> = Vec::new();
        while let Some(call) = pending.pop_value() {
            let cap = match payload.pipelined_cap(&call.transform) {
                Ok(cap) => cap,
                Err(e) => {
                    Self::reject_answer(state, call.answer_id, e);
                    continue;
                }
            };
            let key = cap.unwrap_resolved().key();
            let queued_client = match groups.iter().find(|(k, _, _)| *k == key) {
                Some((_, _, q)) => q.clone(),
                None => {
                    let q = queued::ClientInner::new(None);
                    groups.push((key, cap, q.clone()));
                    q
                }
            };
            Self::dispatch_call(
                state,
                call.answer_id,
                Client::from(queued_client),
                call.interface_id,
                call.method_id,
                call.params,
            );
        }
        for (_, cap, queued_client) in groups {
            queued::ClientInner::resolve(&queued_client, Ok(cap));
        }
    }

    fn reject_answer(state: &Rc<ConnectionState>, answer_id: AnswerId, error: Error) {
        {
            let answers = state.answers.borrow();
            match answers.get(&answer_id) {
                None => return,
                Some(entry) if entry.return_has_been_sent => return,
                Some(_) => (),
            }
        }
        Self::send_message(
            state,
            Message::Return {
                answer_id,
                release_param_caps: false,
                body: ReturnBody::Exception(error.clone()),
            },
        );
        let (pending, pending_clients) = {
            let mut answers = state.answers.borrow_mut();
            let Some(entry) = answers.get_mut(&answer_id) else {
                return;
            };
            entry.return_has_been_sent = true;
            entry.result = Some(Err(error.clone()));
            (
                mem::replace(&mut entry.pending, Queue::with_capacity(0)),
                mem::take(&mut entry.pending_clients),
            )
        };
        for (client, _) in pending_clients {
            queued::ClientInner::reject(&client, error.clone());
        }
        let mut pending = pending;
        while let Some(call) = pending.pop_value() {
            Self::reject_answer(state, call.answer_id, error.clone());
        }
    }

    fn handle_return(
        state: &Rc<ConnectionState>,
        answer_id: AnswerId,
        release_param_caps: bool,
        body: ReturnBody,
    ) -> Result<(), Error> {
        let (self_ref, param_exports, method) = {
            let mut questions = state.questions.borrow_mut();
            match questions.find(answer_id) {
                None => {
                    return Err(Error::failed(
                        "Invalid question ID in 'Return' message.".to_string(),
                    ))
                }
                Some(question) => {
                    if !question.is_awaiting_return {
                        return Err(Error::failed(
                            "Duplicate 'Return' for question ID.".to_string(),
                        ));
                    }
                    question.is_awaiting_return = false;
                    let param_exports = if release_param_caps {
                        mem::take(&mut question.param_exports)
                    } else {
                        Vec::new()
                    };
                    (question.self_ref.clone(), param_exports, question.method)
                }
            }
        };
        for export_id in param_exports {
            Self::release_export(state, export_id, 1)?;
        }
        match self_ref.and_then(|weak| weak.upgrade()) {
            None => {
                // Canceled: our Finish already asked the peer to release the
                // result caps, so just retire the id.
                state.questions.borrow_mut().erase(answer_id);
            }
            Some(question_ref) => match body {
                ReturnBody::Results(wire) => {
                    let payload = Self::receive_payload(state, wire)?;
                    question_ref
                        .borrow_mut()
                        .fulfill(Response::new(Rc::new(payload)));
                }
                ReturnBody::Exception(e) => {
                    let e = match method {
                        Some((interface_id, method_id)) => Error {
                            kind: e.kind,
                            description: format!(
                                "{} (method {method_id} of interface {interface_id:#x})",
                                e.description
                            ),
                        },
                        None => e,
                    };
                    question_ref.borrow_mut().reject(e)
                }
            },
        }
        Ok(())
    }

    fn handle_finish(
        state: &Rc<ConnectionState>,
        question_id: QuestionId,
        release_result_caps: bool,
    ) -> Result<(), Error> {
        let entry = state.answers.borrow_mut().remove(&question_id);
        let Some(mut entry) = entry else {
            return Err(Error::failed(
                "Invalid question ID in 'Finish' message.".to_string(),
            ));
        };
        if release_result_caps {
            for export_id in mem::take(&mut entry.result_exports) {
                Self::release_export(state, export_id, 1)?;
            }
        }
        // Stops the dispatched call, if it is still running.
        drop(entry.call_canceler.take());

        if !entry.return_has_been_sent {
            let canceled = Error::failed("Canceled by requester.".to_string());
            Self::send_message(
                state,
                Message::Return {
                    answer_id: question_id,
                    release_param_caps: false,
                    body: ReturnBody::Exception(canceled.clone()),
                },
            );
            for (client, _) in entry.pending_clients {
                queued::ClientInner::reject(&client, canceled.clone());
            }
            while let Some(call) = entry.pending.pop_value() {
                Self::reject_answer(state, call.answer_id, canceled.clone());
            }
        }
        Ok(())
    }

    fn release_export(
        state: &Rc<ConnectionState>,
        id: ExportId,
        refs: u32,
    ) -> Result<(), Error> {
        let client_to_drop = {
            let mut exports = state.exports.borrow_mut();
            let Some(export) = exports.find(id) else {
                return Err(Error::failed(
                    "Invalid export ID in 'Release' message.".to_string(),
                ));
            };
            if refs > export.refcount {
                log::warn!(
                    "peer released export {id} {refs} times, but only {} references were sent",
                    export.refcount
                );
                export.refcount = 0;
            } else {
                export.refcount -= refs;
            }
            if export.refcount == 0 {
                let client = export.client.clone();
                exports.erase(id);
                Some(client)
            } else {
                None
            }
        };
        if let Some(client) = client_to_drop {
            state.exports_by_cap.borrow_mut().remove(&client.key());
        }
        Ok(())
    }

    fn handle_disembargo(
        state: &Rc<ConnectionState>,
        target: MessageTarget,
        context: DisembargoContext,
    ) -> Result<(), Error> {
        match context {
            DisembargoContext::SenderLoopback(embargo_id) => {
                let resolved = Self::get_message_target(state, &target)?.unwrap_resolved();
                if resolved.brand() != Self::brand(state) {
                    return Err(Error::failed(
                        "'Disembargo' of type 'senderLoopback' sent to an object that does \
                         not point back to the sender."
                            .to_string(),
                    ));
                }
                let echo_target = Self::write_target(&resolved)?;
                Self::send_message(
                    state,
                    Message::Disembargo {
                        target: echo_target,
                        context: DisembargoContext::ReceiverLoopback(embargo_id),
                    },
                );
                Ok(())
            }
            DisembargoContext::ReceiverLoopback(embargo_id) => {
                match state.embargoes.borrow_mut().erase(embargo_id) {
                    Some(mut embargo) => {
                        if let Some(fulfiller) = embargo.fulfiller.take() {
                            let _ = fulfiller.send(Ok(()));
                        }
                        Ok(())
                    }
                    None => Err(Error::failed(
                        "Invalid embargo ID in 'Disembargo.context.receiverLoopback'."
                            .to_string(),
                    )),
                }
            }
        }
    }

    fn get_message_target(
        state: &Rc<ConnectionState>,
        target: &MessageTarget,
    ) -> Result<Client, Error> {
        match target {
            MessageTarget::ImportedCap(id) => state
                .exports
                .borrow_mut()
                .find(*id)
                .map(|export| export.client.clone())
                .ok_or_else(|| {
                    Error::failed("Message target is not a current export ID.".to_string())
                }),
            MessageTarget::PromisedAnswer {
                question_id,
                transform,
            } => {
                let answers = state.answers.borrow();
                match answers.get(question_id) {
                    None => Err(Error::failed(
                        "Message target names an answer that does not exist.".to_string(),
                    )),
                    Some(entry) => match &entry.result {
                        Some(Ok(payload)) => payload.pipelined_cap(transform),
                        Some(Err(e)) => Err(e.clone()),
                        None => Err(Error::failed(
                            "Message target names an answer that has not returned yet."
                                .to_string(),
                        )),
                    },
                }
            }
        }
    }

    /// How we would name `client` as a call target when talking to the peer.
    fn write_target(client: &Client) -> Result<MessageTarget, Error> {
        match &client.variant {
            ClientVariant::Import(inner) => {
                Ok(MessageTarget::ImportedCap(inner.borrow().import_id))
            }
            ClientVariant::Pipeline(inner) => {
                let inner = inner.borrow();
                match &inner.question_ref {
                    Some(question_ref) => Ok(MessageTarget::PromisedAnswer {
                        question_id: question_ref.borrow().id,
                        transform: inner.ops.clone(),
                    }),
                    None => Err(Error::failed(
                        "cannot address a capability whose question was finished".to_string(),
                    )),
                }
            }
            _ => Err(Error::failed(
                "target capability is not hosted by the peer".to_string(),
            )),
        }
    }

    fn write_descriptors(
        state: &Rc<ConnectionState>,
        caps: &[Option<Client>],
    ) -> (Vec<CapDescriptor>, Vec<ExportId>) {
        let mut exports = Vec::new();
        let mut table = Vec::with_capacity(caps.len());
        for cap in caps {
            match cap {
                None => table.push(CapDescriptor::None),
                Some(client) => {
                    let (descriptor, export_id) = Self::write_descriptor(state, client);
                    table.push(descriptor);
                    if let Some(export_id) = export_id {
                        exports.push(export_id);
                    }
                }
            }
        }
        (table, exports)
    }

    fn write_descriptor(
        state: &Rc<ConnectionState>,
        client: &Client,
    ) -> (CapDescriptor, Option<ExportId>) {
        let client = client.unwrap_resolved();
        match &client.variant {
            ClientVariant::Import(inner) => {
                let inner = inner.borrow();
                if inner.connection_ptr() == Self::brand(state) {
                    return (CapDescriptor::ReceiverHosted(inner.import_id), None);
                }
            }
            ClientVariant::Pipeline(inner) => {
                let inner = inner.borrow();
                if inner.connection_ptr() == Self::brand(state) {
                    if let Some(question_ref) = &inner.question_ref {
                        return (
                            CapDescriptor::ReceiverAnswer {
                                question_id: question_ref.borrow().id,
                                transform: inner.ops.clone(),
                            },
                            None,
                        );
                    }
                }
            }
            _ => (),
        }

        // Hosted on our side (or proxied from a third connection): export it.
        let is_promise = matches!(
            &client.variant,
            ClientVariant::Queued(_) | ClientVariant::Pipeline(_)
        );
        let key = client.key();
        let existing = state.exports_by_cap.borrow().get(&key).copied();
        let export_id = match existing {
            Some(export_id) => {
                if let Some(export) = state.exports.borrow_mut().find(export_id) {
                    export.refcount += 1;
                }
                export_id
            }
            None => {
                let export_id = state.exports.borrow_mut().push(Export {
                    refcount: 1,
                    client: client.clone(),
                });
                state.exports_by_cap.borrow_mut().insert(key, export_id);
                export_id
            }
        };
        let descriptor = if is_promise {
            CapDescriptor::SenderPromise(export_id)
        } else {
            CapDescriptor::SenderHosted(export_id)
        };
        (descriptor, Some(export_id))
    }

    fn receive_payload(
        state: &Rc<ConnectionState>,
        wire: WirePayload,
    ) -> Result<Payload, Error> {
        let mut cap_table = Vec::with_capacity(wire.cap_table.len());
        for descriptor in wire.cap_table {
            cap_table.push(Self::receive_cap(state, descriptor)?);
        }
        Ok(Payload {
            content: wire.content,
            cap_table,
        })
    }

    fn receive_cap(
        state: &Rc<ConnectionState>,
        descriptor: CapDescriptor,
    ) -> Result<Option<Client>, Error> {
        match descriptor {
            CapDescriptor::None => Ok(None),
            CapDescriptor::SenderHosted(id) | CapDescriptor::SenderPromise(id) => {
                Ok(Some(Self::import(state, id)))
            }
            CapDescriptor::ReceiverHosted(id) => match state.exports.borrow_mut().find(id) {
                Some(export) => Ok(Some(export.client.clone())),
                None => Err(Error::failed(
                    "'CapDescriptor.receiverHosted' is not a current export ID.".to_string(),
                )),
            },
            CapDescriptor::ReceiverAnswer {
                question_id,
                transform,
            } => {
                let ready = {
                    let answers = state.answers.borrow();
                    match answers.get(&question_id) {
                        None => {
                            return Err(Error::failed(
                                "'CapDescriptor.receiverAnswer' does not name a current answer."
                                    .to_string(),
                            ))
                        }
                        Some(entry) => entry.result.clone(),
                    }
                };
                match ready {
                    Some(Ok(payload)) => Ok(Some(
                        payload
                            .pipelined_cap(&transform)
                            .unwrap_or_else(broken::new_client),
                    )),
                    Some(Err(e)) => Ok(Some(broken::new_client(e))),
                    None => {
                        let client = queued::ClientInner::new(None);
                        if let Some(entry) = state.answers.borrow_mut().get_mut(&question_id) {
                            entry.pending_clients.push((client.clone(), transform));
                        }
                        Ok(Some(Client::from(client)))
                    }
                }
            }
        }
    }

    /// Deduplicates imports: receiving the same id again returns the same
    /// proxy, with another remote ref recorded for the eventual `Release`.
    fn import(state: &Rc<ConnectionState>, import_id: ImportId) -> Client {
        let mut imports = state.imports.borrow_mut();
        if let Some(weak) = imports.get(&import_id) {
            if let Some(existing) = weak.upgrade() {
                existing.borrow_mut().add_remote_ref();
                return Client::from(existing);
            }
        }
        let client = Rc::new(RefCell::new(ImportClient {
            connection_state: state.clone(),
            import_id,
            remote_ref_count: 1,
            closed: false,
        }));
        imports.insert(import_id, Rc::downgrade(&client));
        Client::from(client)
    }

    pub(crate) fn bootstrap(state: &Rc<ConnectionState>) -> Client {
        if let Err(e) = &*state.connection.borrow() {
            return broken::new_client(e.clone());
        }
        let question_id = state.questions.borrow_mut().push(Question::new());
        Self::send_message(state, Message::Bootstrap { question_id });
        Self::question_answer(state, question_id).pipeline.as_cap()
    }

    fn send_call(
        state: &Rc<ConnectionState>,
        target: MessageTarget,
        interface_id: u64,
        method_id: u16,
        params: Payload,
    ) -> Answer {
        if let Err(e) = &*state.connection.borrow() {
            return Answer::error(e.clone());
        }
        let (cap_table, param_exports) = Self::write_descriptors(state, &params.cap_table);
        let question_id = state.questions.borrow_mut().push(Question {
            param_exports,
            method: Some((interface_id, method_id)),
            ..Question::new()
        });
        Self::send_message(
            state,
            Message::Call {
                question_id,
                target,
                interface_id,
                method_id,
                params: WirePayload {
                    content: params.content,
                    cap_table,
                },
            },
        );
        Self::question_answer(state, question_id)
    }

    /// Builds the caller-facing handles for a question that was just sent.
    fn question_answer(state: &Rc<ConnectionState>, question_id: QuestionId) -> Answer {
        let (fulfiller, receiver) = oneshot::channel::<Result<Response, Error>>();
        let question_ref = Rc::new(RefCell::new(QuestionRef {
            connection_state: state.clone(),
            id: question_id,
            fulfiller: Some(fulfiller),
        }));
        if let Some(question) = state.questions.borrow_mut().find(question_id) {
            question.self_ref = Some(Rc::downgrade(&question_ref));
        }

        let question_ref_for_promise = question_ref.clone();
        let response_promise = Promise::from_future(async move {
            let result = receiver.await.map_err(crate::canceled_to_error)?;
            // The question (and its id) stays open until this handle goes away.
            drop(question_ref_for_promise);
            result
        })
        .shared();

        let pipeline = Pipeline::new(state, question_ref, response_promise.clone());
        Answer::new(
            Promise::from_future(response_promise),
            capability::Pipeline::new(Rc::new(pipeline)),
        )
    }

    fn disconnect(state: &Rc<ConnectionState>, error: Error) {
        if state.connection.borrow().is_err() {
            return;
        }

        // Pull everything out of the tables before touching any of it, since
        // client destructors reach back into these same tables.
        let exported_clients: Vec<Client> = state
            .exports
            .borrow_mut()
            .drain()
            .map(|export| export.client)
            .collect();
        state.exports_by_cap.borrow_mut().clear();

        let question_refs: Vec<Rc<RefCell<QuestionRef>>> = state
            .questions
            .borrow_mut()
            .iter_mut()
            .filter(|question| question.is_awaiting_return)
            .filter_map(|question| question.self_ref.as_ref().and_then(|weak| weak.upgrade()))
            .collect();

        let answers: Vec<AnswerEntry> = state
            .answers
            .borrow_mut()
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        let embargoes: Vec<Embargo> = state.embargoes.borrow_mut().drain().collect();
        state.imports.borrow_mut().clear();

        // Take the transport out; everything after this point sees the
        // connection as gone.
        let shutdown_promise = {
            let mut connection = state.connection.borrow_mut();
            match mem::replace(&mut *connection, Err(error.clone())) {
                Err(_) => return,
                Ok(mut transport) => {
                    if error.kind != ErrorKind::Disconnected {
                        let send = transport.send_message(Message::Abort(error.clone()));
                        let shutdown_error = error.clone();
                        Promise::from_future(async move {
                            let _ = send.await;
                            transport.shutdown(Err(shutdown_error)).await
                        })
                    } else {
                        let shutdown_error = error.clone();
                        Promise::from_future(
                            async move { transport.shutdown(Err(shutdown_error)).await },
                        )
                    }
                }
            }
        };

        for question_ref in question_refs {
            question_ref.borrow_mut().reject(error.clone());
        }
        for mut entry in answers {
            drop(entry.call_canceler.take());
            for (client, _) in mem::take(&mut entry.pending_clients) {
                queued::ClientInner::reject(&client, error.clone());
            }
        }
        for mut embargo in embargoes {
            if let Some(fulfiller) = embargo.fulfiller.take() {
                let _ = fulfiller.send(Err(error.clone()));
            }
        }
        drop(exported_clients);

        if let Some(fulfiller) = state.disconnect_fulfiller.borrow_mut().take() {
            let _ = fulfiller.send(shutdown_promise);
        }
    }
}

/// A capability hosted by the peer, addressed by import id.
pub(crate) struct ImportClient {
    connection_state: Rc<ConnectionState>,
    import_id: ImportId,

    /// How many times the peer has sent us this capability; the eventual
    /// `Release` returns the full count.
    remote_ref_count: u32,

    closed: bool,
}

impl ImportClient {
    fn add_remote_ref(&mut self) {
        self.remote_ref_count += 1;
    }

    pub(crate) fn call(this: &Rc<RefCell<ImportClient>>, call: Call) -> Answer {
        let (state, import_id, closed) = {
            let inner = this.borrow();
            (inner.connection_state.clone(), inner.import_id, inner.closed)
        };
        if closed {
            return Answer::error(Error::failed("capability was closed".to_string()));
        }
        ConnectionState::send_call(
            &state,
            MessageTarget::ImportedCap(import_id),
            call.interface_id,
            call.method_id,
            call.params,
        )
    }

    /// Sends the peer a `Release` covering every remote ref and drops the
    /// table entry. Idempotent.
    pub(crate) fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let state = self.connection_state.clone();
        state.imports.borrow_mut().remove(&self.import_id);
        if state.connection.borrow().is_ok() && self.remote_ref_count > 0 {
            ConnectionState::send_message(
                &state,
                Message::Release {
                    id: self.import_id,
                    reference_count: self.remote_ref_count,
                },
            );
        }
        self.remote_ref_count = 0;
    }

    pub(crate) fn connection_ptr(&self) -> usize {
        Rc::as_ptr(&self.connection_state) as usize
    }
}

impl Drop for ImportClient {
    fn drop(&mut self) {
        self.release();
    }
}

/// A capability expected in the results of one of our own questions. Calls
/// are sent to the peer as pipelined calls until the answer arrives.
pub(crate) struct PipelineClient {
    connection_state: Rc<ConnectionState>,
    question_ref: Option<Rc<RefCell<QuestionRef>>>,
    ops: Vec<PipelineOp>,
    pub(crate) redirect: Option<Client>,

    /// Whether any call was sent down the pipelined path. If so, switching to
    /// a locally-hosted replacement must be embargoed to keep call order.
    received_call: bool,
}

impl PipelineClient {
    pub(crate) fn call(this: &Rc<RefCell<PipelineClient>>, call: Call) -> Answer {
        if let Some(client) = this.borrow().redirect.clone() {
            return client.call(call);
        }
        let (state, target) = {
            let mut inner = this.borrow_mut();
            inner.received_call = true;
            let target = match &inner.question_ref {
                Some(question_ref) => MessageTarget::PromisedAnswer {
                    question_id: question_ref.borrow().id,
                    transform: inner.ops.clone(),
                },
                None => {
                    return Answer::error(Error::failed(
                        "question was already finished".to_string(),
                    ))
                }
            };
            (inner.connection_state.clone(), target)
        };
        ConnectionState::send_call(&state, target, call.interface_id, call.method_id, call.params)
    }

    fn resolve(this: &Rc<RefCell<PipelineClient>>, replacement: Result<Client, Error>) {
        if this.borrow().redirect.is_some() {
            return;
        }
        let (state, received_call, ops, question_ref) = {
            let inner = this.borrow();
            (
                inner.connection_state.clone(),
                inner.received_call,
                inner.ops.clone(),
                inner.question_ref.clone(),
            )
        };
        let is_error = replacement.is_err();
        let replacement = match replacement {
            Ok(client) => client,
            Err(e) => broken::new_client(e),
        };
        let replacement_brand = replacement.unwrap_resolved().brand();

        let needs_embargo = replacement_brand != ConnectionState::brand(&state)
            && received_call
            && !is_error
            && state.connection.borrow().is_ok();

        if needs_embargo {
            // The replacement does not live on this connection, so calls
            // already sent down the pipelined path may still be in flight.
            // Hold new calls until the peer echoes our Disembargo, proving
            // the old path has fully drained.
            let (fulfiller, receiver) = oneshot::channel::<Result<(), Error>>();
            let embargo_id = state.embargoes.borrow_mut().push(Embargo {
                fulfiller: Some(fulfiller),
            });
            let target = match &question_ref {
                Some(question_ref) => MessageTarget::PromisedAnswer {
                    question_id: question_ref.borrow().id,
                    transform: ops,
                },
                None => {
                    // No question to loop through; fall back to an immediate switch.
                    this.borrow_mut().redirect = Some(replacement);
                    return;
                }
            };
            ConnectionState::send_message(
                &state,
                Message::Disembargo {
                    target,
                    context: DisembargoContext::SenderLoopback(embargo_id),
                },
            );

            let queued_client = queued::ClientInner::new(None);
            let weak_queued = Rc::downgrade(&queued_client);
            let kept_question_ref = question_ref;
            state.add_task(receiver.map(move |result| {
                // The question must stay open until the embargo lifts.
                let _kept = kept_question_ref;
                let result = match result {
                    Ok(result) => result,
                    Err(_) => Err(Error::failed("embargo was canceled".to_string())),
                };
                if let Some(client) = weak_queued.upgrade() {
                    match result {
                        Ok(()) => queued::ClientInner::resolve(&client, Ok(replacement)),
                        Err(e) => queued::ClientInner::reject(&client, e),
                    }
                }
                Ok(())
            }));
            this.borrow_mut().redirect = Some(Client::from(queued_client));
        } else {
            this.borrow_mut().redirect = Some(replacement);
        }
        this.borrow_mut().question_ref = None;
    }

    pub(crate) fn connection_ptr(&self) -> usize {
        Rc::as_ptr(&self.connection_state) as usize
    }
}

enum PipelineVariant {
    Waiting(Rc<RefCell<QuestionRef>>),
    Resolved(Response),
    Broken(Error),
}

struct PipelineState {
    variant: PipelineVariant,
    clients_to_resolve: Vec<(Weak<RefCell<PipelineClient>>, Vec<PipelineOp>)>,
}

impl PipelineState {
    fn resolve(this: &Rc<RefCell<PipelineState>>, result: Result<Response, Error>) {
        let clients = mem::take(&mut this.borrow_mut().clients_to_resolve);
        for (weak_client, ops) in clients {
            if let Some(client) = weak_client.upgrade() {
                let resolution = match &result {
                    Ok(response) => response.get().pipelined_cap(&ops),
                    Err(e) => Err(e.clone()),
                };
                PipelineClient::resolve(&client, resolution);
            }
        }
        this.borrow_mut().variant = match result {
            Ok(response) => PipelineVariant::Resolved(response),
            Err(e) => PipelineVariant::Broken(e),
        };
    }
}

/// The pipeline over an outstanding question's eventual results.
struct Pipeline {
    state: Rc<RefCell<PipelineState>>,
}

impl Pipeline {
    fn new(
        connection_state: &Rc<ConnectionState>,
        question_ref: Rc<RefCell<QuestionRef>>,
        response: Shared<Promise<Response, Error>>,
    ) -> Self {
        let state = Rc::new(RefCell::new(PipelineState {
            variant: PipelineVariant::Waiting(question_ref),
            clients_to_resolve: Vec::new(),
        }));
        let weak_state = Rc::downgrade(&state);
        connection_state.add_task(response.map(move |result| {
            if let Some(state) = weak_state.upgrade() {
                PipelineState::resolve(&state, result);
            }
            Ok(())
        }));
        Self { state }
    }
}

impl PipelineHook for Pipeline {
    fn get_pipelined_cap(&self, ops: Vec<PipelineOp>) -> Client {
        let question_ref = match &self.state.borrow().variant {
            PipelineVariant::Resolved(response) => {
                return match response.get().pipelined_cap(&ops) {
                    Ok(client) => client,
                    Err(e) => broken::new_client(e),
                }
            }
            PipelineVariant::Broken(e) => return broken::new_client(e.clone()),
            PipelineVariant::Waiting(question_ref) => question_ref.clone(),
        };
        let connection_state = question_ref.borrow().connection_state.clone();
        let client = Rc::new(RefCell::new(PipelineClient {
            connection_state,
            question_ref: Some(question_ref),
            ops: ops.clone(),
            redirect: None,
            received_call: false,
        }));
        self.state
            .borrow_mut()
            .clients_to_resolve
            .push((Rc::downgrade(&client), ops));
        Client::from(client)
    }
}

/// Requests an orderly shutdown of a connection and resolves once the
/// transport is fully closed.
pub struct Disconnector {
    connection_state: Rc<RefCell<Option<Rc<ConnectionState>>>>,
}

impl Disconnector {
    pub(crate) fn new(connection_state: Rc<RefCell<Option<Rc<ConnectionState>>>>) -> Self {
        Self { connection_state }
    }

    fn disconnect(&self) {
        if let Some(state) = &*self.connection_state.borrow() {
            ConnectionState::disconnect(
                state,
                Error::disconnected("client requested disconnect".to_string()),
            );
        }
    }
}

impl Future for Disconnector {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        self.disconnect();
        if self.connection_state.borrow().is_some() {
            // The RpcSystem clears the state reference once shutdown finishes.
            cx.waker().wake_by_ref();
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MethodTable;
    use crate::{local, twoparty};

    fn test_state() -> (Rc<ConnectionState>, TaskSet<Error>, TaskSetHandle<Error>) {
        let (left, _right) = twoparty::pair();
        let (fulfiller, _receiver) = oneshot::channel();
        ConnectionState::new(
            Box::new(left),
            broken::new_client(Error::failed("no bootstrap interface".to_string())),
            Rc::new(Registry::new()),
            fulfiller,
        )
    }

    #[test]
    fn exports_deduplicate_by_identity() {
        let (state, _tasks, _handle) = test_state();
        let client = local::new_client(Rc::new(MethodTable::new(1)));

        let (d1, e1) = ConnectionState::write_descriptor(&state, &client);
        let (d2, e2) = ConnectionState::write_descriptor(&state, &client);
        let id = match (d1, d2) {
            (CapDescriptor::SenderHosted(a), CapDescriptor::SenderHosted(b)) => {
                assert_eq!(a, b);
                a
            }
            other => panic!("unexpected descriptors: {other:?}"),
        };
        assert_eq!(e1, Some(id));
        assert_eq!(e2, Some(id));

        // two refs were sent, so it takes two releases to retire the export
        ConnectionState::release_export(&state, id, 1).unwrap();
        assert!(state.exports.borrow_mut().find(id).is_some());
        ConnectionState::release_export(&state, id, 1).unwrap();
        assert!(state.exports.borrow_mut().find(id).is_none());
    }

    #[test]
    fn over_release_clamps_instead_of_underflowing() {
        let (state, _tasks, _handle) = test_state();
        let client = local::new_client(Rc::new(MethodTable::new(1)));
        let (_, export_id) = ConnectionState::write_descriptor(&state, &client);
        let export_id = export_id.unwrap();

        ConnectionState::release_export(&state, export_id, 5).unwrap();
        assert!(state.exports.borrow_mut().find(export_id).is_none());
        assert!(ConnectionState::release_export(&state, export_id, 1).is_err());
    }

    #[test]
    fn duplicate_return_is_rejected_without_panicking() {
        let (state, _tasks, _handle) = test_state();
        let question_id = state.questions.borrow_mut().push(Question::new());
        let answer = ConnectionState::question_answer(&state, question_id);

        ConnectionState::handle_return(
            &state,
            question_id,
            false,
            ReturnBody::Exception(Error::failed("first".to_string())),
        )
        .unwrap();

        // A second Return for the same question is the peer corrupting its
        // bookkeeping; it must fail the connection, not the process.
        let err = ConnectionState::handle_return(
            &state,
            question_id,
            false,
            ReturnBody::Exception(Error::failed("second".to_string())),
        )
        .unwrap_err();
        assert!(err.description.contains("Duplicate 'Return'"));
        drop(answer);
    }

    #[test]
    #[should_panic(expected = "settled twice")]
    fn settling_a_question_twice_panics() {
        let (state, _tasks, _handle) = test_state();
        let id = state.questions.borrow_mut().push(Question::new());
        let (fulfiller, _receiver) = oneshot::channel();
        let mut question_ref = QuestionRef {
            connection_state: state.clone(),
            id,
            fulfiller: Some(fulfiller),
        };
        question_ref.reject(Error::failed("first".to_string()));
        question_ref.reject(Error::failed("second".to_string()));
    }
}
