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

//! An object-capability RPC system with promise pipelining.
//!
//! Two vats exchange capabilities over a [`Transport`]. A capability is a
//! [`capability::Client`]; calling one yields an [`capability::Answer`]
//! whose pipeline lets you invoke methods on capabilities expected in the
//! results before the results exist, so dependent calls cost one round trip
//! instead of one each.
//!
//! Everything here is single-threaded: connection state lives in `Rc`s and
//! is driven by a local executor polling the [`RpcSystem`] future.
//!
//! ```no_run
//! use std::rc::Rc;
//! use futures::task::LocalSpawnExt;
//!
//! let mut pool = futures::executor::LocalPool::new();
//! let (client_end, server_end) = caprpc::twoparty::pair();
//! let registry = Rc::new(caprpc::registry::Registry::new());
//!
//! let mut client_system = caprpc::RpcSystem::new(Box::new(client_end), None, registry.clone());
//! let server_system = caprpc::RpcSystem::new(
//!     Box::new(server_end),
//!     Some(caprpc::broken::new_client(caprpc::Error::failed("demo".into()))),
//!     registry,
//! );
//!
//! let _remote = client_system.bootstrap();
//! let spawner = pool.spawner();
//! spawner.spawn_local(async move { let _ = client_system.await; }).unwrap();
//! spawner.spawn_local(async move { let _ = server_system.await; }).unwrap();
//! ```

use std::cell::RefCell;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::Future;

pub mod broken;
pub mod capability;
pub mod local;
pub mod message;
pub mod payload;
pub mod refcount;
pub mod registry;
pub mod twoparty;

mod error;
mod idgen;
mod queue;
mod queued;
mod rpc;
mod sender_queue;
mod task_set;

pub use crate::error::{Error, ErrorKind, Result};
pub use crate::rpc::Disconnector;

use crate::capability::{Client, Promise};
use crate::message::Message;
use crate::registry::Registry;
use crate::task_set::TaskSet;

/// Like `try!()`, but for functions that return a `Promise` rather than a
/// `Result`.
#[macro_export]
macro_rules! pry {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(error) => return $crate::capability::Promise::err(::std::convert::From::from(error)),
        }
    };
}

pub(crate) fn canceled_to_error(_e: oneshot::Canceled) -> Error {
    Error::failed("oneshot was canceled".to_string())
}

/// A bidirectional, ordered, reliable message channel to one other vat.
pub trait Transport {
    /// Queues `message` for delivery. The returned promise resolves once the
    /// message is on its way; failing it tears down the connection.
    fn send_message(&mut self, message: Message) -> Promise<(), Error>;

    /// Waits for the next incoming message. Resolves to `None` when the peer
    /// has cleanly shut down its end.
    fn recv_message(&mut self) -> Promise<Option<Message>, Error>;

    /// Flushes and closes this end. `result` says why.
    fn shutdown(&mut self, result: Result<()>) -> Promise<(), Error>;
}

/// One vat's view of a connection: drives the protocol as a future and hands
/// out the peer's bootstrap capability.
#[must_use = "an RpcSystem does nothing unless polled"]
pub struct RpcSystem {
    connection_state: Rc<RefCell<Option<Rc<rpc::ConnectionState>>>>,
    tasks: TaskSet<Error>,
}

impl RpcSystem {
    /// Starts speaking the protocol over `transport`. `bootstrap` is the
    /// capability offered to the peer's `bootstrap()` calls; incoming calls
    /// are dispatched through `registry`.
    pub fn new(
        transport: Box<dyn Transport>,
        bootstrap: Option<Client>,
        registry: Rc<Registry>,
    ) -> RpcSystem {
        let bootstrap_cap = bootstrap.unwrap_or_else(|| {
            broken::new_client(Error::failed(
                "vat does not expose a bootstrap interface".to_string(),
            ))
        });
        let (disconnect_fulfiller, disconnect_receiver) =
            oneshot::channel::<Promise<(), Error>>();
        let (state, tasks, mut handle) = rpc::ConnectionState::new(
            transport,
            bootstrap_cap,
            registry,
            disconnect_fulfiller,
        );
        let connection_state = Rc::new(RefCell::new(Some(state)));

        let state_ref = connection_state.clone();
        let mut terminate_handle = handle.clone();
        handle.add(async move {
            let shutdown_promise = match disconnect_receiver.await {
                Ok(promise) => promise,
                Err(_) => return Ok(()),
            };
            *state_ref.borrow_mut() = None;
            let result = match shutdown_promise.await {
                Err(e) if e.kind != ErrorKind::Disconnected => Err(e),
                _ => Ok(()),
            };
            terminate_handle.terminate(result);
            Ok(())
        });

        RpcSystem {
            connection_state,
            tasks,
        }
    }

    /// The peer's bootstrap capability. Usable immediately; calls pipeline
    /// until the peer responds.
    pub fn bootstrap(&mut self) -> Client {
        match &*self.connection_state.borrow() {
            Some(state) => rpc::ConnectionState::bootstrap(state),
            None => broken::new_client(Error::disconnected(
                "connection was shut down".to_string(),
            )),
        }
    }

    /// A handle that can shut the connection down from elsewhere.
    pub fn get_disconnector(&self) -> Disconnector {
        Disconnector::new(self.connection_state.clone())
    }
}

impl Future for RpcSystem {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().tasks).poll(cx)
    }
}
