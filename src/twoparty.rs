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

//! An in-process transport connecting exactly two vats.

use std::cell::RefCell;
use std::rc::Rc;

use futures::channel::mpsc;
use futures::StreamExt;

use crate::capability::Promise;
use crate::message::Message;
use crate::{Error, Transport};

/// One end of a connected pair.
pub struct PipeEnd {
    sender: Option<mpsc::UnboundedSender<Message>>,

    // Swapped out while a receive is in flight so the future can own it.
    receiver: Rc<RefCell<Option<mpsc::UnboundedReceiver<Message>>>>,
}

/// Creates two connected transport ends. Messages sent on one arrive, in
/// order, at the other.
pub fn pair() -> (PipeEnd, PipeEnd) {
    let (sender_a, receiver_a) = mpsc::unbounded();
    let (sender_b, receiver_b) = mpsc::unbounded();
    (
        PipeEnd {
            sender: Some(sender_a),
            receiver: Rc::new(RefCell::new(Some(receiver_b))),
        },
        PipeEnd {
            sender: Some(sender_b),
            receiver: Rc::new(RefCell::new(Some(receiver_a))),
        },
    )
}

impl Transport for PipeEnd {
    fn send_message(&mut self, message: Message) -> Promise<(), Error> {
        match &self.sender {
            Some(sender) => match sender.unbounded_send(message) {
                Ok(()) => Promise::ok(()),
                Err(_) => Promise::err(Error::disconnected("peer hung up".to_string())),
            },
            None => Promise::err(Error::disconnected("connection was shut down".to_string())),
        }
    }

    fn recv_message(&mut self) -> Promise<Option<Message>, Error> {
        let slot = self.receiver.clone();
        let mut receiver = match slot.borrow_mut().take() {
            Some(receiver) => receiver,
            None => {
                return Promise::err(Error::failed(
                    "another receive is already in progress".to_string(),
                ))
            }
        };
        Promise::from_future(async move {
            let message = receiver.next().await;
            *slot.borrow_mut() = Some(receiver);
            Ok(message)
        })
    }

    fn shutdown(&mut self, _result: crate::Result<()>) -> Promise<(), Error> {
        // Dropping the sender makes the peer's receive stream end cleanly.
        self.sender = None;
        Promise::ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn messages_arrive_in_order() {
        let (mut left, mut right) = pair();
        block_on(left.send_message(Message::Finish {
            question_id: 1,
            release_result_caps: true,
        }))
        .unwrap();
        block_on(left.send_message(Message::Finish {
            question_id: 2,
            release_result_caps: false,
        }))
        .unwrap();

        match block_on(right.recv_message()).unwrap() {
            Some(Message::Finish { question_id: 1, .. }) => (),
            other => panic!("unexpected message: {other:?}"),
        }
        match block_on(right.recv_message()).unwrap() {
            Some(Message::Finish { question_id: 2, .. }) => (),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn shutdown_ends_the_peer_stream() {
        let (mut left, mut right) = pair();
        block_on(left.shutdown(Ok(()))).unwrap();
        assert!(block_on(right.recv_message()).unwrap().is_none());

        let err = block_on(left.send_message(Message::Release {
            id: 0,
            reference_count: 1,
        }))
        .unwrap_err();
        assert_eq!(err.description, "connection was shut down");
    }
}
