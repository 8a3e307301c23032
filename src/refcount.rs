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

//! Explicit reference counting over a capability.
//!
//! A `RefCount` owns the underlying client and drops it when the count hits
//! zero. Each `Ref` is one unit of the count. Closing a `Ref` is idempotent:
//! clones of the same `Ref` share a closed flag, so double-close never
//! decrements twice, and dropping an unclosed `Ref` closes it.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::capability::Client;
use crate::{broken, Error};

struct RefCount {
    client: RefCell<Option<Client>>,
    count: Cell<u32>,
}

impl RefCount {
    fn release(&self) {
        let count = self.count.get();
        debug_assert!(count > 0, "released more refs than were created");
        self.count.set(count - 1);
        if count == 1 {
            if let Some(client) = self.client.borrow_mut().take() {
                client.close();
            }
        }
    }

    fn target(&self) -> Client {
        match &*self.client.borrow() {
            Some(client) => client.clone(),
            None => broken::new_client(Error::failed(
                "capability was already released".to_string(),
            )),
        }
    }
}

struct RefToken {
    refcount: Rc<RefCount>,
    closed: Cell<bool>,
}

impl RefToken {
    fn close(&self) {
        if !self.closed.replace(true) {
            self.refcount.release();
        }
    }
}

impl Drop for RefToken {
    fn drop(&mut self) {
        self.close();
    }
}

/// One unit of a reference count. Clones share the unit; `add_ref` mints a
/// new one.
#[derive(Clone)]
pub struct Ref {
    token: Rc<RefToken>,
}

impl Ref {
    /// Wraps `client` in a fresh count of one.
    pub fn new(client: Client) -> Ref {
        let refcount = Rc::new(RefCount {
            client: RefCell::new(Some(client)),
            count: Cell::new(1),
        });
        Ref {
            token: Rc::new(RefToken {
                refcount,
                closed: Cell::new(false),
            }),
        }
    }

    /// Mints another unit of the count, as a client.
    pub fn add_ref(&self) -> Client {
        if self.token.closed.get() {
            return broken::new_client(Error::failed(
                "capability was already released".to_string(),
            ));
        }
        let refcount = self.token.refcount.clone();
        refcount.count.set(refcount.count.get() + 1);
        Client::from(Ref {
            token: Rc::new(RefToken {
                refcount,
                closed: Cell::new(false),
            }),
        })
    }

    pub fn close(&self) {
        self.token.close();
    }

    pub(crate) fn target(&self) -> Client {
        if self.token.closed.get() {
            return broken::new_client(Error::failed(
                "capability was already released".to_string(),
            ));
        }
        self.token.refcount.target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Answer, Call};
    use crate::payload::Payload;
    use crate::queued;
    use futures::executor::block_on;

    // A queued client never resolves on its own, so the underlying close (a
    // rejection) is observable through buffered calls.
    fn observable() -> (Client, Answer) {
        let inner = queued::ClientInner::new(None);
        let client = Client::from(inner);
        let answer = client.call(Call::new(0, 0, Payload::new()));
        (client, answer)
    }

    #[test]
    fn close_is_idempotent_per_ref() {
        // triple-closing the only unit must release exactly once
        let (client, answer) = observable();
        let r = Ref::new(client);
        r.close();
        r.close();
        r.clone().close();
        let err = block_on(answer.promise).unwrap_err();
        assert_eq!(err.description, "capability was closed");
    }

    #[test]
    fn target_survives_until_last_unit() {
        let (client, answer) = observable();
        let r = Ref::new(client);
        let second = r.add_ref();

        r.close();
        r.close();

        let mut answer_promise = answer.promise;
        block_on(async {
            assert!(futures::poll!(&mut answer_promise).is_pending());
        });

        second.close();
        let err = block_on(answer_promise).unwrap_err();
        assert_eq!(err.description, "capability was closed");

        // further use of the closed unit reports the release
        let err = block_on(second.call(Call::new(0, 0, Payload::new())).promise).unwrap_err();
        assert_eq!(err.description, "capability was already released");
    }

    #[test]
    fn drop_releases_the_unit() {
        let (_client, answer) = observable();
        {
            let r = Ref::new(_client.clone());
            let _ = r.add_ref();
            // both units dropped here
        }
        let err = block_on(answer.promise).unwrap_err();
        assert_eq!(err.description, "capability was closed");
    }

    #[test]
    fn add_ref_after_close_is_broken() {
        let (client, _answer) = observable();
        let r = Ref::new(client);
        r.close();
        let minted = r.add_ref();
        let err = block_on(minted.call(Call::new(0, 0, Payload::new())).promise).unwrap_err();
        assert_eq!(err.description, "capability was already released");
    }
}
