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

use std::cell::{Cell, RefCell};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use futures::{Future, FutureExt};
use sha1::{Digest, Sha1};

use caprpc::capability::{Call, Client, Promise};
use caprpc::payload::Payload;
use caprpc::registry::{MethodTable, Registry};
use caprpc::{local, pry, Disconnector, ErrorKind, RpcSystem};

const TEST_INTERFACE: u64 = 0x8a5c_3f04_9bd1_e627;
const CALL_SEQUENCE_INTERFACE: u64 = 0xca11_0a0e_0000_0001;
const SHA1_INTERFACE: u64 = 0x5a1d_efa7_1b2c_3d4e;
const HANDLE_INTERFACE: u64 = 0x4a9d_0777_aaaa_bbbb;

const SUBTRACT: u16 = 0;
const ECHO: u16 = 1;
const GET_HANDLE: u16 = 2;
const GET_HANDLE_COUNT: u16 = 3;
const NEW_SHA1: u16 = 4;
const GET_TWO_CAPS: u16 = 5;

const SEQ_NEXT: u16 = 0;
const SHA1_WRITE: u16 = 0;
const SHA1_SUM: u16 = 1;
const HANDLE_PING: u16 = 0;

/// Completes after yielding to the executor `remaining` times.
struct YieldTimes {
    remaining: u32,
}

impl Future for YieldTimes {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<()> {
        if self.remaining == 0 {
            Poll::Ready(())
        } else {
            self.remaining -= 1;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

struct HandleGuard {
    count: Rc<Cell<i64>>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.count.set(self.count.get() - 1);
    }
}

fn make_call_sequence_table() -> MethodTable {
    let counter = Rc::new(Cell::new(0i64));
    let mut table = MethodTable::new(CALL_SEQUENCE_INTERFACE);
    table.set_method(SEQ_NEXT, move |_params| {
        let n = counter.get();
        counter.set(n + 1);
        let mut results = Payload::new();
        results.content_struct_mut().set_int64(0, n);
        Promise::ok(results)
    });
    table
}

fn make_sha1_table() -> MethodTable {
    let hasher = Rc::new(RefCell::new(Sha1::new()));
    let mut table = MethodTable::new(SHA1_INTERFACE);
    let write_hasher = hasher.clone();
    table.set_method(SHA1_WRITE, move |params: Payload| {
        let data = pry!(pry!(params.content_struct()).get_data(0)).to_vec();
        write_hasher.borrow_mut().update(&data);
        Promise::ok(Payload::new())
    });
    table.set_method(SHA1_SUM, move |_params| {
        let digest = hasher.borrow().clone().finalize();
        let mut results = Payload::new();
        results.content_struct_mut().set_data(0, digest.to_vec());
        Promise::ok(results)
    });
    table
}

fn make_handle_table(guard: Rc<HandleGuard>) -> MethodTable {
    let mut table = MethodTable::new(HANDLE_INTERFACE);
    table.set_method(HANDLE_PING, move |_params| {
        let _keep = &guard;
        Promise::ok(Payload::new())
    });
    table
}

fn make_test_table(handle_count: Rc<Cell<i64>>) -> MethodTable {
    let mut table = MethodTable::new(TEST_INTERFACE);

    table.set_method(SUBTRACT, |params: Payload| {
        let root = pry!(params.content_struct());
        let difference = root.get_int64(0) - root.get_int64(1);
        let mut results = Payload::new();
        results.content_struct_mut().set_int64(0, difference);
        Promise::ok(results)
    });

    table.set_method(ECHO, |params: Payload| {
        let cap = pry!(params.get_cap(0));
        let mut results = Payload::new();
        results.set_cap(0, cap);
        Promise::ok(results)
    });

    let count_for_get = handle_count.clone();
    table.set_method(GET_HANDLE, move |_params| {
        count_for_get.set(count_for_get.get() + 1);
        let guard = Rc::new(HandleGuard {
            count: count_for_get.clone(),
        });
        let mut results = Payload::new();
        results.set_cap(0, local::new_client(Rc::new(make_handle_table(guard))));
        Promise::ok(results)
    });

    table.set_method(GET_HANDLE_COUNT, move |_params| {
        let mut results = Payload::new();
        results.content_struct_mut().set_int64(0, handle_count.get());
        Promise::ok(results)
    });

    table.set_method(NEW_SHA1, |_params| {
        let mut results = Payload::new();
        results.set_cap(0, local::new_client(Rc::new(make_sha1_table())));
        Promise::ok(results)
    });

    table.set_method(GET_TWO_CAPS, |_params| {
        // Returns slowly, so that pipelined calls pile up on the answer.
        Promise::from_future(async {
            YieldTimes { remaining: 4 }.await;
            let mut results = Payload::new();
            results.set_cap(0, local::new_client(Rc::new(make_call_sequence_table())));
            results.set_cap(1, local::new_client(Rc::new(make_call_sequence_table())));
            Ok(results)
        })
    });

    table
}

/// Both vats share one registry; the bootstrap state is the server's.
fn make_vat() -> (Rc<Registry>, Client, Rc<Cell<i64>>) {
    let handle_count = Rc::new(Cell::new(0i64));
    let mut registry = Registry::new();
    let test_table = registry.register(make_test_table(handle_count.clone()));
    registry.register(make_call_sequence_table());
    registry.register(make_sha1_table());
    registry.register(make_handle_table(Rc::new(HandleGuard {
        count: Rc::new(Cell::new(1)),
    })));
    let bootstrap = local::new_client(test_table);
    (Rc::new(registry), bootstrap, handle_count)
}

fn spawn_pair(registry: Rc<Registry>, bootstrap: Client) -> (LocalPool, Client, Disconnector) {
    let pool = LocalPool::new();
    let spawner = pool.spawner();
    let (client_end, server_end) = caprpc::twoparty::pair();

    let mut client_system = RpcSystem::new(Box::new(client_end), None, registry.clone());
    let server_system = RpcSystem::new(Box::new(server_end), Some(bootstrap), registry);

    let remote = client_system.bootstrap();
    let disconnector = client_system.get_disconnector();
    spawner
        .spawn_local(client_system.map(|_| ()))
        .unwrap();
    spawner
        .spawn_local(server_system.map(|_| ()))
        .unwrap();
    (pool, remote, disconnector)
}

fn seq_call() -> Call {
    Call::new(CALL_SEQUENCE_INTERFACE, SEQ_NEXT, Payload::new())
}

async fn read_handle_count(remote: &Client) -> i64 {
    let response = remote
        .call(Call::new(TEST_INTERFACE, GET_HANDLE_COUNT, Payload::new()))
        .promise
        .await
        .unwrap();
    let count = response.get().content_struct().unwrap().get_int64(0);
    count
}

#[test]
fn basic_call() {
    let (registry, bootstrap, _) = make_vat();
    let (mut pool, remote, _disconnector) = spawn_pair(registry, bootstrap);
    pool.run_until(async move {
        let mut params = Payload::new();
        params.content_struct_mut().set_int64(0, 9);
        params.content_struct_mut().set_int64(1, -1);
        let response = remote
            .call(Call::new(TEST_INTERFACE, SUBTRACT, params))
            .promise
            .await
            .unwrap();
        assert_eq!(response.get().content_struct().unwrap().get_int64(0), 10);
    });
}

#[test]
fn capability_round_trip_preserves_identity() {
    let (registry, bootstrap, _) = make_vat();
    let (mut pool, remote, _disconnector) = spawn_pair(registry, bootstrap);
    pool.run_until(async move {
        let counter = local::new_client(Rc::new(make_call_sequence_table()));

        let mut params = Payload::new();
        params.set_cap(0, counter.clone());
        let response = remote
            .call(Call::new(TEST_INTERFACE, ECHO, params))
            .promise
            .await
            .unwrap();
        let returned = response.get().get_cap(0).unwrap();

        // The echoed capability is our own: both handles advance one sequence.
        let first = counter.call(seq_call()).promise.await.unwrap();
        let second = returned.call(seq_call()).promise.await.unwrap();
        assert_eq!(first.get().content_struct().unwrap().get_int64(0), 0);
        assert_eq!(second.get().content_struct().unwrap().get_int64(0), 1);
    });
}

#[test]
fn unknown_method_is_reported_as_unimplemented() {
    let (registry, bootstrap, _) = make_vat();
    let (mut pool, remote, _disconnector) = spawn_pair(registry, bootstrap);
    pool.run_until(async move {
        let err = remote
            .call(Call::new(0xdead_beef, 0, Payload::new()))
            .promise
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unimplemented);

        // the connection survives the refusal
        let mut params = Payload::new();
        params.content_struct_mut().set_int64(0, 3);
        params.content_struct_mut().set_int64(1, 1);
        let response = remote
            .call(Call::new(TEST_INTERFACE, SUBTRACT, params))
            .promise
            .await
            .unwrap();
        assert_eq!(response.get().content_struct().unwrap().get_int64(0), 2);
    });
}

#[test]
fn pipelined_calls_reach_an_unreturned_capability() {
    let (registry, bootstrap, _) = make_vat();
    let (mut pool, remote, _disconnector) = spawn_pair(registry, bootstrap);
    pool.run_until(async move {
        let sha_answer = remote.call(Call::new(TEST_INTERFACE, NEW_SHA1, Payload::new()));

        let mut write1 = Payload::new();
        write1.content_struct_mut().set_data(0, b"hello ".to_vec());
        let w1 = sha_answer.pipeline_call(&[0], Call::new(SHA1_INTERFACE, SHA1_WRITE, write1));

        let mut write2 = Payload::new();
        write2.content_struct_mut().set_data(0, b"world".to_vec());
        let w2 = sha_answer.pipeline_call(&[0], Call::new(SHA1_INTERFACE, SHA1_WRITE, write2));

        let sum = sha_answer.pipeline_call(&[0], Call::new(SHA1_INTERFACE, SHA1_SUM, Payload::new()));
        let response = sum.promise.await.unwrap();

        w1.promise.await.unwrap();
        w2.promise.await.unwrap();

        let expected = Sha1::digest(b"hello world");
        assert_eq!(
            response.get().content_struct().unwrap().get_data(0).unwrap(),
            expected.as_slice()
        );
    });
}

#[test]
fn resolution_to_a_local_capability_keeps_call_order() {
    let (registry, bootstrap, _) = make_vat();
    let (mut pool, remote, _disconnector) = spawn_pair(registry, bootstrap);
    pool.run_until(async move {
        // Echoing one of our own capabilities makes the answer's pipeline
        // resolve back to this side, which forces the embargo round trip.
        let counter = local::new_client(Rc::new(make_call_sequence_table()));
        let mut params = Payload::new();
        params.set_cap(0, counter);

        let echo_answer = remote.call(Call::new(TEST_INTERFACE, ECHO, params));
        let pipelined = echo_answer.pipeline.get_pipeline(0).as_cap();

        let mut answers = Vec::new();
        answers.push(pipelined.call(seq_call()));
        answers.push(pipelined.call(seq_call()));

        let _response = echo_answer.promise.await.unwrap();

        for _ in 0..3 {
            answers.push(pipelined.call(seq_call()));
        }

        let mut values = Vec::new();
        for answer in answers {
            let response = answer.promise.await.unwrap();
            values.push(response.get().content_struct().unwrap().get_int64(0));
        }
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    });
}

#[test]
fn pipelined_calls_on_distinct_capabilities_stay_ordered_per_target() {
    let (registry, bootstrap, _) = make_vat();
    let (mut pool, remote, _disconnector) = spawn_pair(registry, bootstrap);
    pool.run_until(async move {
        let answer = remote.call(Call::new(TEST_INTERFACE, GET_TWO_CAPS, Payload::new()));
        let cap_a = answer.pipeline.get_pipeline(0).as_cap();
        let cap_b = answer.pipeline.get_pipeline(1).as_cap();
        let dangling = answer.pipeline.get_pipeline(5).as_cap();

        let a0 = cap_a.call(seq_call());
        let b0 = cap_b.call(seq_call());
        let bad = dangling.call(seq_call());
        let a1 = cap_a.call(seq_call());
        let b1 = cap_b.call(seq_call());

        let get = |r: caprpc::capability::Response| {
            r.get().content_struct().unwrap().get_int64(0)
        };
        assert_eq!(get(a0.promise.await.unwrap()), 0);
        assert_eq!(get(a1.promise.await.unwrap()), 1);
        assert_eq!(get(b0.promise.await.unwrap()), 0);
        assert_eq!(get(b1.promise.await.unwrap()), 1);

        // the broken transform fails its own call, nothing else
        let err = bad.promise.await.unwrap_err();
        assert!(err
            .description
            .contains("pipeline target is a null capability"));
    });
}

#[test]
fn releasing_an_import_drops_the_remote_object() {
    let (registry, bootstrap, _) = make_vat();
    let (mut pool, remote, _disconnector) = spawn_pair(registry, bootstrap);
    pool.run_until(async move {
        let response = remote
            .call(Call::new(TEST_INTERFACE, GET_HANDLE, Payload::new()))
            .promise
            .await
            .unwrap();
        let handle = response.get().get_cap(0).unwrap();
        drop(response);

        assert_eq!(read_handle_count(&remote).await, 1);

        handle.close();
        drop(handle);

        assert_eq!(read_handle_count(&remote).await, 0);
    });
}

#[test]
fn handle_survives_while_any_reference_is_held() {
    let (registry, bootstrap, _) = make_vat();
    let (mut pool, remote, _disconnector) = spawn_pair(registry, bootstrap);
    pool.run_until(async move {
        let r1 = remote
            .call(Call::new(TEST_INTERFACE, GET_HANDLE, Payload::new()))
            .promise
            .await
            .unwrap();
        let r2 = remote
            .call(Call::new(TEST_INTERFACE, GET_HANDLE, Payload::new()))
            .promise
            .await
            .unwrap();
        let h1 = r1.get().get_cap(0).unwrap();
        let h2 = r2.get().get_cap(0).unwrap();
        drop((r1, r2));

        assert_eq!(read_handle_count(&remote).await, 2);
        h1.close();
        assert_eq!(read_handle_count(&remote).await, 1);
        h2.close();
        assert_eq!(read_handle_count(&remote).await, 0);
    });
}

#[test]
fn disconnect_settles_and_fails_later_calls() {
    let (registry, bootstrap, _) = make_vat();
    let (mut pool, remote, disconnector) = spawn_pair(registry, bootstrap);
    pool.run_until(async move {
        // prove the connection works first
        let mut params = Payload::new();
        params.content_struct_mut().set_int64(0, 1);
        params.content_struct_mut().set_int64(1, 1);
        remote
            .call(Call::new(TEST_INTERFACE, SUBTRACT, params))
            .promise
            .await
            .unwrap();

        // a call still in flight when the connection drops
        let mut params = Payload::new();
        params.content_struct_mut().set_int64(0, 5);
        params.content_struct_mut().set_int64(1, 2);
        let outstanding = remote.call(Call::new(TEST_INTERFACE, SUBTRACT, params));

        disconnector.await.unwrap();

        let err = outstanding.promise.await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Disconnected);

        let err = remote
            .call(Call::new(TEST_INTERFACE, SUBTRACT, Payload::new()))
            .promise
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Disconnected);
    });
}
