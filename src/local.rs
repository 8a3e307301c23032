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

//! Capabilities served by method tables in this process.

use std::rc::Rc;

use futures::FutureExt;

use crate::capability::{self, Answer, Call, Client, PipelineHook, Promise, Response};
use crate::payload::PipelineOp;
use crate::registry::MethodTable;
use crate::{broken, queued, Error};

pub struct ClientInner {
    table: Rc<MethodTable>,
}

pub fn new_client(table: Rc<MethodTable>) -> Client {
    Client::from(Rc::new(ClientInner { table }))
}

/// A pipeline over results that are already in hand.
struct ResultsPipeline {
    response: Response,
}

impl PipelineHook for ResultsPipeline {
    fn get_pipelined_cap(&self, ops: Vec<PipelineOp>) -> Client {
        match self.response.get().pipelined_cap(&ops) {
            Ok(client) => client,
            Err(e) => broken::new_client(e),
        }
    }
}

pub(crate) fn call(inner: &Rc<ClientInner>, call: Call) -> Answer {
    let Call {
        interface_id,
        method_id,
        params,
    } = call;

    if interface_id != inner.table.interface_id() {
        return Answer::error(Error::unimplemented(
            "Requested interface not implemented.".to_string(),
        ));
    }
    let method = match inner.table.get(method_id) {
        Some(method) => method.clone(),
        None => {
            return Answer::error(Error::unimplemented(
                "Method not implemented.".to_string(),
            ))
        }
    };

    let response_promise = Promise::from_future(async move {
        let results = method(params).await?;
        Ok(Response::new(Rc::new(results)))
    })
    .shared();

    let (pipeline_sender, mut pipeline) = queued::Pipeline::new();
    pipeline.drive(response_promise.clone().map(|r| {
        match r {
            Ok(response) => {
                pipeline_sender.complete(capability::Pipeline::new(Rc::new(ResultsPipeline {
                    response,
                })));
            }
            Err(e) => pipeline_sender.complete(broken::new_pipeline(e)),
        }
        Ok(())
    }));

    Answer::new(
        Promise::from_future(response_promise),
        capability::Pipeline::new(Rc::new(pipeline)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::Payload;
    use crate::ErrorKind;
    use futures::executor::block_on;

    fn adder() -> Client {
        let mut table = MethodTable::new(17);
        table.set_method(0, |params: Payload| {
            let a = params.content_struct().map(|s| s.get_int64(0)).unwrap_or(0);
            let b = params.content_struct().map(|s| s.get_int64(1)).unwrap_or(0);
            let mut results = Payload::new();
            results
                .content_struct_mut()
                .set_int64(0, a + b);
            Promise::ok(results)
        });
        new_client(Rc::new(table))
    }

    #[test]
    fn dispatches_to_the_named_method() {
        let client = adder();
        let mut params = Payload::new();
        params.content_struct_mut().set_int64(0, 40);
        params.content_struct_mut().set_int64(1, 2);
        let response = block_on(client.call(Call::new(17, 0, params)).promise).unwrap();
        assert_eq!(
            response.get().content_struct().unwrap().get_int64(0),
            42
        );
    }

    #[test]
    fn unknown_method_is_unimplemented() {
        let client = adder();
        let err = block_on(client.call(Call::new(17, 9, Payload::new())).promise).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unimplemented);

        let err = block_on(client.call(Call::new(99, 0, Payload::new())).promise).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unimplemented);
    }
}
