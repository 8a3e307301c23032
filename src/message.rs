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

//! The wire protocol: everything that crosses a `Transport`.
//!
//! Capabilities never cross the wire directly. A payload's capability table
//! is rewritten into `CapDescriptor`s on the way out and rebuilt into live
//! clients on the way in; the structured content travels untouched.

use crate::payload::{PipelineOp, Ptr};
use crate::Error;

pub type QuestionId = u32;
pub type AnswerId = QuestionId;
pub type ExportId = u32;
pub type ImportId = ExportId;
pub type EmbargoId = u32;

/// How a capability in an outgoing payload is identified to the peer.
#[derive(Clone, Debug)]
pub enum CapDescriptor {
    None,

    /// A capability hosted by the sender, newly or previously exported.
    SenderHosted(ExportId),

    /// Like `SenderHosted`, but the sender does not know its final referent yet.
    SenderPromise(ExportId),

    /// A capability the receiver previously exported to the sender.
    ReceiverHosted(ImportId),

    /// A capability expected in the results of one of the receiver's own answers.
    ReceiverAnswer {
        question_id: QuestionId,
        transform: Vec<PipelineOp>,
    },
}

/// Structured content plus serialized capability table.
#[derive(Clone, Debug, Default)]
pub struct WirePayload {
    pub content: Ptr,
    pub cap_table: Vec<CapDescriptor>,
}

/// What a `Call` or `Disembargo` is aimed at.
#[derive(Clone, Debug)]
pub enum MessageTarget {
    /// An entry in the receiver's export table.
    ImportedCap(ExportId),

    /// A capability to be extracted from the results of an outstanding answer.
    PromisedAnswer {
        question_id: QuestionId,
        transform: Vec<PipelineOp>,
    },
}

#[derive(Clone, Debug)]
pub enum ReturnBody {
    Results(WirePayload),
    Exception(Error),
}

#[derive(Clone, Copy, Debug)]
pub enum DisembargoContext {
    /// Sent by the embargoing side; the target must resolve back to the sender.
    SenderLoopback(EmbargoId),

    /// The echo that lifts the embargo.
    ReceiverLoopback(EmbargoId),
}

#[derive(Clone, Debug)]
pub enum Message {
    /// Echoed back verbatim when the receiver cannot handle a message.
    Unimplemented(Box<Message>),

    /// The connection is going down because of a protocol violation.
    Abort(Error),

    Bootstrap {
        question_id: QuestionId,
    },

    Call {
        question_id: QuestionId,
        target: MessageTarget,
        interface_id: u64,
        method_id: u16,
        params: WirePayload,
    },

    Return {
        answer_id: AnswerId,
        release_param_caps: bool,
        body: ReturnBody,
    },

    Finish {
        question_id: QuestionId,
        release_result_caps: bool,
    },

    Release {
        id: ImportId,
        reference_count: u32,
    },

    Disembargo {
        target: MessageTarget,
        context: DisembargoContext,
    },
}
