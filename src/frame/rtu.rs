// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ExceptionResponse, Request, Response};

use crate::slave::SlaveId;

/// One request frame on the bus: the addressed slave plus its PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub slave: SlaveId,
    pub request: Request,
}

/// One response frame on the bus.
///
/// The PDU is either data or a Modbus exception; both complete a
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub slave: SlaveId,
    pub reply: Result<Response, ExceptionResponse>,
}
