// SPDX-License-Identifier: MIT OR Apache-2.0

use bytes::Bytes;

pub type TransactionId = u16;
pub type UnitId = u8;

/// One MBAP-framed unit of a Modbus TCP stream.
///
/// The PDU stays undecoded at this layer: the TCP front owns PDU
/// validation so that malformed PDUs turn into exception responses on
/// the open connection instead of stream errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adu {
    /// Chosen by the client, echoed verbatim in the response.
    pub transaction_id: TransactionId,
    pub unit_id: UnitId,
    /// Raw PDU bytes, function code first.
    pub pdu: Bytes,
}
