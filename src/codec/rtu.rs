// SPDX-License-Identifier: MIT OR Apache-2.0

//! Modbus RTU framing
//!
//! A frame is one address byte, the PDU, and a trailing CRC-16. There
//! is no length prefix; frame boundaries come from per-function length
//! tables over the first few received bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    codec::{decode_reply, decode_request, encode_reply, encode_request},
    error::TransportError,
    frame::rtu::{RequestFrame, ResponseFrame},
    slave::SlaveId,
};

// The serial line guide caps a frame at 256 bytes, address and CRC
// included.
const MAX_FRAME_LEN: usize = 256;

/// CRC-16/MODBUS: reflected polynomial 0xA001 seeded with 0xFFFF.
/// Transmitted low byte first.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 == 0 {
                crc >> 1
            } else {
                (crc >> 1) ^ 0xA001
            };
        }
    }
    crc
}

/// PDU length of a request frame, or `None` while the bytes that
/// determine it have not all arrived.
fn request_body_len(frame: &[u8]) -> Result<Option<usize>, TransportError> {
    let Some(&function) = frame.get(1) else {
        return Ok(None);
    };
    let len = match function {
        0x01..=0x06 => 5,
        0x0F | 0x10 => match frame.get(6) {
            Some(&declared) => 6 + usize::from(declared),
            None => return Ok(None),
        },
        0x16 => 7,
        _ => return Err(TransportError::Framing("unknown function in request frame")),
    };
    Ok(Some(len))
}

/// PDU length of a response frame, or `None` while undecidable.
fn response_body_len(frame: &[u8]) -> Result<Option<usize>, TransportError> {
    let Some(&function) = frame.get(1) else {
        return Ok(None);
    };
    let len = match function {
        0x01..=0x04 => match frame.get(2) {
            Some(&declared) => 2 + usize::from(declared),
            None => return Ok(None),
        },
        0x05 | 0x06 | 0x0F | 0x10 => 5,
        0x16 => 7,
        f if f & 0x80 != 0 => 2, // exception frame
        _ => {
            return Err(TransportError::Framing(
                "unknown function in response frame",
            ))
        }
    };
    Ok(Some(len))
}

/// Take one complete frame off the buffer and verify its checksum.
///
/// A failed checksum is final for the transaction; the gateway does
/// not hunt through the noise for a later frame start.
fn take_frame<L>(buf: &mut BytesMut, body_len: L) -> Result<Option<(SlaveId, Bytes)>, TransportError>
where
    L: Fn(&[u8]) -> Result<Option<usize>, TransportError>,
{
    let Some(body) = body_len(buf)? else {
        return Ok(None);
    };
    let total = 1 + body + 2;
    if total > MAX_FRAME_LEN {
        return Err(TransportError::Framing("oversized frame"));
    }
    if buf.len() < total {
        return Ok(None);
    }

    let mut frame = buf.split_to(total);
    let mut checksum = frame.split_off(1 + body);
    let received = checksum.get_u16_le();
    let computed = crc16(&frame);
    if received != computed {
        return Err(TransportError::CrcMismatch {
            expected: received,
            actual: computed,
        });
    }

    let slave = frame.split_to(1)[0];
    Ok(Some((slave, frame.freeze())))
}

fn put_frame(slave: SlaveId, pdu: &[u8], buf: &mut BytesMut) {
    let start = buf.len();
    buf.reserve(1 + pdu.len() + 2);
    buf.put_u8(slave);
    buf.put_slice(pdu);
    buf.put_u16_le(crc16(&buf[start..]));
}

/// Master-side codec: requests out, replies in.
#[derive(Debug, Default)]
pub struct MasterCodec;

/// The mirror image of [`MasterCodec`]. The gateway itself is never a
/// slave; this half exists for bus simulation in tests and
/// diagnostics.
#[derive(Debug, Default)]
pub struct SlaveCodec;

impl Encoder<RequestFrame> for MasterCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: RequestFrame, buf: &mut BytesMut) -> Result<(), TransportError> {
        put_frame(frame.slave, &encode_request(&frame.request), buf);
        Ok(())
    }
}

impl Decoder for MasterCodec {
    type Item = ResponseFrame;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ResponseFrame>, TransportError> {
        let Some((slave, pdu)) = take_frame(buf, response_body_len)? else {
            return Ok(None);
        };
        // The checksum already passed, so a failure here means the
        // frame disagrees with the length tables.
        let reply = decode_reply(&pdu).map_err(|err| {
            log::warn!("Undecodable reply PDU: {err}");
            TransportError::Framing("undecodable reply PDU")
        })?;
        Ok(Some(ResponseFrame { slave, reply }))
    }
}

impl Encoder<ResponseFrame> for SlaveCodec {
    type Error = TransportError;

    fn encode(&mut self, frame: ResponseFrame, buf: &mut BytesMut) -> Result<(), TransportError> {
        put_frame(frame.slave, &encode_reply(&frame.reply), buf);
        Ok(())
    }
}

impl Decoder for SlaveCodec {
    type Item = RequestFrame;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<RequestFrame>, TransportError> {
        let Some((slave, pdu)) = take_frame(buf, request_body_len)? else {
            return Ok(None);
        };
        let request = decode_request(&pdu).map_err(|err| {
            log::warn!("Undecodable request PDU: {err}");
            TransportError::Framing("undecodable request PDU")
        })?;
        Ok(Some(RequestFrame { slave, request }))
    }
}
