// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bit-exact PDU codecs
//!
//! The layouts are straight transcriptions of the published Modbus
//! application-protocol tables. Decoders report malformed input as
//! `InvalidData`; range policy (counts, broadcast) belongs to the
//! fronts, not here.

pub mod rtu;
pub mod tcp;

use std::io::{Error, ErrorKind, Result};

use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{Coil, ExceptionCode, ExceptionResponse, Request, Response};

/// Serialize a request PDU.
#[must_use]
pub fn encode_request(request: &Request) -> Bytes {
    use Request::*;
    let mut out = BytesMut::with_capacity(request_pdu_capacity(request));
    out.put_u8(request.function_code());
    match request {
        ReadCoils(addr, count)
        | ReadDiscreteInputs(addr, count)
        | ReadHoldingRegisters(addr, count)
        | ReadInputRegisters(addr, count) => {
            out.put_u16(*addr);
            out.put_u16(*count);
        }
        WriteSingleCoil(addr, state) => {
            out.put_u16(*addr);
            out.put_u16(coil_value(*state));
        }
        WriteSingleRegister(addr, word) => {
            out.put_u16(*addr);
            out.put_u16(*word);
        }
        WriteMultipleCoils(addr, bits) => {
            out.put_u16(*addr);
            out.put_u16(bits.len() as u16);
            let packed = pack_bits(bits);
            out.put_u8(packed.len() as u8);
            out.put_slice(&packed);
        }
        WriteMultipleRegisters(addr, words) => {
            out.put_u16(*addr);
            out.put_u16(words.len() as u16);
            out.put_u8((words.len() * 2) as u8);
            for word in words {
                out.put_u16(*word);
            }
        }
        MaskWriteRegister(addr, and_mask, or_mask) => {
            out.put_u16(*addr);
            out.put_u16(*and_mask);
            out.put_u16(*or_mask);
        }
    }
    out.freeze()
}

/// Serialize a response PDU.
#[must_use]
pub fn encode_response(response: &Response) -> Bytes {
    use Response::*;
    let mut out = BytesMut::with_capacity(response_pdu_capacity(response));
    out.put_u8(response.function_code());
    match response {
        ReadCoils(bits) | ReadDiscreteInputs(bits) => {
            let packed = pack_bits(bits);
            out.put_u8(packed.len() as u8);
            out.put_slice(&packed);
        }
        ReadHoldingRegisters(words) | ReadInputRegisters(words) => {
            out.put_u8((words.len() * 2) as u8);
            for word in words {
                out.put_u16(*word);
            }
        }
        WriteSingleCoil(addr, state) => {
            out.put_u16(*addr);
            out.put_u16(coil_value(*state));
        }
        WriteSingleRegister(addr, word) => {
            out.put_u16(*addr);
            out.put_u16(*word);
        }
        WriteMultipleCoils(addr, count) | WriteMultipleRegisters(addr, count) => {
            out.put_u16(*addr);
            out.put_u16(*count);
        }
        MaskWriteRegister(addr, and_mask, or_mask) => {
            out.put_u16(*addr);
            out.put_u16(*and_mask);
            out.put_u16(*or_mask);
        }
    }
    out.freeze()
}

/// Serialize an exception PDU: the function code with the error bit
/// set, then the exception code.
#[must_use]
pub fn encode_exception(exception: &ExceptionResponse) -> Bytes {
    let mut out = BytesMut::with_capacity(2);
    out.put_u8(exception.function | 0x80);
    out.put_u8(exception.exception as u8);
    out.freeze()
}

/// Serialize a reply PDU, data or exception.
#[must_use]
pub fn encode_reply(reply: &std::result::Result<Response, ExceptionResponse>) -> Bytes {
    match reply {
        Ok(response) => encode_response(response),
        Err(exception) => encode_exception(exception),
    }
}

/// Parse a request PDU (the slave side of the conversation).
pub fn decode_request(pdu: &[u8]) -> Result<Request> {
    use Request::*;
    let function = *pdu.first().ok_or_else(|| malformed("empty PDU"))?;
    let request = match function {
        0x01 => ReadCoils(be16(pdu, 1)?, be16(pdu, 3)?),
        0x02 => ReadDiscreteInputs(be16(pdu, 1)?, be16(pdu, 3)?),
        0x03 => ReadHoldingRegisters(be16(pdu, 1)?, be16(pdu, 3)?),
        0x04 => ReadInputRegisters(be16(pdu, 1)?, be16(pdu, 3)?),
        0x05 => WriteSingleCoil(be16(pdu, 1)?, coil_state(be16(pdu, 3)?)?),
        0x06 => WriteSingleRegister(be16(pdu, 1)?, be16(pdu, 3)?),
        0x0F => {
            let addr = be16(pdu, 1)?;
            let count = be16(pdu, 3)?;
            let data = write_payload(pdu, packed_len(count))?;
            WriteMultipleCoils(addr, unpack_bits(data, count))
        }
        0x10 => {
            let addr = be16(pdu, 1)?;
            let count = be16(pdu, 3)?;
            let data = write_payload(pdu, 2 * usize::from(count))?;
            let words = data[..2 * usize::from(count)]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            WriteMultipleRegisters(addr, words)
        }
        0x16 => MaskWriteRegister(be16(pdu, 1)?, be16(pdu, 3)?, be16(pdu, 5)?),
        other => return Err(unsupported(other)),
    };
    Ok(request)
}

/// Parse a reply PDU (the master side). Exception frames announce
/// themselves with the error bit in the function code.
pub fn decode_reply(pdu: &[u8]) -> Result<std::result::Result<Response, ExceptionResponse>> {
    use Response::*;
    let function = *pdu.first().ok_or_else(|| malformed("empty PDU"))?;
    if function & 0x80 != 0 {
        let code = *pdu.get(1).ok_or_else(|| malformed("truncated exception"))?;
        let exception =
            ExceptionCode::new(code).ok_or_else(|| malformed("unknown exception code"))?;
        return Ok(Err(ExceptionResponse {
            function: function & 0x7F,
            exception,
        }));
    }
    let response = match function {
        0x01 | 0x02 => {
            let data = counted_payload(pdu)?;
            // The requested quantity is not known at this layer, so
            // every received byte is unpacked in full; the master trims
            // the padding against the request.
            let bits = unpack_bits(data, (data.len() * 8) as u16);
            if function == 0x01 {
                ReadCoils(bits)
            } else {
                ReadDiscreteInputs(bits)
            }
        }
        0x03 | 0x04 => {
            let data = counted_payload(pdu)?;
            let words = data
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect();
            if function == 0x03 {
                ReadHoldingRegisters(words)
            } else {
                ReadInputRegisters(words)
            }
        }
        0x05 => WriteSingleCoil(be16(pdu, 1)?, coil_state(be16(pdu, 3)?)?),
        0x06 => WriteSingleRegister(be16(pdu, 1)?, be16(pdu, 3)?),
        0x0F => WriteMultipleCoils(be16(pdu, 1)?, be16(pdu, 3)?),
        0x10 => WriteMultipleRegisters(be16(pdu, 1)?, be16(pdu, 3)?),
        0x16 => MaskWriteRegister(be16(pdu, 1)?, be16(pdu, 3)?, be16(pdu, 5)?),
        other => return Err(unsupported(other)),
    };
    Ok(Ok(response))
}

/// How many bytes a packed run of `count` bits occupies.
pub(crate) fn packed_len(count: u16) -> usize {
    (usize::from(count) + 7) / 8
}

/// Pack bit states into bytes, least significant bit first; unused
/// bits of the last byte stay zero.
pub(crate) fn pack_bits(bits: &[Coil]) -> Vec<u8> {
    let mut out = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// The inverse of [`pack_bits`]. `data` must hold at least
/// `packed_len(count)` bytes.
pub(crate) fn unpack_bits(data: &[u8], count: u16) -> Vec<Coil> {
    (0..usize::from(count))
        .map(|i| data[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

/// Big-endian word at `at`, bounds-checked.
fn be16(pdu: &[u8], at: usize) -> Result<u16> {
    match pdu.get(at..at + 2) {
        Some(bytes) => Ok(u16::from_be_bytes([bytes[0], bytes[1]])),
        None => Err(malformed("truncated PDU")),
    }
}

/// Payload of a write-multiple request: byte 5 declares its length,
/// which must cover the quantity announced in bytes 3..5.
fn write_payload(pdu: &[u8], needed: usize) -> Result<&[u8]> {
    let declared = usize::from(*pdu.get(5).ok_or_else(|| malformed("truncated PDU"))?);
    if declared < needed || pdu.len() < 6 + declared {
        return Err(malformed("byte count disagrees with quantity"));
    }
    Ok(&pdu[6..6 + declared])
}

/// Payload of a read response: byte 1 declares its length.
fn counted_payload(pdu: &[u8]) -> Result<&[u8]> {
    let declared = usize::from(*pdu.get(1).ok_or_else(|| malformed("truncated PDU"))?);
    if pdu.len() < 2 + declared {
        return Err(malformed("byte count overruns the PDU"));
    }
    Ok(&pdu[2..2 + declared])
}

fn coil_value(state: bool) -> u16 {
    if state {
        0xFF00
    } else {
        0x0000
    }
}

fn coil_state(value: u16) -> Result<bool> {
    match value {
        0xFF00 => Ok(true),
        0x0000 => Ok(false),
        _ => Err(malformed("coil value is neither on nor off")),
    }
}

fn malformed(what: &str) -> Error {
    Error::new(ErrorKind::InvalidData, format!("malformed PDU: {what}"))
}

fn unsupported(function: u8) -> Error {
    Error::new(
        ErrorKind::InvalidData,
        format!("unsupported function code 0x{function:02X}"),
    )
}

fn request_pdu_capacity(request: &Request) -> usize {
    use Request::*;
    match request {
        WriteMultipleCoils(_, bits) => 6 + (bits.len() + 7) / 8,
        WriteMultipleRegisters(_, words) => 6 + 2 * words.len(),
        MaskWriteRegister(_, _, _) => 7,
        _ => 5,
    }
}

fn response_pdu_capacity(response: &Response) -> usize {
    use Response::*;
    match response {
        ReadCoils(bits) | ReadDiscreteInputs(bits) => 2 + (bits.len() + 7) / 8,
        ReadHoldingRegisters(words) | ReadInputRegisters(words) => 2 + 2 * words.len(),
        MaskWriteRegister(_, _, _) => 7,
        _ => 5,
    }
}
