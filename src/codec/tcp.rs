// SPDX-License-Identifier: MIT OR Apache-2.0

//! MBAP framing for the Modbus TCP side

use std::io::{Error, ErrorKind, Result};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::tcp::Adu;

const HEADER_LEN: usize = 7;

const PROTOCOL_ID: u16 = 0x0000; // TCP

// length = unit id + PDU; the PDU itself is capped at 253 bytes.
const MAX_LEN: usize = 254;

/// Codec for MBAP-framed ADUs, symmetric in both directions.
///
/// The decoder validates the header fields (protocol identifier, length
/// range) and leaves the PDU bytes untouched; header violations are
/// unrecoverable on a byte stream and terminate the connection.
#[derive(Debug, Default, Eq, PartialEq)]
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = Adu;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Adu>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = usize::from(BigEndian::read_u16(&buf[4..6]));
        if len == 0 || len > MAX_LEN {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("invalid MBAP length: {len}"),
            ));
        }
        // len = bytes of PDU + one byte (unit id)
        let pdu_len = len - 1;
        if buf.len() < HEADER_LEN + pdu_len {
            return Ok(None);
        }

        let header = buf.split_to(HEADER_LEN);

        let protocol_id = BigEndian::read_u16(&header[2..4]);
        if protocol_id != PROTOCOL_ID {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "invalid protocol identifier: expected = {PROTOCOL_ID}, actual = {protocol_id}"
                ),
            ));
        }

        Ok(Some(Adu {
            transaction_id: BigEndian::read_u16(&header[0..2]),
            unit_id: header[6],
            pdu: buf.split_to(pdu_len).freeze(),
        }))
    }
}

impl Encoder<Adu> for MbapCodec {
    type Error = Error;

    fn encode(&mut self, adu: Adu, buf: &mut BytesMut) -> Result<()> {
        if adu.pdu.len() + 1 > MAX_LEN {
            return Err(Error::new(ErrorKind::InvalidInput, "PDU too large"));
        }
        buf.reserve(adu.pdu.len() + HEADER_LEN);
        buf.put_u16(adu.transaction_id);
        buf.put_u16(PROTOCOL_ID);
        buf.put_u16((adu.pdu.len() + 1) as u16);
        buf.put_u8(adu.unit_id);
        buf.put_slice(&adu.pdu);
        Ok(())
    }
}
