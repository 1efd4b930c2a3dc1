// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transparent Modbus TCP front
//!
//! Translates MBAP-framed PDUs into bus transactions. All PDU
//! validation happens here, before anything reaches the arbiter, and
//! every fault inside a well-framed PDU is answered with a Modbus
//! exception on the open connection.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
};

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use futures_util::{SinkExt as _, StreamExt as _};
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::{codec::Framed, sync::CancellationToken};

use crate::{
    arbiter::Handle,
    codec::{encode_exception, encode_response, packed_len, tcp::MbapCodec, unpack_bits},
    frame::{
        tcp::{Adu, UnitId},
        ExceptionCode, ExceptionResponse, FunctionCode, Request,
    },
    front::{exception_for_transport, Front, IDLE_TIMEOUT},
    slave::Slave,
};

/// Port used when the configured one needs privileges the process does
/// not have.
const FALLBACK_PORT: u16 = 5020;

#[derive(Debug)]
pub struct TcpFront {
    handle: Handle,
    port: u16,
}

impl TcpFront {
    #[must_use]
    pub fn new(handle: Handle, port: u16) -> Self {
        Self { handle, port }
    }

    /// Accept and serve connections on an already bound listener.
    pub async fn serve(
        listener: TcpListener,
        handle: Handle,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    log::warn!("modbus-tcp: accept failed: {err}");
                    continue;
                }
            };
            log::debug!("modbus-tcp: connection from {peer}");
            let handle = handle.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_connection(stream, handle, shutdown).await {
                    log::debug!("modbus-tcp: connection from {peer} closed: {err}");
                }
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Front for TcpFront {
    fn name(&self) -> &'static str {
        "modbus-tcp"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> io::Result<()> {
        let listener = bind_listener(self.port)?;
        let local = listener.local_addr()?;
        log::info!("modbus-tcp: listening on {local}");
        Self::serve(listener, self.handle, shutdown).await
    }
}

/// Bind with `SO_REUSEADDR` so a restart does not have to wait out
/// TIME_WAIT sockets. Falls back to the unprivileged port if the
/// configured one is refused.
fn bind_listener(port: u16) -> io::Result<TcpListener> {
    match bind_reuse_address(port) {
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied && port != FALLBACK_PORT => {
            log::warn!("modbus-tcp: binding port {port} denied, falling back to {FALLBACK_PORT}");
            bind_reuse_address(FALLBACK_PORT)
        }
        other => other,
    }
}

fn bind_reuse_address(port: u16) -> io::Result<TcpListener> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

async fn serve_connection(
    stream: TcpStream,
    handle: Handle,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let mut framed = Framed::new(stream, MbapCodec);
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = tokio::time::timeout(IDLE_TIMEOUT, framed.next()) => next,
        };
        let adu = match next {
            Err(_) => return Ok(()),  // idle
            Ok(None) => return Ok(()), // end of stream
            Ok(Some(adu)) => adu?,     // header violations close the connection
        };
        let pdu = handle_request(&handle, adu.unit_id, &adu.pdu).await;
        framed
            .send(Adu {
                transaction_id: adu.transaction_id,
                unit_id: adu.unit_id,
                pdu,
            })
            .await?;
    }
}

/// Validate one PDU, run it over the bus and produce the response PDU.
///
/// Exactly one response PDU comes out of every call, whatever happens
/// downstream.
async fn handle_request(handle: &Handle, unit_id: UnitId, pdu: &Bytes) -> Bytes {
    let function = pdu.first().copied().unwrap_or_default();
    let request = match parse_request(pdu) {
        Ok(request) => request,
        Err(exception) => return exception_pdu(function, exception),
    };
    if Slave(unit_id).is_broadcast() {
        // Broadcast would violate one-response-per-request.
        return exception_pdu(function, ExceptionCode::IllegalDataAddress);
    }
    match handle.call(Slave(unit_id), request).await {
        Ok(Ok(response)) => encode_response(&response),
        Ok(Err(exception)) => exception_pdu(exception.function, exception.exception),
        Err(err) => {
            log::warn!("modbus-tcp: unit {unit_id} fc {function:#04X}: {err}");
            exception_pdu(function, exception_for_transport(&err))
        }
    }
}

fn exception_pdu(function: FunctionCode, exception: ExceptionCode) -> Bytes {
    encode_exception(&ExceptionResponse {
        function: function & 0x7F,
        exception,
    })
}

/// Validate and decode one request PDU: function code, declared layout,
/// count ranges and byte-count consistency, each violation mapped to
/// the exception the gateway answers locally.
fn parse_request(pdu: &Bytes) -> Result<Request, ExceptionCode> {
    use ExceptionCode::{IllegalDataValue, IllegalFunction};

    let Some(&function) = pdu.first() else {
        return Err(IllegalFunction);
    };
    let request = match function {
        0x01 | 0x02 => {
            let (address, quantity) = read_addr_count(pdu)?;
            if !(1..=2000).contains(&quantity) {
                return Err(IllegalDataValue);
            }
            if function == 0x01 {
                Request::ReadCoils(address, quantity)
            } else {
                Request::ReadDiscreteInputs(address, quantity)
            }
        }
        0x03 | 0x04 => {
            let (address, quantity) = read_addr_count(pdu)?;
            if !(1..=125).contains(&quantity) {
                return Err(IllegalDataValue);
            }
            if function == 0x03 {
                Request::ReadHoldingRegisters(address, quantity)
            } else {
                Request::ReadInputRegisters(address, quantity)
            }
        }
        0x05 => {
            let (address, value) = read_addr_count(pdu)?;
            let state = match value {
                0xFF00 => true,
                0x0000 => false,
                _ => return Err(IllegalDataValue),
            };
            Request::WriteSingleCoil(address, state)
        }
        0x06 => {
            let (address, value) = read_addr_count(pdu)?;
            Request::WriteSingleRegister(address, value)
        }
        0x0F => {
            let (address, quantity, data) = read_multi_payload(pdu)?;
            if !(1..=1968).contains(&quantity) {
                return Err(IllegalDataValue);
            }
            if data.len() != packed_len(quantity) {
                return Err(IllegalDataValue);
            }
            Request::WriteMultipleCoils(address, unpack_bits(data, quantity))
        }
        0x10 => {
            let (address, quantity, data) = read_multi_payload(pdu)?;
            if !(1..=123).contains(&quantity) {
                return Err(IllegalDataValue);
            }
            if data.len() != 2 * usize::from(quantity) {
                return Err(IllegalDataValue);
            }
            let words = data
                .chunks_exact(2)
                .map(|pair| BigEndian::read_u16(pair))
                .collect();
            Request::WriteMultipleRegisters(address, words)
        }
        0x16 => {
            if pdu.len() < 7 {
                return Err(IllegalDataValue);
            }
            Request::MaskWriteRegister(
                BigEndian::read_u16(&pdu[1..3]),
                BigEndian::read_u16(&pdu[3..5]),
                BigEndian::read_u16(&pdu[5..7]),
            )
        }
        _ => return Err(IllegalFunction),
    };
    Ok(request)
}

fn read_addr_count(pdu: &Bytes) -> Result<(u16, u16), ExceptionCode> {
    if pdu.len() < 5 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok((
        BigEndian::read_u16(&pdu[1..3]),
        BigEndian::read_u16(&pdu[3..5]),
    ))
}

/// Layout of FC15/FC16: addr(2) qty(2) bytecount(1) payload.
fn read_multi_payload(pdu: &Bytes) -> Result<(u16, u16, &[u8]), ExceptionCode> {
    if pdu.len() < 6 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let address = BigEndian::read_u16(&pdu[1..3]);
    let quantity = BigEndian::read_u16(&pdu[3..5]);
    let byte_count = usize::from(pdu[5]);
    if pdu.len() < 6 + byte_count {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok((address, quantity, &pdu[6..6 + byte_count]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(pdu: &[u8]) -> Result<Request, ExceptionCode> {
        parse_request(&Bytes::copy_from_slice(pdu))
    }

    #[test]
    fn read_requests() {
        assert_eq!(
            parse(&[0x01, 0x00, 0x10, 0x00, 0x08]),
            Ok(Request::ReadCoils(0x10, 8))
        );
        assert_eq!(
            parse(&[0x02, 0x00, 0x00, 0x07, 0xD0]),
            Ok(Request::ReadDiscreteInputs(0, 2000))
        );
        assert_eq!(
            parse(&[0x03, 0x00, 0x00, 0x00, 0x7D]),
            Ok(Request::ReadHoldingRegisters(0, 125))
        );
        assert_eq!(
            parse(&[0x04, 0x12, 0x34, 0x00, 0x01]),
            Ok(Request::ReadInputRegisters(0x1234, 1))
        );
    }

    #[test]
    fn counts_out_of_range() {
        assert_eq!(
            parse(&[0x01, 0x00, 0x00, 0x00, 0x00]),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            parse(&[0x01, 0x00, 0x00, 0x07, 0xD1]),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            parse(&[0x03, 0x00, 0x00, 0x00, 0x7E]),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            parse(&[0x04, 0x00, 0x00, 0x00, 0x00]),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn truncated_pdus() {
        assert_eq!(parse(&[]), Err(ExceptionCode::IllegalFunction));
        assert_eq!(
            parse(&[0x03, 0x00, 0x00, 0x00]),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            parse(&[0x0F, 0x00, 0x00, 0x00]),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            parse(&[0x16, 0x00, 0x00, 0x00, 0xF2, 0x00]),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn write_single_coil_values() {
        assert_eq!(
            parse(&[0x05, 0x00, 0x05, 0xFF, 0x00]),
            Ok(Request::WriteSingleCoil(5, true))
        );
        assert_eq!(
            parse(&[0x05, 0x00, 0x05, 0x00, 0x00]),
            Ok(Request::WriteSingleCoil(5, false))
        );
        assert_eq!(
            parse(&[0x05, 0x00, 0x05, 0x00, 0x01]),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn write_multiple_coils() {
        assert_eq!(
            parse(&[0x0F, 0x00, 0x08, 0x00, 0x04, 0x01, 0b_0000_1101]),
            Ok(Request::WriteMultipleCoils(
                8,
                vec![true, false, true, true]
            ))
        );
        // byte count disagrees with the quantity
        assert_eq!(
            parse(&[0x0F, 0x00, 0x08, 0x00, 0x04, 0x02, 0x0D, 0x00]),
            Err(ExceptionCode::IllegalDataValue)
        );
        // quantity out of range
        assert_eq!(
            parse(&[0x0F, 0x00, 0x00, 0x07, 0xB1, 0xF7]),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn write_multiple_registers() {
        assert_eq!(
            parse(&[0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]),
            Ok(Request::WriteMultipleRegisters(1, vec![0x000A, 0x0102]))
        );
        assert_eq!(
            parse(&[0x10, 0x00, 0x01, 0x00, 0x02, 0x03, 0x00, 0x0A, 0x01]),
            Err(ExceptionCode::IllegalDataValue)
        );
        assert_eq!(
            parse(&[0x10, 0x00, 0x01, 0x00, 0x7C, 0xF8]),
            Err(ExceptionCode::IllegalDataValue)
        );
    }

    #[test]
    fn mask_write_register() {
        assert_eq!(
            parse(&[0x16, 0x00, 0x04, 0x00, 0xF2, 0x00, 0x25]),
            Ok(Request::MaskWriteRegister(4, 0x00F2, 0x0025))
        );
    }

    #[test]
    fn unknown_function_codes() {
        assert_eq!(parse(&[0x2A, 0x01]), Err(ExceptionCode::IllegalFunction));
        assert_eq!(parse(&[0x17]), Err(ExceptionCode::IllegalFunction));
        assert_eq!(parse(&[0x07]), Err(ExceptionCode::IllegalFunction));
    }

    #[test]
    fn exception_pdu_sets_error_bit() {
        let pdu = exception_pdu(0x2A, ExceptionCode::IllegalFunction);
        assert_eq!(&pdu[..], &[0xAA, 0x01]);

        let pdu = exception_pdu(0x03, ExceptionCode::GatewayTargetDevice);
        assert_eq!(&pdu[..], &[0x83, 0x0B]);
    }
}
