// SPDX-License-Identifier: MIT OR Apache-2.0

//! Gateway error types

use std::io;

use thiserror::Error;

use crate::frame::ExceptionResponse;

/// A specialized [`Result`] type for bus operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure of a single transaction on the serial bus.
///
/// These are faults of the transport itself. A Modbus exception returned
/// by a slave is a *successful* transaction and is not represented here.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The serial port is not open.
    #[error("serial port not connected")]
    NotConnected,

    /// No complete response frame arrived within the response timeout.
    #[error("response timed out")]
    Timeout,

    /// A well-sized frame arrived with an invalid checksum.
    #[error("invalid CRC: expected = 0x{expected:04X}, actual = 0x{actual:04X}")]
    CrcMismatch {
        /// CRC carried by the frame.
        expected: u16,
        /// CRC computed over the received bytes.
        actual: u16,
    },

    /// The response bytes could not be reconciled with the request.
    #[error("malformed frame: {0}")]
    Framing(&'static str),

    /// General I/O error on the serial port.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Gateway errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The transaction failed on the wire.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The slave answered with a Modbus exception.
    #[error(transparent)]
    Exception(#[from] ExceptionResponse),
}
