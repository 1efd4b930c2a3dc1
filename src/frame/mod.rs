// SPDX-License-Identifier: MIT OR Apache-2.0

//! Protocol data model shared by the RTU and TCP transports

pub mod rtu;
pub mod tcp;

use std::{error, fmt};

/// Function code byte of a PDU.
pub type FunctionCode = u8;

/// Zero-based address of a coil or register. Devices documented with
/// 1-based numbering need that offset subtracted before the address
/// goes on the wire.
pub type Address = u16;

/// State of a single coil or discrete input. Write requests carry
/// `true` as `0xFF00` and `false` as `0x0000`.
pub type Coil = bool;

/// One 16-bit register value, big-endian on the wire.
pub type Word = u16;

/// How many coils or registers an operation touches.
pub type Quantity = u16;

/// A request from the gateway (master) to a slave device.
///
/// One variant per function code the gateway forwards; anything outside
/// this set is answered northbound with `IllegalFunction` and never
/// reaches the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils(Address, Quantity),
    ReadDiscreteInputs(Address, Quantity),
    ReadHoldingRegisters(Address, Quantity),
    ReadInputRegisters(Address, Quantity),
    WriteSingleCoil(Address, Coil),
    WriteSingleRegister(Address, Word),
    WriteMultipleCoils(Address, Vec<Coil>),
    WriteMultipleRegisters(Address, Vec<Word>),
    MaskWriteRegister(Address, Word, Word),
}

impl Request {
    /// The function code of this request on the wire.
    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        use Request::*;
        match self {
            ReadCoils(_, _) => 0x01,
            ReadDiscreteInputs(_, _) => 0x02,
            ReadHoldingRegisters(_, _) => 0x03,
            ReadInputRegisters(_, _) => 0x04,
            WriteSingleCoil(_, _) => 0x05,
            WriteSingleRegister(_, _) => 0x06,
            WriteMultipleCoils(_, _) => 0x0F,
            WriteMultipleRegisters(_, _) => 0x10,
            MaskWriteRegister(_, _, _) => 0x16,
        }
    }
}

/// The data of a successful request.
///
/// Bit reads come back padded to whole bytes; the master trims the
/// padding down to the requested quantity before handing the data out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    ReadCoils(Vec<Coil>),
    ReadDiscreteInputs(Vec<Coil>),
    ReadHoldingRegisters(Vec<Word>),
    ReadInputRegisters(Vec<Word>),
    WriteSingleCoil(Address, Coil),
    WriteSingleRegister(Address, Word),
    WriteMultipleCoils(Address, Quantity),
    WriteMultipleRegisters(Address, Quantity),
    MaskWriteRegister(Address, Word, Word),
}

impl Response {
    /// The function code of this response on the wire.
    #[must_use]
    pub const fn function_code(&self) -> FunctionCode {
        use Response::*;
        match self {
            ReadCoils(_) => 0x01,
            ReadDiscreteInputs(_) => 0x02,
            ReadHoldingRegisters(_) => 0x03,
            ReadInputRegisters(_) => 0x04,
            WriteSingleCoil(_, _) => 0x05,
            WriteSingleRegister(_, _) => 0x06,
            WriteMultipleCoils(_, _) => 0x0F,
            WriteMultipleRegisters(_, _) => 0x10,
            MaskWriteRegister(_, _, _) => 0x16,
        }
    }
}

/// Exception codes a slave can raise, numbered by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDevice = 0x0B,
}

impl ExceptionCode {
    /// Decode the code byte of an exception frame.
    #[must_use]
    pub fn new(code: u8) -> Option<Self> {
        use ExceptionCode::*;
        let decoded = match code {
            0x01 => IllegalFunction,
            0x02 => IllegalDataAddress,
            0x03 => IllegalDataValue,
            0x04 => ServerDeviceFailure,
            0x05 => Acknowledge,
            0x06 => ServerDeviceBusy,
            0x08 => MemoryParityError,
            0x0A => GatewayPathUnavailable,
            0x0B => GatewayTargetDevice,
            _ => return None,
        };
        Some(decoded)
    }

    /// What went wrong, for logs and error text.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        use ExceptionCode::*;
        match self {
            IllegalFunction => "function code not supported",
            IllegalDataAddress => "data address out of range",
            IllegalDataValue => "value not acceptable",
            ServerDeviceFailure => "device failed to execute the request",
            Acknowledge => "request accepted, completion pending",
            ServerDeviceBusy => "device busy",
            MemoryParityError => "parity check failed in device memory",
            GatewayPathUnavailable => "no path to the target device",
            GatewayTargetDevice => "target device did not respond",
        }
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

impl error::Error for ExceptionCode {}

/// An exception frame: the function code of the failed request plus
/// the code the slave raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionResponse {
    /// Function code of the failed request, without the error bit.
    pub function: FunctionCode,
    /// Reported exception code.
    pub exception: ExceptionCode,
}

impl fmt::Display for ExceptionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function 0x{:02X} failed: {}", self.function, self.exception)
    }
}

impl error::Error for ExceptionResponse {}
