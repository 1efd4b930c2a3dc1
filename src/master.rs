// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTU master: owns the serial transport and performs one transaction
//! at a time

use std::{io, time::Duration};

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::Instant,
};
use tokio_serial::SerialStream;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    codec::rtu::MasterCodec,
    config::SerialConfig,
    error::TransportError,
    frame::{
        rtu::{RequestFrame, ResponseFrame},
        ExceptionResponse, Request, Response,
    },
    slave::{Slave, SlaveId},
};

/// Outcome of one transaction on the bus.
///
/// The outer result is the transport; the inner result distinguishes
/// data responses from Modbus exceptions, both of which are complete
/// transactions.
pub type TransactionResult = Result<Result<Response, ExceptionResponse>, TransportError>;

/// Default bound on a complete reply arriving on the wire.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Silent interval required between frames: 3.5 character times at 11
/// bits per character, with the fixed 1750 µs floor recommended for
/// rates above 19200 baud.
#[must_use]
pub fn inter_frame_delay(baudrate: u32) -> Duration {
    if baudrate > 19_200 || baudrate == 0 {
        Duration::from_micros(1750)
    } else {
        Duration::from_micros(38_500_000 / u64::from(baudrate))
    }
}

/// Modbus RTU master over an arbitrary byte transport.
///
/// The transport is generic so tests can run the master against an
/// in-memory bus; production code uses [`Master<SerialStream>`].
/// Without a transport the master is *disconnected* and every
/// transaction resolves to [`TransportError::NotConnected`].
#[derive(Debug)]
pub struct Master<T> {
    transport: Option<T>,
    codec: MasterCodec,
    rd_buf: BytesMut,
    response_timeout: Duration,
    frame_gap: Duration,
    next_send_at: Option<Instant>,
}

impl<T> Master<T> {
    pub fn new(transport: T, response_timeout: Duration, frame_gap: Duration) -> Self {
        Self {
            transport: Some(transport),
            codec: MasterCodec,
            rd_buf: BytesMut::new(),
            response_timeout,
            frame_gap,
            next_send_at: None,
        }
    }

    /// A master without a transport, i.e. with a serial port that could
    /// not be opened. Requests fail fast until a reconfiguration opens
    /// the port again.
    pub fn disconnected(response_timeout: Duration, frame_gap: Duration) -> Self {
        Self {
            transport: None,
            codec: MasterCodec,
            rd_buf: BytesMut::new(),
            response_timeout,
            frame_gap,
            next_send_at: None,
        }
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Drop the transport, closing the underlying port.
    pub fn close(&mut self) {
        self.transport = None;
    }
}

impl Master<SerialStream> {
    /// Open the serial port described by the configuration.
    pub fn open_serial(config: &SerialConfig) -> io::Result<Self> {
        let builder = tokio_serial::new(&config.port, config.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(config.parity.into())
            .stop_bits(config.stopbits.into());
        let stream = SerialStream::open(&builder).map_err(io::Error::from)?;
        log::info!(
            "Opened {} at {} baud ({}{}{})",
            config.port,
            config.baudrate,
            8,
            config.parity,
            config.stopbits
        );
        Ok(Self::new(
            stream,
            config.response_timeout(),
            inter_frame_delay(config.baudrate),
        ))
    }
}

impl<T> Master<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Perform one request/response transaction with the default
    /// response timeout.
    pub async fn transact(&mut self, slave: Slave, request: Request) -> TransactionResult {
        self.transact_with_timeout(slave, request, None).await
    }

    /// Perform one request/response transaction.
    ///
    /// The master never retries; timeout, checksum and framing faults
    /// are reported to the caller as they happened on the wire.
    pub async fn transact_with_timeout(
        &mut self,
        slave: Slave,
        request: Request,
        timeout_override: Option<Duration>,
    ) -> TransactionResult {
        let response_timeout = timeout_override.unwrap_or(self.response_timeout);
        let Some(transport) = self.transport.as_mut() else {
            return Err(TransportError::NotConnected);
        };

        // Respect the inter-frame silence before occupying the bus again.
        if let Some(at) = self.next_send_at {
            tokio::time::sleep_until(at).await;
        }

        log::debug!("{slave}: {request:?}");

        let mut frame = BytesMut::new();
        self.codec.encode(
            RequestFrame {
                slave: slave.into(),
                request: request.clone(),
            },
            &mut frame,
        )?;

        // Stale bytes of an earlier, timed-out response must not be
        // mistaken for the reply to this request.
        self.rd_buf.clear();

        let exchanged = exchange(
            transport,
            &mut self.codec,
            &mut self.rd_buf,
            &frame,
            response_timeout,
        )
        .await;
        self.next_send_at = Some(Instant::now() + self.frame_gap);

        verify_reply(slave, &request, exchanged?)
    }
}

async fn exchange<T>(
    transport: &mut T,
    codec: &mut MasterCodec,
    rd_buf: &mut BytesMut,
    frame: &[u8],
    response_timeout: Duration,
) -> Result<ResponseFrame, TransportError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    transport.write_all(frame).await?;
    transport.flush().await?;

    let deadline = Instant::now() + response_timeout;
    loop {
        if let Some(frame) = codec.decode(rd_buf)? {
            return Ok(frame);
        }
        match tokio::time::timeout_at(deadline, transport.read_buf(rd_buf)).await {
            Err(_) => return Err(TransportError::Timeout),
            Ok(Ok(0)) => {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "transport closed",
                )))
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err.into()),
        }
    }
}

fn verify_reply(slave: Slave, request: &Request, frame: ResponseFrame) -> TransactionResult {
    let ResponseFrame { slave: from, reply } = frame;
    if from != SlaveId::from(slave) {
        return Err(TransportError::Framing("response from unexpected slave"));
    }
    match reply {
        Ok(response) => verify_response(request, response).map(Ok),
        Err(exception) => {
            if exception.function != request.function_code() {
                return Err(TransportError::Framing("exception for unexpected function"));
            }
            Ok(Err(exception))
        }
    }
}

/// Reconcile a data response with the request it answers.
///
/// Bit reads come back padded to whole bytes and are truncated to the
/// requested quantity; register reads and write echoes must match the
/// request exactly.
fn verify_response(request: &Request, response: Response) -> Result<Response, TransportError> {
    match (request, response) {
        (Request::ReadCoils(_, quantity), Response::ReadCoils(mut coils)) => {
            if coils.len() < usize::from(*quantity) {
                return Err(TransportError::Framing("truncated coil response"));
            }
            coils.truncate(usize::from(*quantity));
            Ok(Response::ReadCoils(coils))
        }
        (Request::ReadDiscreteInputs(_, quantity), Response::ReadDiscreteInputs(mut inputs)) => {
            if inputs.len() < usize::from(*quantity) {
                return Err(TransportError::Framing("truncated discrete input response"));
            }
            inputs.truncate(usize::from(*quantity));
            Ok(Response::ReadDiscreteInputs(inputs))
        }
        (Request::ReadHoldingRegisters(_, quantity), Response::ReadHoldingRegisters(words)) => {
            if words.len() != usize::from(*quantity) {
                return Err(TransportError::Framing("register count mismatch"));
            }
            Ok(Response::ReadHoldingRegisters(words))
        }
        (Request::ReadInputRegisters(_, quantity), Response::ReadInputRegisters(words)) => {
            if words.len() != usize::from(*quantity) {
                return Err(TransportError::Framing("register count mismatch"));
            }
            Ok(Response::ReadInputRegisters(words))
        }
        (
            Request::WriteSingleCoil(address, state),
            Response::WriteSingleCoil(echo_address, echo_state),
        ) => {
            if (*address, *state) != (echo_address, echo_state) {
                return Err(TransportError::Framing("write echo mismatch"));
            }
            Ok(Response::WriteSingleCoil(echo_address, echo_state))
        }
        (
            Request::WriteSingleRegister(address, word),
            Response::WriteSingleRegister(echo_address, echo_word),
        ) => {
            if (*address, *word) != (echo_address, echo_word) {
                return Err(TransportError::Framing("write echo mismatch"));
            }
            Ok(Response::WriteSingleRegister(echo_address, echo_word))
        }
        (
            Request::WriteMultipleCoils(address, coils),
            Response::WriteMultipleCoils(echo_address, quantity),
        ) => {
            if *address != echo_address || coils.len() != usize::from(quantity) {
                return Err(TransportError::Framing("write echo mismatch"));
            }
            Ok(Response::WriteMultipleCoils(echo_address, quantity))
        }
        (
            Request::WriteMultipleRegisters(address, words),
            Response::WriteMultipleRegisters(echo_address, quantity),
        ) => {
            if *address != echo_address || words.len() != usize::from(quantity) {
                return Err(TransportError::Framing("write echo mismatch"));
            }
            Ok(Response::WriteMultipleRegisters(echo_address, quantity))
        }
        (
            Request::MaskWriteRegister(address, and_mask, or_mask),
            Response::MaskWriteRegister(echo_address, echo_and, echo_or),
        ) => {
            if (*address, *and_mask, *or_mask) != (echo_address, echo_and, echo_or) {
                return Err(TransportError::Framing("write echo mismatch"));
            }
            Ok(Response::MaskWriteRegister(echo_address, echo_and, echo_or))
        }
        _ => Err(TransportError::Framing("response function mismatch")),
    }
}
