// SPDX-License-Identifier: MIT OR Apache-2.0

//! Line-delimited JSON command front
//!
//! One request object per line, one reply line, then the connection is
//! closed. The parse/execute/encode pipeline is shared with the MQTT
//! bridge, which speaks the same schema.

use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

use crate::{
    arbiter::Handle,
    error::{Error, TransportError},
    frame::{ExceptionCode, Word},
    front::{Front, IDLE_TIMEOUT},
    slave::Slave,
};

/// A northbound command in the JSON schema.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    ReadHolding {
        unit: u16,
        address: u16,
        count: u16,
    },
    Write {
        unit: u16,
        address: u16,
        value: u16,
    },
}

/// Reply object; `registers` only on successful reads, `error` only on
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registers: Option<Vec<Word>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    fn success() -> Self {
        Self {
            ok: true,
            registers: None,
            error: None,
        }
    }

    fn registers(registers: Vec<Word>) -> Self {
        Self {
            ok: true,
            registers: Some(registers),
            error: None,
        }
    }

    pub(crate) fn error(tag: impl Into<String>) -> Self {
        Self {
            ok: false,
            registers: None,
            error: Some(tag.into()),
        }
    }
}

/// Parse one request line.
///
/// Broken JSON and unknown commands get distinct tags so that clients
/// can tell a transport slip from an unsupported operation.
pub(crate) fn parse_line(line: &str) -> Result<Command, &'static str> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|_| "invalid_json")?;
    match value.get("cmd").and_then(serde_json::Value::as_str) {
        Some("read_holding" | "write") => {
            serde_json::from_value(value).map_err(|_| "invalid_request")
        }
        _ => Err("unknown_cmd"),
    }
}

/// Run one command over the bus.
pub(crate) async fn execute(handle: &Handle, command: Command) -> Reply {
    match command {
        Command::ReadHolding {
            unit,
            address,
            count,
        } => {
            let slave = match checked_unit(unit) {
                Ok(slave) => slave,
                Err(tag) => return Reply::error(tag),
            };
            if !(1..=125).contains(&count) {
                return Reply::error(exception_tag(ExceptionCode::IllegalDataValue));
            }
            match handle.read_holding_registers(slave, address, count).await {
                Ok(registers) => Reply::registers(registers),
                Err(err) => Reply::error(error_tag(&err)),
            }
        }
        Command::Write {
            unit,
            address,
            value,
        } => {
            let slave = match checked_unit(unit) {
                Ok(slave) => slave,
                Err(tag) => return Reply::error(tag),
            };
            match handle.write_single_register(slave, address, value).await {
                Ok(()) => Reply::success(),
                Err(err) => Reply::error(error_tag(&err)),
            }
        }
    }
}

fn checked_unit(unit: u16) -> Result<Slave, &'static str> {
    u8::try_from(unit)
        .ok()
        .map(Slave)
        .filter(|slave| slave.is_single_device())
        .ok_or(exception_tag(ExceptionCode::IllegalDataAddress))
}

pub(crate) fn error_tag(err: &Error) -> &'static str {
    match err {
        Error::Transport(TransportError::NotConnected) => "not_connected",
        Error::Transport(TransportError::Timeout) => "timeout",
        Error::Transport(TransportError::CrcMismatch { .. }) => "crc_mismatch",
        Error::Transport(TransportError::Framing(_)) => "framing_error",
        Error::Transport(TransportError::Io(_)) => "io_error",
        Error::Exception(exception) => exception_tag(exception.exception),
    }
}

const fn exception_tag(code: ExceptionCode) -> &'static str {
    match code {
        ExceptionCode::IllegalFunction => "illegal_function",
        ExceptionCode::IllegalDataAddress => "illegal_data_address",
        ExceptionCode::IllegalDataValue => "illegal_data_value",
        ExceptionCode::ServerDeviceFailure => "server_device_failure",
        ExceptionCode::Acknowledge => "acknowledge",
        ExceptionCode::ServerDeviceBusy => "server_device_busy",
        ExceptionCode::MemoryParityError => "memory_parity_error",
        ExceptionCode::GatewayPathUnavailable => "gateway_path_unavailable",
        ExceptionCode::GatewayTargetDevice => "gateway_target_failed",
    }
}

#[derive(Debug)]
pub struct JsonFront {
    handle: Handle,
    port: u16,
}

impl JsonFront {
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
                    log::warn!("json-tcp: accept failed: {err}");
                    continue;
                }
            };
            let handle = handle.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_connection(stream, handle).await {
                    log::debug!("json-tcp: connection from {peer} failed: {err}");
                }
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Front for JsonFront {
    fn name(&self) -> &'static str {
        "json-tcp"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> io::Result<()> {
        let listener = TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, self.port)).await?;
        log::info!("json-tcp: listening on {}", listener.local_addr()?);
        Self::serve(listener, self.handle, shutdown).await
    }
}

/// One-shot connection: read a line, answer it, close.
async fn serve_connection(stream: TcpStream, handle: Handle) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let line = match tokio::time::timeout(IDLE_TIMEOUT, lines.next_line()).await {
        Err(_) | Ok(Ok(None)) => return Ok(()),
        Ok(Err(err)) => return Err(err),
        Ok(Ok(Some(line))) => line,
    };
    let reply = match parse_line(&line) {
        Ok(command) => execute(&handle, command).await,
        Err(tag) => Reply::error(tag),
    };
    let mut out = serde_json::to_vec(&reply)?;
    out.push(b'\n');
    writer.write_all(&out).await?;
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_read_holding() {
        let command =
            parse_line(r#"{"cmd":"read_holding","unit":1,"address":0,"count":2}"#).unwrap();
        assert_eq!(
            command,
            Command::ReadHolding {
                unit: 1,
                address: 0,
                count: 2
            }
        );
    }

    #[test]
    fn parse_write() {
        let command = parse_line(r#"{"cmd":"write","unit":2,"address":16,"value":255}"#).unwrap();
        assert_eq!(
            command,
            Command::Write {
                unit: 2,
                address: 16,
                value: 255
            }
        );
    }

    #[test]
    fn parse_failures_have_distinct_tags() {
        assert_eq!(parse_line("{"), Err("invalid_json"));
        assert_eq!(parse_line(r#"{"cmd":"reboot"}"#), Err("unknown_cmd"));
        assert_eq!(parse_line(r#"{"unit":1}"#), Err("unknown_cmd"));
        assert_eq!(
            parse_line(r#"{"cmd":"read_holding","unit":1}"#),
            Err("invalid_request")
        );
        assert_eq!(
            parse_line(r#"{"cmd":"write","unit":1,"address":0,"value":99999}"#),
            Err("invalid_request")
        );
    }

    #[test]
    fn reply_wire_shape() {
        let line = serde_json::to_string(&Reply::registers(vec![1, 515])).unwrap();
        assert_eq!(line, r#"{"ok":true,"registers":[1,515]}"#);

        let line = serde_json::to_string(&Reply::success()).unwrap();
        assert_eq!(line, r#"{"ok":true}"#);

        let line = serde_json::to_string(&Reply::error("timeout")).unwrap();
        assert_eq!(line, r#"{"ok":false,"error":"timeout"}"#);
    }

    #[test]
    fn error_tags() {
        assert_eq!(
            error_tag(&Error::Transport(TransportError::Timeout)),
            "timeout"
        );
        assert_eq!(
            error_tag(&Error::Transport(TransportError::NotConnected)),
            "not_connected"
        );
        assert_eq!(
            error_tag(&Error::Exception(crate::frame::ExceptionResponse {
                function: 0x03,
                exception: ExceptionCode::IllegalDataAddress,
            })),
            "illegal_data_address"
        );
    }

    #[test]
    fn unit_validation() {
        assert!(checked_unit(1).is_ok());
        assert!(checked_unit(247).is_ok());
        assert_eq!(checked_unit(0), Err("illegal_data_address"));
        assert_eq!(checked_unit(248), Err("illegal_data_address"));
        assert_eq!(checked_unit(300), Err("illegal_data_address"));
    }
}
