// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end tests of the JSON-over-TCP command front.

mod sim;

use std::{net::SocketAddr, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

use modbus_gateway::{
    arbiter::{Arbiter, Handle},
    front::json::JsonFront,
    master::Master,
    slave::Slave,
};

use sim::{Behavior, SimSlave};

const RESPONSE_TIMEOUT: Duration = Duration::from_millis(200);
const FRAME_GAP: Duration = Duration::from_micros(100);

async fn start_front(slave: SimSlave) -> Result<(SocketAddr, Handle, CancellationToken, Arbiter)> {
    let (master_io, bus) = tokio::io::duplex(4096);
    slave.spawn(bus);
    let arbiter = Arbiter::spawn(move || Master::new(master_io, RESPONSE_TIMEOUT, FRAME_GAP));
    let handle = arbiter.handle();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let token = CancellationToken::new();
    tokio::spawn(JsonFront::serve(listener, handle.clone(), token.clone()));
    Ok((addr, handle, token, arbiter))
}

/// One-shot exchange: send a line, read the reply line, expect EOF.
async fn roundtrip(addr: SocketAddr, request: &str) -> Result<String> {
    let stream = TcpStream::connect(addr).await?;
    let (reader, mut writer) = stream.into_split();
    writer.write_all(request.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    let mut lines = BufReader::new(reader).lines();
    let reply = lines
        .next_line()
        .await?
        .ok_or_else(|| anyhow::anyhow!("connection closed without reply"))?;
    assert!(lines.next_line().await?.is_none(), "expected one-shot close");
    Ok(reply)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_holding_returns_registers() -> Result<()> {
    let (addr, handle, token, arbiter) =
        start_front(SimSlave::new().holding(1, &[(0, 0x0001), (1, 0x0203)])).await?;

    let reply = roundtrip(addr, r#"{"cmd":"read_holding","unit":1,"address":0,"count":2}"#).await?;
    assert_eq!(reply, r#"{"ok":true,"registers":[1,515]}"#);

    drop(handle);
    token.cancel();
    arbiter.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn write_updates_the_slave() -> Result<()> {
    let (addr, handle, token, arbiter) = start_front(SimSlave::new().unit(1)).await?;

    let reply = roundtrip(addr, r#"{"cmd":"write","unit":1,"address":16,"value":255}"#).await?;
    assert_eq!(reply, r#"{"ok":true}"#);

    let words = handle.read_holding_registers(Slave(1), 16, 1).await?;
    assert_eq!(words, vec![255]);

    drop(handle);
    token.cancel();
    arbiter.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn protocol_failures_have_textual_tags() -> Result<()> {
    let (addr, handle, token, arbiter) = start_front(
        SimSlave::new()
            .unit(1)
            .unit_with_behavior(5, Behavior::Silent),
    )
    .await?;

    let reply = roundtrip(addr, r#"{"cmd":"reboot"}"#).await?;
    assert_eq!(reply, r#"{"ok":false,"error":"unknown_cmd"}"#);

    let reply = roundtrip(addr, "{ not json").await?;
    assert_eq!(reply, r#"{"ok":false,"error":"invalid_json"}"#);

    let reply = roundtrip(addr, r#"{"cmd":"read_holding","unit":5,"address":0,"count":1}"#).await?;
    assert_eq!(reply, r#"{"ok":false,"error":"timeout"}"#);

    let reply = roundtrip(addr, r#"{"cmd":"read_holding","unit":0,"address":0,"count":1}"#).await?;
    assert_eq!(reply, r#"{"ok":false,"error":"illegal_data_address"}"#);

    let reply =
        roundtrip(addr, r#"{"cmd":"read_holding","unit":1,"address":0,"count":200}"#).await?;
    assert_eq!(reply, r#"{"ok":false,"error":"illegal_data_value"}"#);

    drop(handle);
    token.cancel();
    arbiter.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_connection_is_closed_quietly() -> Result<()> {
    let (addr, handle, token, arbiter) = start_front(SimSlave::new().unit(1)).await?;

    let stream = TcpStream::connect(addr).await?;
    let (reader, writer) = stream.into_split();
    drop(writer); // EOF without sending anything
    let mut lines = BufReader::new(reader).lines();
    assert!(lines.next_line().await?.is_none());

    drop(handle);
    token.cancel();
    arbiter.shutdown().await;
    Ok(())
}
