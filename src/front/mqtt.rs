// SPDX-License-Identifier: MIT OR Apache-2.0

//! MQTT request/response bridge
//!
//! Subscribes to the request topic and publishes one reply per
//! received payload, using the same JSON schema as the TCP command
//! front. Connection loss is retried with a fixed backoff.

use std::{io, time::Duration};

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;

use crate::{
    arbiter::Handle,
    config::MqttConfig,
    front::{
        json::{self, Reply},
        Front,
    },
};

pub const REQUEST_TOPIC: &str = "modbus/rtu/request";
pub const RESPONSE_TOPIC: &str = "modbus/rtu/response";

const CLIENT_ID: &str = "modbus-gateway";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct MqttFront {
    handle: Handle,
    config: MqttConfig,
}

impl MqttFront {
    #[must_use]
    pub fn new(handle: Handle, config: MqttConfig) -> Self {
        Self { handle, config }
    }
}

#[async_trait]
impl Front for MqttFront {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> io::Result<()> {
        let mut options = MqttOptions::new(CLIENT_ID, self.config.broker.clone(), self.config.port);
        options.set_keep_alive(Duration::from_secs(30));
        if !self.config.username.is_empty() {
            options.set_credentials(self.config.username.clone(), self.config.password.clone());
        }
        let (client, mut event_loop) = AsyncClient::new(options, 16);

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = client.disconnect().await;
                    return Ok(());
                }
                event = event_loop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    log::info!(
                        "mqtt: connected to {}:{}",
                        self.config.broker,
                        self.config.port
                    );
                    // Subscriptions do not survive a reconnect, so they
                    // are (re)established on every connection ack.
                    if let Err(err) = client.subscribe(REQUEST_TOPIC, QoS::AtMostOnce).await {
                        log::warn!("mqtt: subscribe failed: {err}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish)))
                    if publish.topic == REQUEST_TOPIC =>
                {
                    let reply = match std::str::from_utf8(&publish.payload) {
                        Ok(line) => match json::parse_line(line) {
                            Ok(command) => json::execute(&self.handle, command).await,
                            Err(tag) => Reply::error(tag),
                        },
                        Err(_) => Reply::error("invalid_json"),
                    };
                    let payload = serde_json::to_vec(&reply)?;
                    if let Err(err) = client
                        .publish(RESPONSE_TOPIC, QoS::AtMostOnce, false, payload)
                        .await
                    {
                        log::warn!("mqtt: publish failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    log::warn!(
                        "mqtt: connection to {}:{} lost: {err}; retrying in {}s",
                        self.config.broker,
                        self.config.port,
                        RECONNECT_DELAY.as_secs()
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }
}
