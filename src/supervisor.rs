// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lifecycle supervisor: owns the arbiter, the catalog and the fronts
//!
//! Startup order: open the master (inside the arbiter worker), start
//! the fronts, then kick off the optional scan. On a termination signal
//! the fronts stop accepting, in-flight transactions drain through the
//! arbiter, and the port closes last. No transaction is aborted
//! mid-byte.

use std::{future::Future, io, sync::Arc};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    arbiter::Arbiter,
    catalog::{self, SlaveCatalog},
    config::GatewayConfig,
    front::{json::JsonFront, mqtt::MqttFront, tcp::TcpFront, Front},
    master::Master,
};

#[derive(Debug)]
pub struct Supervisor {
    config: GatewayConfig,
}

impl Supervisor {
    #[must_use]
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> io::Result<()> {
        self.run_until(termination_signal()).await
    }

    /// Run until the given future resolves.
    pub async fn run_until<S>(self, shutdown_signal: S) -> io::Result<()>
    where
        S: Future<Output = ()>,
    {
        let serial = self.config.modbus_rtu.clone();
        let arbiter = Arbiter::spawn(move || match Master::open_serial(&serial) {
            Ok(master) => master,
            Err(err) => {
                // Non-fatal: the fronts keep serving and answer 0x0B
                // until the port comes back via reconfiguration.
                log::error!("Failed to open {}: {err}; starting disconnected", serial.port);
                Master::disconnected(
                    serial.response_timeout(),
                    crate::master::inter_frame_delay(serial.baudrate),
                )
            }
        });
        let handle = arbiter.handle();

        let catalog = Arc::new(SlaveCatalog::new(self.config.slaves.clone()));
        if !catalog.is_empty() {
            log::info!("Catalog seeded with {} unit(s)", catalog.len());
        }

        let token = CancellationToken::new();
        let fronts: Vec<Box<dyn Front>> = vec![
            Box::new(TcpFront::new(handle.clone(), self.config.modbus_tcp.mb_port)),
            Box::new(JsonFront::new(
                handle.clone(),
                self.config.modbus_tcp.listen_port,
            )),
            Box::new(MqttFront::new(handle.clone(), self.config.mqtt.clone())),
        ];
        let front_tasks: Vec<_> = fronts
            .into_iter()
            .map(|front| spawn_front(front, token.clone()))
            .collect();

        let scan_task = self.config.slaves_autoscan_on_start.then(|| {
            let handle = handle.clone();
            let catalog = Arc::clone(&catalog);
            let token = token.clone();
            let units = self.config.slaves_scan_start..=self.config.slaves_scan_end;
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = catalog::scan(&handle, &catalog, units) => {}
                }
            })
        });

        shutdown_signal.await;
        log::info!("Shutting down");
        token.cancel();
        for task in front_tasks {
            let _ = task.await;
        }
        if let Some(task) = scan_task {
            let _ = task.await;
        }

        // All fronts are gone; dropping the last handle lets the worker
        // drain its queue and close the port.
        drop(handle);
        arbiter.shutdown().await;
        log::info!("Bye");
        Ok(())
    }
}

fn spawn_front(front: Box<dyn Front>, token: CancellationToken) -> JoinHandle<()> {
    let name = front.name();
    tokio::spawn(async move {
        if let Err(err) = front.run(token).await {
            // One dead front does not take the others down.
            log::error!("{name} front out of service: {err}");
        }
    })
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                log::warn!("SIGTERM handler unavailable: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
