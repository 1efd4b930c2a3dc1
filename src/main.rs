// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{path::PathBuf, process::ExitCode};

use clap::Parser;

use modbus_gateway::{config::GatewayConfig, supervisor::Supervisor};

/// Modbus TCP/JSON/MQTT to Modbus RTU gateway.
#[derive(Debug, Parser)]
#[command(name = "modbus-gateway", version, about)]
struct Args {
    /// Path to the gateway configuration file.
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = match GatewayConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!("Cannot load {}: {err}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    match Supervisor::new(config).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("Gateway failed: {err}");
            ExitCode::FAILURE
        }
    }
}
