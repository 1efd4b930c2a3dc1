// SPDX-License-Identifier: MIT OR Apache-2.0

//! Northbound protocol fronts

pub mod json;
pub mod mqtt;
pub mod tcp;

use std::{io, time::Duration};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{error::TransportError, frame::ExceptionCode};

/// Idle timeout for northbound connections.
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A northbound protocol front.
#[async_trait]
pub trait Front: Send + 'static {
    /// Short name for log messages.
    fn name(&self) -> &'static str;

    /// Serve until the token is cancelled.
    ///
    /// An error return means this front is out of service; the other
    /// fronts and the bus are unaffected.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> io::Result<()>;
}

/// The exception code reported northbound for a failed transaction.
///
/// A bus that does not answer maps to `GatewayTargetDevice` (0x0B);
/// everything that corrupts the answer maps to `ServerDeviceFailure`
/// (0x04). Northbound connections stay open either way.
pub(crate) fn exception_for_transport(err: &TransportError) -> ExceptionCode {
    match err {
        TransportError::Timeout | TransportError::NotConnected => ExceptionCode::GatewayTargetDevice,
        TransportError::CrcMismatch { .. }
        | TransportError::Framing(_)
        | TransportError::Io(_) => ExceptionCode::ServerDeviceFailure,
    }
}
