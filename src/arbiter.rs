// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serialization arbiter: funnels every northbound caller onto the
//! single RTU master
//!
//! The master lives on a dedicated worker thread with its own
//! current-thread runtime, so a slow bus response never stalls the
//! network event loop. Admission is first-come-first-served through a
//! bounded queue; callers await a oneshot reply. A caller that goes
//! away while still queued is skipped before its request touches the
//! wire; one that goes away mid-transaction lets the transaction finish
//! and its reply is discarded.

use std::{thread, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
};

use crate::{
    error::{Error, Result, TransportError},
    frame::{Address, Coil, Quantity, Request, Response, Word},
    master::{Master, TransactionResult},
    slave::Slave,
};

/// Upper bound on queued transactions. Front-side backpressure (TCP
/// backlogs, MQTT in-flight) applies once the queue is full.
const QUEUE_DEPTH: usize = 64;

#[derive(Debug)]
struct Job {
    slave: Slave,
    request: Request,
    timeout: Option<Duration>,
    reply: oneshot::Sender<TransactionResult>,
}

/// Cloneable submission handle for the arbiter.
///
/// This is the API the fronts and the scanner talk to; it also exposes
/// the typed per-function operations of the master.
#[derive(Debug, Clone)]
pub struct Handle {
    tx: mpsc::Sender<Job>,
}

impl Handle {
    /// Submit a request and await its outcome.
    pub async fn call(&self, slave: Slave, request: Request) -> TransactionResult {
        self.call_with_timeout(slave, request, None).await
    }

    /// Submit a request with a per-transaction response timeout.
    pub async fn call_with_timeout(
        &self,
        slave: Slave,
        request: Request,
        timeout: Option<Duration>,
    ) -> TransactionResult {
        let (reply, rx) = oneshot::channel();
        let job = Job {
            slave,
            request,
            timeout,
            reply,
        };
        if self.tx.send(job).await.is_err() {
            return Err(TransportError::NotConnected);
        }
        rx.await.unwrap_or(Err(TransportError::NotConnected))
    }

    pub async fn read_coils(&self, slave: Slave, addr: Address, cnt: Quantity) -> Result<Vec<Coil>> {
        match self.flat_call(slave, Request::ReadCoils(addr, cnt)).await? {
            Response::ReadCoils(coils) => Ok(coils),
            _ => Err(unexpected_response()),
        }
    }

    pub async fn read_discrete_inputs(
        &self,
        slave: Slave,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Coil>> {
        match self
            .flat_call(slave, Request::ReadDiscreteInputs(addr, cnt))
            .await?
        {
            Response::ReadDiscreteInputs(inputs) => Ok(inputs),
            _ => Err(unexpected_response()),
        }
    }

    pub async fn read_holding_registers(
        &self,
        slave: Slave,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        match self
            .flat_call(slave, Request::ReadHoldingRegisters(addr, cnt))
            .await?
        {
            Response::ReadHoldingRegisters(words) => Ok(words),
            _ => Err(unexpected_response()),
        }
    }

    pub async fn read_input_registers(
        &self,
        slave: Slave,
        addr: Address,
        cnt: Quantity,
    ) -> Result<Vec<Word>> {
        match self
            .flat_call(slave, Request::ReadInputRegisters(addr, cnt))
            .await?
        {
            Response::ReadInputRegisters(words) => Ok(words),
            _ => Err(unexpected_response()),
        }
    }

    pub async fn write_single_coil(&self, slave: Slave, addr: Address, state: Coil) -> Result<()> {
        self.flat_call(slave, Request::WriteSingleCoil(addr, state))
            .await?;
        Ok(())
    }

    pub async fn write_single_register(
        &self,
        slave: Slave,
        addr: Address,
        word: Word,
    ) -> Result<()> {
        self.flat_call(slave, Request::WriteSingleRegister(addr, word))
            .await?;
        Ok(())
    }

    pub async fn write_multiple_coils(
        &self,
        slave: Slave,
        addr: Address,
        coils: &[Coil],
    ) -> Result<()> {
        self.flat_call(slave, Request::WriteMultipleCoils(addr, coils.to_vec()))
            .await?;
        Ok(())
    }

    pub async fn write_multiple_registers(
        &self,
        slave: Slave,
        addr: Address,
        words: &[Word],
    ) -> Result<()> {
        self.flat_call(slave, Request::WriteMultipleRegisters(addr, words.to_vec()))
            .await?;
        Ok(())
    }

    pub async fn mask_write_register(
        &self,
        slave: Slave,
        addr: Address,
        and_mask: Word,
        or_mask: Word,
    ) -> Result<()> {
        self.flat_call(slave, Request::MaskWriteRegister(addr, and_mask, or_mask))
            .await?;
        Ok(())
    }

    async fn flat_call(&self, slave: Slave, request: Request) -> Result<Response> {
        let response = self
            .call(slave, request)
            .await
            .map_err(Error::Transport)?
            .map_err(Error::Exception)?;
        Ok(response)
    }
}

fn unexpected_response() -> Error {
    Error::Transport(TransportError::Framing("unexpected response variant"))
}

/// The arbiter itself: owner of the worker thread.
///
/// Dropping the last [`Handle`] lets the worker drain its queue, close
/// the port and exit; [`Arbiter::shutdown`] additionally joins the
/// thread.
#[derive(Debug)]
pub struct Arbiter {
    handle: Handle,
    worker: Option<thread::JoinHandle<()>>,
}

impl Arbiter {
    /// Spawn the worker thread. `connect` runs inside the worker's
    /// runtime and produces the master, connected or not: a failed port
    /// open must yield a disconnected master instead of an error so the
    /// gateway keeps serving northbound clients.
    pub fn spawn<T, F>(connect: F) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        F: FnOnce() -> Master<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let worker = thread::Builder::new()
            .name("rtu-master".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        log::error!("Failed to start RTU worker runtime: {err}");
                        return;
                    }
                };
                // The master is built inside the runtime context so the
                // serial port can register with this worker's reactor.
                runtime.block_on(async move { serve(connect(), rx).await });
            });
        let worker = match worker {
            Ok(worker) => Some(worker),
            Err(err) => {
                log::error!("Failed to spawn RTU worker thread: {err}");
                None
            }
        };
        Self {
            handle: Handle { tx },
            worker,
        }
    }

    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Drop the owned handle and wait for the worker to drain its queue
    /// and close the port. Pending transactions complete first; each is
    /// bounded by the master's response timeout.
    pub async fn shutdown(self) {
        let Self { handle, worker } = self;
        drop(handle);
        if let Some(worker) = worker {
            let _ = tokio::task::spawn_blocking(move || worker.join()).await;
        }
    }
}

async fn serve<T>(mut master: Master<T>, mut rx: mpsc::Receiver<Job>)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(job) = rx.recv().await {
        // The caller may have disconnected while queued; leave the bus
        // alone in that case.
        if job.reply.is_closed() {
            log::debug!("Dropping request of a vanished caller: {:?}", job.request);
            continue;
        }
        let result = master
            .transact_with_timeout(job.slave, job.request, job.timeout)
            .await;
        // A send failure means the caller went away mid-transaction;
        // the result is discarded.
        let _ = job.reply.send(result);
    }
    master.close();
    log::debug!("RTU worker stopped");
}
