// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus TCP relay server
//!
//! For avoiding confusion with the Modbus master/slave terminology, this module uses
//! the terms "server" and "client" instead. The relay is a server: a second bench
//! computer connects to it as a client while this computer keeps the serial link
//! to the DDII.
//!
//! The relay does not forward frames to the serial device. It serves a fixed,
//! zero-based block of holding registers (200 words by default) that mirrors the
//! measurement module; the connection manager refreshes the mirror from the live
//! serial link. Writes from the remote client land in the mirror only.
//!
//! ## Register Map
//!
//! | Relay address | Content |
//! |---------------|---------|
//! | 0 .. N-1 | MPP holding registers 0 .. N-1 as last refreshed |
//!
//! Input register reads return the same block.

use std::{
    future::{self, Future},
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    task::{Context, Poll},
    time::Duration,
};

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_modbus::{prelude::*, server::tcp::Server};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tokio_util::task::{task_tracker::TaskTrackerToken, TaskTracker};

use crate::error::{BenchError, BenchResult};

/// Default size of the relay register block
pub const RELAY_BLOCK_SIZE: usize = 200;

/// Upper bound on the wait for accepted clients to be dropped on stop
const CLIENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Sequential register block shared by the relay server and its publisher
#[derive(Debug, Clone)]
pub struct RelayStore {
    words: Arc<Mutex<Vec<u16>>>,
    open: Arc<AtomicBool>,
}

impl RelayStore {
    /// Create a zero-filled block of `size` words
    pub fn new(size: usize) -> Self {
        Self {
            words: Arc::new(Mutex::new(vec![0; size])),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u16>> {
        self.words.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy `values` into the block starting at `addr`
    ///
    /// Values that fall outside the block are dropped; the number of words
    /// actually stored is returned.
    pub fn publish(&self, addr: u16, values: &[u16]) -> usize {
        let mut words = self.lock();
        let start = addr as usize;
        if start >= words.len() {
            return 0;
        }
        let n = values.len().min(words.len() - start);
        words[start..start + n].copy_from_slice(&values[..n]);
        n
    }

    /// Copy of `cnt` words starting at `addr`, if entirely inside the block
    pub fn snapshot(&self, addr: u16, cnt: u16) -> Option<Vec<u16>> {
        let words = self.lock();
        let start = addr as usize;
        let end = start + cnt as usize;
        (end <= words.len()).then(|| words[start..end].to_vec())
    }

    /// Mark the block as closed; requests still in flight get a device failure
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// tokio-modbus service answering from a [`RelayStore`]
///
/// The relay answers on every unit id so that a client configured with the
/// MPP id reaches the same block.
#[derive(Debug, Clone)]
pub struct RelayModbusService {
    store: RelayStore,
}

impl RelayModbusService {
    pub fn new(store: RelayStore) -> Self {
        Self { store }
    }
}

impl tokio_modbus::server::Service for RelayModbusService {
    type Request = Request<'static>;
    type Response = Response;
    type Exception = ExceptionCode;
    type Future = future::Ready<Result<Self::Response, Self::Exception>>;

    fn call(&self, req: Self::Request) -> Self::Future {
        if !self.store.is_open() {
            return future::ready(Err(ExceptionCode::ServerDeviceFailure));
        }
        let res = match req {
            Request::ReadInputRegisters(addr, cnt) => {
                register_read(&self.store, addr, cnt).map(Response::ReadInputRegisters)
            }
            Request::ReadHoldingRegisters(addr, cnt) => {
                register_read(&self.store, addr, cnt).map(Response::ReadHoldingRegisters)
            }
            Request::WriteMultipleRegisters(addr, values) => {
                register_write(&self.store, addr, &values)
                    .map(|_| Response::WriteMultipleRegisters(addr, values.len() as u16))
            }
            Request::WriteSingleRegister(addr, value) => {
                register_write(&self.store, addr, std::slice::from_ref(&value))
                    .map(|_| Response::WriteSingleRegister(addr, value))
            }
            _ => {
                error!("RELAY: Exception::IllegalFunction - Unimplemented function code in request: {req:?}");
                Err(ExceptionCode::IllegalFunction)
            }
        };
        future::ready(res)
    }
}

/// Read a range of the block, failing when it is not entirely inside
fn register_read(store: &RelayStore, addr: u16, cnt: u16) -> Result<Vec<u16>, ExceptionCode> {
    store.snapshot(addr, cnt).ok_or_else(|| {
        error!("RELAY: Exception::IllegalDataAddress {addr}+{cnt}");
        ExceptionCode::IllegalDataAddress
    })
}

/// Write a range of the block. Used by both single and multiple writes.
fn register_write(store: &RelayStore, addr: u16, values: &[u16]) -> Result<(), ExceptionCode> {
    if addr as usize + values.len() > store.len() {
        error!("RELAY: Exception::IllegalDataAddress {addr}+{}", values.len());
        return Err(ExceptionCode::IllegalDataAddress);
    }
    store.publish(addr, values);
    Ok(())
}

/// Client socket accepted by the relay
///
/// Reads end with EOF once the relay is stopped, which makes the tokio-modbus
/// connection loop return and drop the socket. The tracker token keeps the
/// connection counted until then.
struct RelayStream {
    inner: TcpStream,
    cancel: CancellationToken,
    shutdown: Pin<Box<WaitForCancellationFutureOwned>>,
    _token: TaskTrackerToken,
}

impl RelayStream {
    fn new(inner: TcpStream, cancel: CancellationToken, token: TaskTrackerToken) -> Self {
        Self {
            inner,
            shutdown: Box::pin(cancel.clone().cancelled_owned()),
            cancel,
            _token: token,
        }
    }
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() || this.shutdown.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "relay stopped",
            )));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A running relay listener
#[derive(Debug)]
pub struct RelayServer {
    local_addr: SocketAddr,
    store: RelayStore,
    cancel: CancellationToken,
    clients: TaskTracker,
    task: JoinHandle<()>,
}

impl RelayServer {
    /// Bind `bind_addr` and start serving `store`
    ///
    /// ### Errors
    ///
    /// `Io` when the address cannot be bound.
    pub async fn start(bind_addr: SocketAddr, store: RelayStore) -> BenchResult<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| BenchError::Io(format!("cannot bind relay on {bind_addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        let server = Server::new(listener);
        let cancel = CancellationToken::new();
        let clients = TaskTracker::new();

        let service_store = store.clone();
        let client_cancel = cancel.clone();
        let client_tracker = clients.clone();
        let on_connected = move |stream: TcpStream, socket_addr: SocketAddr| {
            let store = service_store.clone();
            let cancel = client_cancel.clone();
            let tracker = client_tracker.clone();
            async move {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                debug!("Relay client connected from {socket_addr}");
                let stream = RelayStream::new(stream, cancel, tracker.token());
                Ok::<_, io::Error>(Some((RelayModbusService::new(store), stream)))
            }
        };
        let on_process_error = |err| {
            error!("Relay server error: {err}");
        };

        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                result = server.serve(&on_connected, on_process_error) => {
                    if let Err(e) = result {
                        error!("Relay server error: {}", e);
                    }
                }
                _ = token.cancelled() => {
                    debug!("Relay listener cancelled");
                }
            }
        });

        info!("Relay server listening on {local_addr}");
        Ok(Self {
            local_addr,
            store,
            cancel,
            clients,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &RelayStore {
        &self.store
    }

    /// Number of client connections currently open
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Stop accepting clients, close the accepted ones and release the listener
    pub async fn stop(self) {
        info!("Shutting down relay server on {}...", self.local_addr);
        self.store.close();
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Relay listener task ended abnormally: {e}");
        }
        self.clients.close();
        if tokio::time::timeout(CLIENT_DRAIN_TIMEOUT, self.clients.wait())
            .await
            .is_err()
        {
            warn!(
                "{} relay client(s) still open after shutdown",
                self.clients.len()
            );
        }
    }
}
