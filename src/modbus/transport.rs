// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Modbus transports
//!
//! A transport is the opaque "send request, await response" capability used by
//! the command interface. Consumers never see the underlying serial port or
//! socket: they only hold a [`TransportHandle`].
//!
//! Two real transports are provided by [`ModbusLink`]:
//!
//! - **RTU over a serial port**, opened with `tokio-serial`
//! - **TCP client**, connected with `tokio-modbus`
//!
//! Requests on one link are serialized through an async mutex, so a new request
//! always waits for the previous response (or failure) before hitting the wire.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::Mutex;
use tokio::time;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, StopBits};

use crate::error::{BenchError, BenchResult};

/// Capability used by the command interface to reach a Modbus device
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    /// Read `count` holding registers of `unit` starting at `address`
    async fn read_holding_registers(&self, unit: u8, address: u16, count: u16)
        -> BenchResult<Vec<u16>>;

    /// Write `words` into the holding registers of `unit` starting at `address`
    async fn write_multiple_registers(&self, unit: u8, address: u16, words: &[u16])
        -> BenchResult<()>;

    /// Release the underlying port or socket. Further requests fail.
    async fn close(&self);

    /// Short description used in logs and status lines
    fn describe(&self) -> String;
}

/// Shared handle on the transport owned by the connection manager
#[derive(Clone)]
pub struct TransportHandle(Arc<dyn ModbusTransport>);

impl TransportHandle {
    pub fn new<T: ModbusTransport + 'static>(transport: T) -> Self {
        Self(Arc::new(transport))
    }

    /// Handle on a transport that rejects every request
    pub fn null() -> Self {
        Self::new(NullTransport)
    }
}

impl std::ops::Deref for TransportHandle {
    type Target = dyn ModbusTransport;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TransportHandle").field(&self.0.describe()).finish()
    }
}

/// Transport used while nothing is connected
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

#[async_trait]
impl ModbusTransport for NullTransport {
    async fn read_holding_registers(&self, unit: u8, _address: u16, _count: u16)
        -> BenchResult<Vec<u16>> {
        Err(BenchError::DeviceNotReady(format!("no transport for unit {unit}")))
    }

    async fn write_multiple_registers(&self, unit: u8, _address: u16, _words: &[u16])
        -> BenchResult<()> {
        Err(BenchError::DeviceNotReady(format!("no transport for unit {unit}")))
    }

    async fn close(&self) {}

    fn describe(&self) -> String {
        "null".to_string()
    }
}

/// Serial line settings for an RTU link
#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
}

/// Physical link behind a [`ModbusLink`]
#[derive(Debug, Clone, PartialEq)]
pub enum LinkKind {
    Serial(SerialSettings),
    Tcp(SocketAddr),
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Serial(s) => write!(f, "rtu {}@{}", s.port, s.baud_rate),
            LinkKind::Tcp(addr) => write!(f, "tcp {addr}"),
        }
    }
}

/// A tokio-modbus client context shared by every command issuer
pub struct ModbusLink {
    kind: LinkKind,
    timeout: Duration,
    ctx: Mutex<Option<Context>>,
}

impl ModbusLink {
    /// Open an RTU link on a serial port (8N1)
    ///
    /// ### Errors
    ///
    /// `PortBusy` when the port does not exist or is held by another process.
    pub async fn open_serial(settings: SerialSettings, timeout: Duration) -> BenchResult<Self> {
        debug!("Opening serial port {} at {} baud", settings.port, settings.baud_rate);
        let stream = tokio_serial::new(settings.port.as_str(), settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(timeout)
            .open_native_async()
            .map_err(|e| BenchError::PortBusy {
                port: settings.port.clone(),
                reason: e.to_string(),
            })?;
        let ctx = rtu::attach_slave(stream, Slave(0));
        Ok(Self {
            kind: LinkKind::Serial(settings),
            timeout,
            ctx: Mutex::new(Some(ctx)),
        })
    }

    /// Open a TCP client link
    ///
    /// ### Errors
    ///
    /// `HostUnreachable` when the name does not resolve, the connection is
    /// refused, or nothing answers within `timeout`.
    pub async fn open_tcp(host: &str, port: u16, timeout: Duration) -> BenchResult<Self> {
        let target = format!("{host}:{port}");
        let unreachable = |reason: String| BenchError::HostUnreachable {
            host: target.clone(),
            reason,
        };

        let addr = tokio::net::lookup_host(target.as_str())
            .await
            .map_err(|e| unreachable(e.to_string()))?
            .next()
            .ok_or_else(|| unreachable("name did not resolve".to_string()))?;

        debug!("Connecting Modbus TCP client to {addr}");
        let ctx = match time::timeout(timeout, tcp::connect_slave(addr, Slave(0))).await {
            Ok(Ok(ctx)) => ctx,
            Ok(Err(e)) => return Err(unreachable(e.to_string())),
            Err(_) => return Err(unreachable(format!("no answer within {} ms", timeout.as_millis()))),
        };
        Ok(Self {
            kind: LinkKind::Tcp(addr),
            timeout,
            ctx: Mutex::new(Some(ctx)),
        })
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }

    fn not_ready(&self) -> BenchError {
        BenchError::DeviceNotReady(format!("{} is closed", self.kind))
    }
}

fn device_exception(unit: u8, exception: ExceptionCode) -> BenchError {
    BenchError::DeviceException {
        unit,
        reason: format!("{exception:?}"),
    }
}

#[async_trait]
impl ModbusTransport for ModbusLink {
    async fn read_holding_registers(&self, unit: u8, address: u16, count: u16)
        -> BenchResult<Vec<u16>> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or_else(|| self.not_ready())?;
        ctx.set_slave(Slave(unit));
        match time::timeout(self.timeout, ctx.read_holding_registers(address, count)).await {
            Ok(Ok(Ok(words))) => Ok(words),
            Ok(Ok(Err(exception))) => Err(device_exception(unit, exception)),
            Ok(Err(e)) => Err(BenchError::Io(e.to_string())),
            Err(_) => Err(BenchError::Timeout(self.timeout_ms())),
        }
    }

    async fn write_multiple_registers(&self, unit: u8, address: u16, words: &[u16])
        -> BenchResult<()> {
        let mut guard = self.ctx.lock().await;
        let ctx = guard.as_mut().ok_or_else(|| self.not_ready())?;
        ctx.set_slave(Slave(unit));
        match time::timeout(self.timeout, ctx.write_multiple_registers(address, words)).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(exception))) => Err(device_exception(unit, exception)),
            Ok(Err(e)) => Err(BenchError::Io(e.to_string())),
            Err(_) => Err(BenchError::Timeout(self.timeout_ms())),
        }
    }

    async fn close(&self) {
        let mut guard = self.ctx.lock().await;
        if let Some(mut ctx) = guard.take() {
            debug!("Closing {}", self.kind);
            if let Err(e) = ctx.disconnect().await {
                warn!("Error while closing {}: {}", self.kind, e);
            }
        }
    }

    fn describe(&self) -> String {
        self.kind.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_null_transport_is_not_ready() {
        let handle = TransportHandle::null();
        assert!(matches!(
            handle.read_holding_registers(14, 0, 1).await,
            Err(BenchError::DeviceNotReady(_))
        ));
        assert!(matches!(
            handle.write_multiple_registers(1, 1, &[0]).await,
            Err(BenchError::DeviceNotReady(_))
        ));
        assert_eq!(format!("{handle:?}"), "TransportHandle(\"null\")");
    }

    #[tokio::test]
    async fn test_missing_serial_port_is_busy() {
        let settings = SerialSettings {
            port: "/dev/does-not-exist-ddii".to_string(),
            baud_rate: 125_000,
        };
        let result = ModbusLink::open_serial(settings, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(BenchError::PortBusy { .. })));
    }

    #[tokio::test]
    async fn test_refused_tcp_is_unreachable() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = ModbusLink::open_tcp("127.0.0.1", port, Duration::from_millis(500)).await;
        assert!(matches!(result, Err(BenchError::HostUnreachable { .. })));
    }
}
