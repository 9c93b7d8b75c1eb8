// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the rust-ddii-bench project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! # Connection Manager
//!
//! The connection manager owns the single live transport of the bench and the
//! optional relay server built on top of it.
//!
//! ## State machine
//!
//! ```text
//!                  connect_* ok                start_relay
//! Disconnected ──► Connecting ──► Connected ───────────────► RelayActive
//!      ▲               │              │   ◄─────────────────      │
//!      │   connect_* fails            │        stop_relay         │
//!      └───────────────┴──── disconnect / both modules dead ──────┘
//! ```
//!
//! Every `connect_*` call first tears down whatever is open, so two
//! transports never coexist. Connection failures are reported as a `false`
//! return plus an [`ConnectionEvent::Error`]; they are never raised past the
//! call boundary. The last failure stays available through
//! [`ConnectionManager::last_error`].
//!
//! ## Subscriptions
//!
//! Consumers follow the manager through a broadcast channel of
//! [`ConnectionEvent`]s and a watch channel on [`ConnectionState`]. The
//! manager contains no UI logic; [`ConnectionState::tcp_role`] tells a front
//! end whether a TCP endpoint should be used as a client target or as a relay
//! listener.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::error::{BenchError, BenchResult};
use crate::modbus::registers::{CM_UNIT_ID, MPP_UNIT_ID_DEFAULT};
use crate::modbus::relay_server::{RelayServer, RelayStore, RELAY_BLOCK_SIZE};
use crate::modbus::transport::{ModbusLink, SerialSettings, TransportHandle};
use crate::modbus::{CmCommands, MppCommands};

/// Physical mode of the live transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Serial,
    Tcp,
}

/// Last known reachability of the two logical sub-devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModuleHealth {
    pub cm_ok: bool,
    pub mpp_ok: bool,
}

impl ModuleHealth {
    pub const fn healthy() -> Self {
        Self {
            cm_ok: true,
            mpp_ok: true,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.cm_ok != self.mpp_ok
    }

    pub fn is_dead(&self) -> bool {
        !self.cm_ok && !self.mpp_ok
    }
}

/// What a TCP endpoint means in the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpRole {
    /// Connect to a remote Modbus TCP server
    Client,
    /// Manage the relay listener of the open serial link
    Relay,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected {
        mode: ConnectionMode,
        health: ModuleHealth,
    },
    RelayActive {
        mode: ConnectionMode,
        health: ModuleHealth,
        relay_addr: SocketAddr,
    },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected { .. } | ConnectionState::RelayActive { .. }
        )
    }

    pub fn mode(&self) -> Option<ConnectionMode> {
        match self {
            ConnectionState::Connected { mode, .. } | ConnectionState::RelayActive { mode, .. } => {
                Some(*mode)
            }
            _ => None,
        }
    }

    pub fn health(&self) -> ModuleHealth {
        match self {
            ConnectionState::Connected { health, .. }
            | ConnectionState::RelayActive { health, .. } => *health,
            _ => ModuleHealth::default(),
        }
    }

    /// A TCP endpoint manages the relay while a serial link is open
    pub fn tcp_role(&self) -> TcpRole {
        match self.mode() {
            Some(ConnectionMode::Serial) => TcpRole::Relay,
            _ => TcpRole::Client,
        }
    }

    fn with_health(&self, health: ModuleHealth) -> ConnectionState {
        match self {
            ConnectionState::Connected { mode, .. } => ConnectionState::Connected {
                mode: *mode,
                health,
            },
            ConnectionState::RelayActive {
                mode, relay_addr, ..
            } => ConnectionState::RelayActive {
                mode: *mode,
                health,
                relay_addr: *relay_addr,
            },
            other => other.clone(),
        }
    }
}

/// Notifications published by the manager
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StatusChanged(ConnectionState),
    Established {
        mode: ConnectionMode,
        transport: TransportHandle,
    },
    Lost,
    Error(BenchError),
}

/// Identity of the open link, used to decide whether it can be reused
#[derive(Debug, Clone, PartialEq)]
pub enum LinkFingerprint {
    Serial {
        port: String,
        baud_rate: u32,
        timeout_ms: u64,
    },
    Tcp {
        host: String,
        port: u16,
    },
    /// Transport injected by the caller (simulation)
    Attached,
}

impl LinkFingerprint {
    /// `true` when the link satisfies the given serial settings
    pub fn satisfies_serial(&self, port: &str, baud_rate: u32, timeout_ms: u64) -> bool {
        match self {
            LinkFingerprint::Serial {
                port: p,
                baud_rate: b,
                timeout_ms: t,
            } => p == port && *b == baud_rate && *t == timeout_ms,
            LinkFingerprint::Attached => true,
            LinkFingerprint::Tcp { .. } => false,
        }
    }
}

/// Settings applied to every link the manager opens
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub timeout: Duration,
    pub mpp_id: u8,
    pub cm_id: u8,
    pub wire_trace: bool,
    pub relay_block_size: usize,
    pub mirror_interval: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            mpp_id: MPP_UNIT_ID_DEFAULT,
            cm_id: CM_UNIT_ID,
            wire_trace: false,
            relay_block_size: RELAY_BLOCK_SIZE,
            mirror_interval: None,
        }
    }
}

struct MirrorTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    transport: Option<TransportHandle>,
    fingerprint: Option<LinkFingerprint>,
    relay: Option<RelayServer>,
    mirror: Option<MirrorTask>,
    last_error: Option<BenchError>,
}

/// Owner of the live transport
///
/// Share it with `Arc`; every method takes `&self`. Connection operations are
/// serialized by an internal async mutex.
pub struct ConnectionManager {
    settings: ConnectionSettings,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Self {
            settings,
            inner: Mutex::new(Inner::default()),
            state_tx,
            events,
        }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// `true` when a relay can be started from the current state
    pub fn relay_allowed(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected {
                mode: ConnectionMode::Serial,
                ..
            }
        )
    }

    pub async fn last_error(&self) -> Option<BenchError> {
        self.inner.lock().await.last_error.clone()
    }

    pub async fn transport(&self) -> Option<TransportHandle> {
        self.inner.lock().await.transport.clone()
    }

    pub async fn fingerprint(&self) -> Option<LinkFingerprint> {
        self.inner.lock().await.fingerprint.clone()
    }

    /// Command issuer for the measurement module on the live transport
    pub async fn mpp(&self) -> BenchResult<MppCommands> {
        self.transport()
            .await
            .map(|t| self.mpp_on(t))
            .ok_or_else(|| BenchError::DeviceNotReady("not connected".to_string()))
    }

    /// Command issuer for the control module on the live transport
    pub async fn cm(&self) -> BenchResult<CmCommands> {
        self.transport()
            .await
            .map(|t| self.cm_on(t))
            .ok_or_else(|| BenchError::DeviceNotReady("not connected".to_string()))
    }

    fn mpp_on(&self, transport: TransportHandle) -> MppCommands {
        MppCommands::new(transport, self.settings.mpp_id).with_wire_trace(self.settings.wire_trace)
    }

    fn cm_on(&self, transport: TransportHandle) -> CmCommands {
        CmCommands::with_unit(transport, self.settings.cm_id)
            .with_wire_trace(self.settings.wire_trace)
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscriber is not an error
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state_tx.borrow() == state {
            return;
        }
        debug!("Connection state -> {state:?}");
        self.state_tx.send_replace(state.clone());
        self.emit(ConnectionEvent::StatusChanged(state));
    }

    /// Open an RTU link on a serial port
    ///
    /// Returns `false` when the port cannot be opened; the reason is kept in
    /// [`Self::last_error`] and published as an event.
    pub async fn connect_serial(&self, port: &str, baud_rate: u32) -> bool {
        self.connect_serial_with_timeout(port, baud_rate, self.settings.timeout)
            .await
    }

    /// Open an RTU link with a response timeout other than the configured one
    pub async fn connect_serial_with_timeout(
        &self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> bool {
        let settings = SerialSettings {
            port: port.to_string(),
            baud_rate,
        };
        let fingerprint = LinkFingerprint::Serial {
            port: port.to_string(),
            baud_rate,
            timeout_ms: timeout.as_millis() as u64,
        };
        info!("Connecting to serial port {port} at {baud_rate} baud");
        self.establish(ConnectionMode::Serial, fingerprint, async move {
            ModbusLink::open_serial(settings, timeout)
                .await
                .map(TransportHandle::new)
        })
        .await
    }

    /// Open a TCP client link
    pub async fn connect_tcp(&self, host: &str, port: u16) -> bool {
        let fingerprint = LinkFingerprint::Tcp {
            host: host.to_string(),
            port,
        };
        let timeout = self.settings.timeout;
        let host_owned = host.to_string();
        info!("Connecting to Modbus TCP server {host}:{port}");
        self.establish(ConnectionMode::Tcp, fingerprint, async move {
            ModbusLink::open_tcp(&host_owned, port, timeout)
                .await
                .map(TransportHandle::new)
        })
        .await
    }

    /// Install a transport built by the caller (simulated device, tests)
    pub async fn attach_transport(&self, mode: ConnectionMode, transport: TransportHandle) -> bool {
        info!("Attaching transport {}", transport.describe());
        self.establish(mode, LinkFingerprint::Attached, async move { Ok(transport) })
            .await
    }

    async fn establish<F>(&self, mode: ConnectionMode, fingerprint: LinkFingerprint, open: F) -> bool
    where
        F: Future<Output = BenchResult<TransportHandle>>,
    {
        let mut inner = self.inner.lock().await;
        self.disconnect_locked(&mut inner).await;
        self.set_state(ConnectionState::Connecting);

        match open.await {
            Ok(transport) => {
                info!("Connected: {}", transport.describe());
                inner.transport = Some(transport.clone());
                inner.fingerprint = Some(fingerprint);
                inner.last_error = None;
                self.set_state(ConnectionState::Connected {
                    mode,
                    health: ModuleHealth::healthy(),
                });
                self.emit(ConnectionEvent::Established { mode, transport });
                true
            }
            Err(e) => {
                warn!("Connection failed: {e}");
                inner.last_error = Some(e.clone());
                self.set_state(ConnectionState::Disconnected);
                self.emit(ConnectionEvent::Error(e));
                false
            }
        }
    }

    /// Close everything that is open
    ///
    /// Idempotent. `Lost` is only published when a link was actually open.
    pub async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        self.disconnect_locked(&mut inner).await;
    }

    async fn disconnect_locked(&self, inner: &mut Inner) {
        let was_connected = self.state().is_connected();
        self.stop_relay_locked(inner).await;
        if let Some(transport) = inner.transport.take() {
            info!("Closing {}", transport.describe());
            transport.close().await;
        }
        inner.fingerprint = None;
        self.set_state(ConnectionState::Disconnected);
        if was_connected {
            self.emit(ConnectionEvent::Lost);
        }
    }

    /// Probe the control module and/or the measurement module
    ///
    /// Unchecked modules keep their previous health. When both modules are
    /// found dead the manager disconnects; a single dead module only marks the
    /// connection as degraded.
    pub async fn check_modules(&self, check_cm: bool, check_mpp: bool) -> ModuleHealth {
        let mut inner = self.inner.lock().await;
        let Some(transport) = inner.transport.clone() else {
            return ModuleHealth::default();
        };
        let state = self.state();
        let mut health = state.health();

        if check_cm {
            health.cm_ok = match self.cm_on(transport.clone()).probe().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Control module (unit {}) unreachable: {e}", self.settings.cm_id);
                    false
                }
            };
        }
        if check_mpp {
            health.mpp_ok = match self.mpp_on(transport).probe().await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Measurement module (unit {}) unreachable: {e}", self.settings.mpp_id);
                    false
                }
            };
        }

        if health.is_dead() {
            warn!("Both modules are unreachable, dropping the connection");
            self.disconnect_locked(&mut inner).await;
        } else {
            self.set_state(state.with_health(health));
        }
        health
    }

    /// Start the TCP relay on top of the open serial link
    ///
    /// ### Errors
    ///
    /// `DeviceNotReady` unless the manager is connected in serial mode without
    /// a relay, `HostUnreachable`/`Io` when the listen address cannot be used.
    pub async fn start_relay(&self, host: &str, port: u16) -> BenchResult<SocketAddr> {
        let mut inner = self.inner.lock().await;
        let health = match self.state() {
            ConnectionState::Connected {
                mode: ConnectionMode::Serial,
                health,
            } => health,
            ConnectionState::RelayActive { relay_addr, .. } => {
                return Err(BenchError::DeviceNotReady(format!(
                    "relay already running on {relay_addr}"
                )))
            }
            ConnectionState::Connected { .. } => {
                return Err(BenchError::DeviceNotReady(
                    "relay needs a serial connection".to_string(),
                ))
            }
            _ => return Err(BenchError::DeviceNotReady("not connected".to_string())),
        };
        let transport = inner
            .transport
            .clone()
            .ok_or_else(|| BenchError::DeviceNotReady("not connected".to_string()))?;

        let target = format!("{host}:{port}");
        let bind_addr = tokio::net::lookup_host(target.as_str())
            .await
            .map_err(|e| BenchError::HostUnreachable {
                host: target.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| BenchError::HostUnreachable {
                host: target.clone(),
                reason: "name did not resolve".to_string(),
            })?;

        let store = RelayStore::new(self.settings.relay_block_size);
        let server = RelayServer::start(bind_addr, store.clone()).await?;
        let relay_addr = server.local_addr();

        let mpp = self.mpp_on(transport);
        if let Err(e) = refresh_mirror(&mpp, &store).await {
            warn!("Initial relay mirror refresh failed: {e}");
        }
        if let Some(interval) = self.settings.mirror_interval {
            inner.mirror = Some(spawn_mirror_task(mpp, store, interval));
        }

        inner.relay = Some(server);
        self.set_state(ConnectionState::RelayActive {
            mode: ConnectionMode::Serial,
            health,
            relay_addr,
        });
        Ok(relay_addr)
    }

    /// Stop the relay; returns `false` when none was running
    pub async fn stop_relay(&self) -> bool {
        let mut inner = self.inner.lock().await;
        self.stop_relay_locked(&mut inner).await
    }

    async fn stop_relay_locked(&self, inner: &mut Inner) -> bool {
        if let Some(mirror) = inner.mirror.take() {
            mirror.cancel.cancel();
            if let Err(e) = mirror.task.await {
                warn!("Relay mirror task ended abnormally: {e}");
            }
        }
        let Some(server) = inner.relay.take() else {
            return false;
        };
        server.stop().await;
        if let ConnectionState::RelayActive { mode, health, .. } = self.state() {
            self.set_state(ConnectionState::Connected { mode, health });
        }
        true
    }

    /// Copy the measurement module registers into the relay block now
    ///
    /// Returns the number of words refreshed.
    pub async fn refresh_relay_mirror(&self) -> BenchResult<usize> {
        let inner = self.inner.lock().await;
        let relay = inner
            .relay
            .as_ref()
            .ok_or_else(|| BenchError::DeviceNotReady("relay is not running".to_string()))?;
        let transport = inner
            .transport
            .clone()
            .ok_or_else(|| BenchError::DeviceNotReady("not connected".to_string()))?;
        refresh_mirror(&self.mpp_on(transport), relay.store()).await
    }
}

async fn refresh_mirror(mpp: &MppCommands, store: &RelayStore) -> BenchResult<usize> {
    let words = mpp.read_raw(0, store.len() as u16).await?;
    Ok(store.publish(0, &words))
}

fn spawn_mirror_task(mpp: MppCommands, store: RelayStore, interval: Duration) -> MirrorTask {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let task = tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = refresh_mirror(&mpp, &store).await {
                        debug!("Relay mirror refresh failed: {e}");
                    }
                }
            }
        }
    });
    MirrorTask { cancel, task }
}
