//! BLE connection management.
//!
//! Owns the link to a single glucose meter peripheral and reports
//! state changes to interested listeners. Session sequencing lives
//! elsewhere; this layer only cares whether the link is up.
//!
//! A readout session is one short exchange, so connecting is a single
//! attempt. The only policy carried here is whether a dropped link
//! should be re-established so the session can restart.

use btleplug::api::Peripheral as _;
use btleplug::platform::Peripheral;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::error::{Error, Result};

/// Link state for a meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No link to the meter.
    #[default]
    Disconnected,
    /// Connection attempt in flight.
    Connecting,
    /// Link established.
    Connected,
    /// Teardown in flight.
    Disconnecting,
}

impl ConnectionState {
    /// Check if the link is up.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a connect or disconnect is still in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting | Self::Disconnecting)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Emitted whenever the link state changes.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    /// Platform identifier of the meter peripheral.
    pub identifier: String,
    /// The state just entered.
    pub state: ConnectionState,
}

/// Manages the link to one glucose meter.
pub struct ConnectionManager {
    peripheral: Peripheral,
    state: Arc<RwLock<ConnectionState>>,
    /// Whether a dropped link gets re-established.
    reconnect_on_drop: Arc<RwLock<bool>>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    /// Create a manager for a discovered meter peripheral.
    pub fn new(peripheral: Peripheral) -> Self {
        let (event_tx, _) = broadcast::channel(16);

        Self {
            peripheral,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            reconnect_on_drop: Arc::new(RwLock::new(false)),
            event_tx,
        }
    }

    /// Current link state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Check if the link is up.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Subscribe to link state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }

    /// The managed peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    /// Connect to the meter. One attempt; the caller decides whether
    /// a later link drop is worth re-establishing.
    pub async fn connect(&self, reconnect_on_drop: bool) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => {
                debug!("Already connected");
                return Ok(());
            }
            state if state.is_transitioning() => {
                return Err(Error::ConnectionFailed {
                    reason: format!("link is {}", state),
                });
            }
            _ => {}
        }

        *self.reconnect_on_drop.write() = reconnect_on_drop;
        self.set_state(ConnectionState::Connecting);

        match self.establish().await {
            Ok(()) => {
                info!("Connected to meter");
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Bring the link up and populate the attribute cache that
    /// discovery later resolves against.
    async fn establish(&self) -> Result<()> {
        // The platform may still hold the link from a previous run.
        if self.peripheral.is_connected().await.unwrap_or(false) {
            info!("Peripheral already connected at BLE level");
        } else {
            self.peripheral.connect().await.map_err(Error::Bluetooth)?;
        }

        // Without the cached table every later lookup would miss, so
        // this failure is fatal to the attempt.
        self.peripheral
            .discover_services()
            .await
            .map_err(Error::Bluetooth)
    }

    /// Tear down the link to the meter.
    pub async fn disconnect(&self) -> Result<()> {
        *self.reconnect_on_drop.write() = false;

        if matches!(
            self.state(),
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            return Ok(());
        }

        self.set_state(ConnectionState::Disconnecting);
        let result = self.peripheral.disconnect().await;
        self.set_state(ConnectionState::Disconnected);

        match result {
            Ok(_) => {
                info!("Disconnected from meter");
                Ok(())
            }
            Err(e) => {
                error!("Failed to disconnect: {}", e);
                Err(Error::Bluetooth(e))
            }
        }
    }

    /// Whether a dropped link will be re-established.
    pub fn reconnects_on_drop(&self) -> bool {
        *self.reconnect_on_drop.read()
    }

    /// React to an observed link drop.
    pub async fn handle_disconnection(&self) {
        self.set_state(ConnectionState::Disconnected);

        if !*self.reconnect_on_drop.read() {
            return;
        }

        info!("Connection lost, attempting to reconnect...");

        if let Err(e) = self.connect(true).await {
            error!("Reconnection failed: {}", e);
        }
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };

        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);

            let _ = self.event_tx.send(ConnectionEvent {
                identifier: format!("{:?}", self.peripheral.id()),
                state: new_state,
            });
        }
    }
}
