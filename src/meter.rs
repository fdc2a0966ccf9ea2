//! Meter struct and methods.
//!
//! Represents a single BLE blood glucose meter and runs its readout
//! session: connection, the sequenced discovery/subscription script,
//! and streaming of decoded records to subscribers.

use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::ble::connection::{ConnectionManager, ConnectionState};
use crate::ble::transport::{RequestQueue, TransportRequest};
use crate::ble::uuids::{is_bgm_service, MeterHandles, BGM_SERVICE_UUID, NOTIFY_CHARACTERISTIC_UUID};
use crate::error::{Error, Result};
use crate::protocol::{GlucoseRecord, RouterEvent, TransferTotals};
use crate::session::{DiscoveryKind, DiscoveryRequest, SessionSequencer, SessionState};

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Represents a single BLE blood glucose meter.
pub struct Meter {
    /// BLE identifier.
    identifier: String,
    /// Attribute handle layout of this meter's GATT table.
    handles: MeterHandles,
    /// Connection manager.
    connection: Arc<ConnectionManager>,
    /// Session sequencer, present once a session has been started.
    sequencer: Arc<RwLock<Option<SessionSequencer<RequestQueue>>>>,
    /// Authorization requested before a session existed to receive it.
    authorize_pending: Arc<AtomicBool>,
    /// Decoded record channel.
    record_tx: broadcast::Sender<GlucoseRecord>,
    /// Transfer totals channel.
    totals_tx: broadcast::Sender<TransferTotals>,
    /// Callback ID counter.
    callback_counter: Arc<AtomicU64>,
}

impl Meter {
    /// Create a meter instance with the reference handle layout.
    pub fn new(identifier: String, peripheral: Peripheral) -> Self {
        Self::with_handles(identifier, peripheral, MeterHandles::default())
    }

    /// Create a meter instance with an explicit handle layout.
    pub fn with_handles(
        identifier: String,
        peripheral: Peripheral,
        handles: MeterHandles,
    ) -> Self {
        let (record_tx, _) = broadcast::channel(64);
        let (totals_tx, _) = broadcast::channel(16);

        Self {
            identifier,
            handles,
            connection: Arc::new(ConnectionManager::new(peripheral)),
            sequencer: Arc::new(RwLock::new(None)),
            authorize_pending: Arc::new(AtomicBool::new(false)),
            record_tx,
            totals_tx,
            callback_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    // === Identification ===

    /// Get the BLE identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Get the handle layout this meter was configured with.
    pub fn handles(&self) -> MeterHandles {
        self.handles
    }

    // === Connection ===

    /// Get the current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Get the current session state.
    pub fn session_state(&self) -> SessionState {
        self.sequencer
            .read()
            .as_ref()
            .map(|s| s.state())
            .unwrap_or_default()
    }

    /// Mark the meter as freshly bonded, arming the one-shot readout
    /// exchange for the next subscription.
    ///
    /// The platform BLE stack handles the pairing dialogue itself, so
    /// callers signal its completion here.
    pub fn authorize(&self) {
        let mut guard = self.sequencer.write();
        match guard.as_mut() {
            Some(sequencer) => sequencer.handle_pairing_complete(true),
            None => {
                self.authorize_pending.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Connect to the meter and run the readout session.
    pub async fn connect(&self) -> Result<()> {
        info!("Connecting to meter {}", self.identifier);

        self.connection.connect(true).await?;

        // A peripheral without the glucose service cannot run the
        // session; give it back rather than discovering into nothing.
        let has_service = self
            .connection
            .peripheral()
            .services()
            .iter()
            .any(|service| is_bgm_service(&service.uuid));
        if !has_service {
            self.connection.disconnect().await?;
            return Err(Error::ServiceNotFound {
                uuid: BGM_SERVICE_UUID.to_string(),
            });
        }

        info!("Connected to meter {}", self.identifier);

        let (queue, request_rx) = RequestQueue::new();
        let mut sequencer = SessionSequencer::new(queue, self.handles);
        if self.authorize_pending.swap(false, Ordering::SeqCst) {
            sequencer.handle_pairing_complete(true);
        }
        *self.sequencer.write() = Some(sequencer);

        self.start_request_driver(request_rx);
        self.start_notification_listener().await?;

        if let Some(sequencer) = self.sequencer.write().as_mut() {
            sequencer.handle_connected()?;
        }

        Ok(())
    }

    /// Disconnect from the meter.
    pub async fn disconnect(&self) -> Result<()> {
        info!("Disconnecting from meter {}", self.identifier);

        self.connection.disconnect().await?;

        // 0x16: connection terminated by local host.
        if let Some(sequencer) = self.sequencer.write().as_mut() {
            sequencer.handle_disconnected(0x16);
        }

        Ok(())
    }

    /// Whether a dropped link will be re-established.
    pub fn reconnects_on_drop(&self) -> bool {
        self.connection.reconnects_on_drop()
    }

    // === Record Data ===

    /// Subscribe to decoded glucose records.
    pub fn subscribe_records(&self) -> broadcast::Receiver<GlucoseRecord> {
        self.record_tx.subscribe()
    }

    /// Subscribe to transfer totals announcements.
    pub fn subscribe_totals(&self) -> broadcast::Receiver<TransferTotals> {
        self.totals_tx.subscribe()
    }

    /// Register a callback for decoded glucose records.
    pub fn on_record<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&GlucoseRecord) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.record_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(record) = rx.recv().await {
                callback(&record);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback for transfer totals announcements.
    pub fn on_totals<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&TransferTotals) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.totals_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(totals) = rx.recv().await {
                callback(&totals);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    // === Internal ===

    /// Drain sequencer requests and execute them against the platform
    /// GATT client.
    ///
    /// btleplug resolves attributes by UUID and hides raw handles, so
    /// discovery runs against the cached attribute table and reports
    /// back the handles the configured layout implies.
    fn start_request_driver(&self, mut request_rx: mpsc::UnboundedReceiver<TransportRequest>) {
        let peripheral = self.connection.peripheral().clone();
        let sequencer = self.sequencer.clone();
        let handles = self.handles;

        tokio::spawn(async move {
            debug!("GATT request driver started");

            while let Some(request) = request_rx.recv().await {
                match request {
                    TransportRequest::Discover(discovery) => {
                        let found = resolve_discovery(&peripheral, &discovery, &handles);
                        let mut guard = sequencer.write();
                        let Some(sequencer) = guard.as_mut() else {
                            continue;
                        };
                        let result = match found {
                            Some(handle) => sequencer.handle_attribute_found(handle),
                            None => sequencer.handle_discovery_complete(),
                        };
                        if let Err(e) = result {
                            warn!("Discovery result rejected: {}", e);
                        }
                    }
                    TransportRequest::Subscribe { value_handle, .. } => {
                        let Some(uuid) = handles.characteristic_for(value_handle) else {
                            warn!("Subscribe against unknown handle {}", value_handle);
                            continue;
                        };
                        match find_characteristic(&peripheral, uuid) {
                            Ok(characteristic) => {
                                if let Err(e) = peripheral.subscribe(&characteristic).await {
                                    warn!("Failed to enable notifications: {}", e);
                                }
                            }
                            Err(e) => warn!("{}", e),
                        }
                    }
                    TransportRequest::Write { handle, payload } => {
                        let Some(uuid) = handles.characteristic_for(handle) else {
                            warn!("Write against unknown handle {}", handle);
                            continue;
                        };
                        let characteristic = match find_characteristic(&peripheral, uuid) {
                            Ok(characteristic) => characteristic,
                            Err(e) => {
                                warn!("{}", e);
                                continue;
                            }
                        };

                        let outcome = peripheral
                            .write(&characteristic, &payload, WriteType::WithResponse)
                            .await;

                        let mut guard = sequencer.write();
                        let Some(sequencer) = guard.as_mut() else {
                            continue;
                        };
                        match outcome {
                            Ok(()) => {
                                sequencer.handle_write_complete(handle, payload.len(), None)
                            }
                            Err(e) => {
                                warn!("Write failed: {}", e);
                                sequencer.handle_write_complete(handle, payload.len(), Some(0x0E));
                            }
                        }
                    }
                }
            }

            debug!("GATT request driver stopped");
        });
    }

    /// Feed incoming notifications into the sequencer and fan decoded
    /// events out to subscribers.
    async fn start_notification_listener(&self) -> Result<()> {
        let mut stream = self
            .connection
            .peripheral()
            .notifications()
            .await
            .map_err(Error::Bluetooth)?;

        let sequencer = self.sequencer.clone();
        let connection = self.connection.clone();
        let record_tx = self.record_tx.clone();
        let totals_tx = self.totals_tx.clone();
        let notify_handle = self.handles.notify;

        tokio::spawn(async move {
            debug!("Notification listener started");

            while let Some(notification) = stream.next().await {
                if notification.uuid != NOTIFY_CHARACTERISTIC_UUID {
                    debug!("Ignoring notification from {}", notification.uuid);
                    continue;
                }

                let events = {
                    let mut guard = sequencer.write();
                    let Some(sequencer) = guard.as_mut() else {
                        continue;
                    };
                    match sequencer.handle_notification(notify_handle, Some(&notification.value)) {
                        Ok(events) => events,
                        Err(e) => {
                            debug!("Notification dropped: {}", e);
                            Vec::new()
                        }
                    }
                };

                for event in events {
                    match event {
                        RouterEvent::Record(record) => {
                            info!("{}", record);
                            let _ = record_tx.send(record);
                        }
                        RouterEvent::Totals(totals) => {
                            info!(
                                "Total records {} (max {}, last transfer {})",
                                totals.total_amount, totals.max_amount, totals.last_transfer
                            );
                            let _ = totals_tx.send(totals);
                        }
                    }
                }
            }

            // The stream ends when the link drops.
            debug!("Notification stream ended");
            if let Some(sequencer) = sequencer.write().as_mut() {
                // 0x08: connection supervision timeout.
                sequencer.handle_disconnected(0x08);
            }
            connection.handle_disconnection().await;
        });

        Ok(())
    }
}

/// Resolve a discovery request against the cached attribute table,
/// returning the handle to report for a match.
fn resolve_discovery(
    peripheral: &Peripheral,
    request: &DiscoveryRequest,
    handles: &MeterHandles,
) -> Option<u16> {
    match request.kind {
        DiscoveryKind::PrimaryService => peripheral
            .services()
            .iter()
            .any(|service| service.uuid == request.uuid)
            // Report the declaration two below the notify value so the
            // follow-up search starts inside the service.
            .then(|| handles.notify.saturating_sub(2)),
        DiscoveryKind::Characteristic => find_characteristic(peripheral, request.uuid)
            .ok()
            .map(|_| handles.notify_declaration()),
        DiscoveryKind::Descriptor => find_characteristic(peripheral, NOTIFY_CHARACTERISTIC_UUID)
            .ok()
            .filter(|characteristic| {
                characteristic
                    .descriptors
                    .iter()
                    .any(|descriptor| descriptor.uuid == request.uuid)
            })
            .map(|_| handles.notify_ccc()),
    }
}

/// Look up a characteristic by UUID in the cached attribute table.
fn find_characteristic(peripheral: &Peripheral, uuid: uuid::Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid == uuid)
        .ok_or_else(|| Error::CharacteristicNotFound {
            uuid: uuid.to_string(),
        })
}

impl std::fmt::Debug for Meter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Meter")
            .field("identifier", &self.identifier)
            .field("connection_state", &self.connection_state())
            .field("session_state", &self.session_state())
            .finish()
    }
}
