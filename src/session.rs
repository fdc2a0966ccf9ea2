//! Session sequencing state machine.
//!
//! Drives the scripted lifecycle against a connected meter:
//! service discovery, characteristic discovery, descriptor discovery,
//! subscription, then the two-write readout exchange. Each transport
//! event re-enters the sequencer through exactly one handler; the
//! sequencer never blocks and issues at most one request per event.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::uuids::{
    BGM_SERVICE_UUID, CCC_DESCRIPTOR_UUID, MeterHandles, NOTIFY_CHARACTERISTIC_UUID,
};
use crate::error::{Error, Result};
use crate::protocol::{CommandCatalog, NotificationRouter, RouterEvent};

/// First attribute handle of a GATT table.
pub const FIRST_ATTRIBUTE_HANDLE: u16 = 0x0001;
/// Last attribute handle of a GATT table.
pub const LAST_ATTRIBUTE_HANDLE: u16 = 0xFFFF;

/// Lifecycle state of the single meter session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// No active session; entered on every disconnect.
    #[default]
    Idle,
    /// Looking for the meter's primary service.
    ServiceDiscovery,
    /// Looking for the notify characteristic inside the service.
    CharacteristicDiscovery,
    /// Looking for the CCC descriptor of the notify characteristic.
    DescriptorDiscovery,
    /// Notifications enabled; awaiting authorization to issue commands.
    Subscribed,
    /// The scripted readout writes have been submitted.
    CommandsIssued,
    /// At least one notification has been routed.
    Streaming,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::ServiceDiscovery => "ServiceDiscovery",
            Self::CharacteristicDiscovery => "CharacteristicDiscovery",
            Self::DescriptorDiscovery => "DescriptorDiscovery",
            Self::Subscribed => "Subscribed",
            Self::CommandsIssued => "CommandsIssued",
            Self::Streaming => "Streaming",
        };
        write!(f, "{}", name)
    }
}

/// What kind of attribute a discovery request is after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryKind {
    /// A primary service declaration.
    PrimaryService,
    /// A characteristic declaration.
    Characteristic,
    /// A characteristic descriptor.
    Descriptor,
}

/// One discovery submission against the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryRequest {
    /// UUID filter for the wanted attribute.
    pub uuid: Uuid,
    /// First handle of the search range.
    pub start_handle: u16,
    /// Last handle of the search range.
    pub end_handle: u16,
    /// Kind of attribute wanted.
    pub kind: DiscoveryKind,
}

impl DiscoveryRequest {
    /// Build a request covering `start_handle` through the end of the
    /// attribute table.
    pub fn from_handle(kind: DiscoveryKind, uuid: Uuid, start_handle: u16) -> Self {
        Self {
            uuid,
            start_handle,
            end_handle: LAST_ATTRIBUTE_HANDLE,
            kind,
        }
    }
}

/// Submission-only interface to the GATT client.
///
/// An `Ok` return means the request was accepted for execution, with
/// results delivered back through the sequencer's handlers; it is not
/// a completion. `subscribe` returning `Ok` covers both "subscribed"
/// and "was already subscribed".
#[cfg_attr(test, mockall::automock)]
pub trait GattRequests {
    /// Submit an attribute discovery; matches come back through
    /// `handle_attribute_found`, exhaustion through
    /// `handle_discovery_complete`.
    fn discover(&mut self, request: DiscoveryRequest) -> Result<()>;

    /// Enable notifications: write the CCC descriptor at `ccc_handle`
    /// with `value_handle` as the notification target.
    fn subscribe(&mut self, ccc_handle: u16, value_handle: u16) -> Result<()>;

    /// Submit a write of `payload` against `handle`; completion comes
    /// back through `handle_write_complete`.
    fn write(&mut self, handle: u16, payload: &[u8]) -> Result<()>;
}

/// The command/response sequencing state machine for one meter
/// session.
///
/// Exactly one sequencer exists per connection; it owns the session's
/// [`NotificationRouter`] (and through it the reassembly buffer), so
/// supporting several meters means one sequencer per peripheral with
/// nothing shared between them.
///
/// Submission failures are logged and leave the machine parked in its
/// current state; it only makes progress on the next external event.
/// There is no retry, backoff or timeout here.
pub struct SessionSequencer<T: GattRequests> {
    transport: T,
    state: SessionState,
    catalog: CommandCatalog,
    router: NotificationRouter,
    /// Value handle recorded during characteristic discovery, the
    /// notification target for the subscription.
    value_handle: Option<u16>,
    /// Set by pairing completion; consumed by the one-shot command
    /// exchange. Survives disconnects until consumed.
    authorized: bool,
}

impl<T: GattRequests> SessionSequencer<T> {
    /// Create a sequencer in `Idle` over the given transport.
    pub fn new(transport: T, handles: MeterHandles) -> Self {
        Self {
            transport,
            state: SessionState::Idle,
            catalog: CommandCatalog::new(handles),
            router: NotificationRouter::new(),
            value_handle: None,
            authorized: false,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the one-shot command exchange is still pending.
    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    /// The notify characteristic's value handle, once discovered.
    pub fn value_handle(&self) -> Option<u16> {
        self.value_handle
    }

    /// Connection established: optionally reopen passthrough mode for
    /// a previously bonded meter, then start service discovery.
    pub fn handle_connected(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::InvalidTransition {
                state: self.state,
                event: "connected",
            });
        }

        if self.authorized {
            let command = self.catalog.open_passthrough();
            if let Err(e) = self.transport.write(command.handle, command.payload) {
                warn!("Open passthrough write failed: {}", e);
            }
        }

        debug!("Initial discover params");
        let request = DiscoveryRequest::from_handle(
            DiscoveryKind::PrimaryService,
            BGM_SERVICE_UUID,
            FIRST_ATTRIBUTE_HANDLE,
        );
        match self.transport.discover(request) {
            Ok(()) => {
                self.state = SessionState::ServiceDiscovery;
                Ok(())
            }
            Err(e) => {
                warn!("Discover failed: {}", e);
                Ok(())
            }
        }
    }

    /// Link security level changed; informational only.
    pub fn handle_security_changed(&mut self, level: u8, error: Option<u8>) {
        match error {
            None => info!("Security changed: level {}", level),
            Some(err) => warn!("Security failed: level {} err {}", level, err),
        }
    }

    /// A discovery request matched an attribute at `handle`.
    ///
    /// An attribute at the very last handle leaves no room for the
    /// follow-up search that starts one past it; that case ends the
    /// sub-sequence the same way an exhausted range does.
    pub fn handle_attribute_found(&mut self, handle: u16) -> Result<()> {
        debug!("[ATTRIBUTE] handle {}", handle);

        match self.state {
            SessionState::ServiceDiscovery => {
                let Some(next_handle) = handle.checked_add(1) else {
                    info!("Attribute table exhausted at handle {}", handle);
                    return Ok(());
                };
                let request = DiscoveryRequest::from_handle(
                    DiscoveryKind::Characteristic,
                    NOTIFY_CHARACTERISTIC_UUID,
                    next_handle,
                );
                match self.transport.discover(request) {
                    Ok(()) => self.state = SessionState::CharacteristicDiscovery,
                    Err(e) => warn!("Discover failed: {}", e),
                }
                Ok(())
            }
            SessionState::CharacteristicDiscovery => {
                // The characteristic value sits one handle past the
                // declaration that discovery reported.
                let Some(value_handle) = handle.checked_add(1) else {
                    info!("Attribute table exhausted at handle {}", handle);
                    return Ok(());
                };
                self.value_handle = Some(value_handle);
                let request = DiscoveryRequest::from_handle(
                    DiscoveryKind::Descriptor,
                    CCC_DESCRIPTOR_UUID,
                    value_handle,
                );
                match self.transport.discover(request) {
                    Ok(()) => self.state = SessionState::DescriptorDiscovery,
                    Err(e) => warn!("Discover failed: {}", e),
                }
                Ok(())
            }
            SessionState::DescriptorDiscovery => {
                let value_handle = self.value_handle.ok_or_else(|| {
                    Error::Internal("descriptor found with no recorded value handle".into())
                })?;
                match self.transport.subscribe(handle, value_handle) {
                    Ok(()) => {
                        info!("[SUBSCRIBED]");
                        self.state = SessionState::Subscribed;
                        if self.authorized {
                            self.issue_readout_commands();
                        }
                    }
                    Err(e) => warn!("Subscribe failed: {}", e),
                }
                Ok(())
            }
            state => Err(Error::InvalidTransition {
                state,
                event: "attribute-found",
            }),
        }
    }

    /// A discovery request exhausted its handle range (the terminal
    /// null attribute). Ends that sub-sequence only; the session
    /// state is unchanged and only a disconnect returns it to `Idle`.
    pub fn handle_discovery_complete(&mut self) -> Result<()> {
        match self.state {
            SessionState::ServiceDiscovery
            | SessionState::CharacteristicDiscovery
            | SessionState::DescriptorDiscovery => {
                info!("Discover complete");
                Ok(())
            }
            state => Err(Error::InvalidTransition {
                state,
                event: "discovery-complete",
            }),
        }
    }

    /// A submitted write completed, possibly with an ATT error.
    pub fn handle_write_complete(&mut self, handle: u16, length: usize, error: Option<u8>) {
        match error {
            Some(err) => warn!("Write request completed with ATT error {:#04x}", err),
            None => info!("Write successful handle {} data length: {}", handle, length),
        }
    }

    /// A notification (or unsubscription, when `data` is `None`)
    /// arrived on `value_handle`.
    ///
    /// Returns the router's decoded events; the first data payload
    /// moves the session to `Streaming`.
    pub fn handle_notification(
        &mut self,
        value_handle: u16,
        data: Option<&[u8]>,
    ) -> Result<Vec<RouterEvent>> {
        let Some(payload) = data else {
            info!("[UNSUBSCRIBED]");
            self.value_handle = None;
            return Ok(Vec::new());
        };

        match self.state {
            SessionState::Subscribed | SessionState::CommandsIssued | SessionState::Streaming => {
                if self.value_handle != Some(value_handle) {
                    warn!(
                        "Notification on unexpected handle {} (subscribed: {:?})",
                        value_handle, self.value_handle
                    );
                    return Ok(Vec::new());
                }

                debug!(
                    "[NOTIFICATION] data length {} handle {}",
                    payload.len(),
                    value_handle
                );
                self.state = SessionState::Streaming;
                Ok(self.router.on_notification(payload))
            }
            state => Err(Error::InvalidTransition {
                state,
                event: "notification",
            }),
        }
    }

    /// Connection dropped: back to `Idle`, clearing all session-scoped
    /// state. The authorized flag is bonding-scoped, not
    /// connection-scoped, and survives until the command exchange
    /// consumes it.
    pub fn handle_disconnected(&mut self, reason: u8) {
        info!("Disconnected (reason {})", reason);
        self.state = SessionState::Idle;
        self.value_handle = None;
        self.router.reset();
    }

    /// Pairing finished; arms the one-shot command exchange.
    pub fn handle_pairing_complete(&mut self, bonded: bool) {
        info!("Pairing completed, bonded: {}", bonded);
        self.authorized = true;
    }

    /// Pairing failed; the exchange stays disarmed.
    pub fn handle_pairing_failed(&mut self, reason: u8) {
        warn!("Pairing failed, reason {}", reason);
    }

    /// Pairing cancelled by either side.
    pub fn handle_pairing_cancelled(&mut self) {
        info!("Pairing cancelled");
    }

    /// Submit the scripted readout: record count first, then the
    /// eight-record batch. The authorized flag is consumed by the
    /// attempt so the exchange runs once per bonding, not once per
    /// connection.
    fn issue_readout_commands(&mut self) {
        self.authorized = false;

        let count = self.catalog.request_count();
        if let Err(e) = self.transport.write(count.handle, count.payload) {
            warn!("Write request failed: {}", e);
            return;
        }

        let batch = self.catalog.request_batch();
        if let Err(e) = self.transport.write(batch.handle, batch.payload) {
            warn!("Write request failed: {}", e);
            return;
        }

        self.state = SessionState::CommandsIssued;
    }
}

impl<T: GattRequests> std::fmt::Debug for SessionSequencer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSequencer")
            .field("state", &self.state)
            .field("value_handle", &self.value_handle)
            .field("authorized", &self.authorized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands::{
        OPEN_PASSTHROUGH_PAYLOAD, REQUEST_BATCH_PAYLOAD, REQUEST_COUNT_PAYLOAD,
    };
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn accepting_transport() -> MockGattRequests {
        let mut mock = MockGattRequests::new();
        mock.expect_discover().returning(|_| Ok(()));
        mock.expect_subscribe().returning(|_, _| Ok(()));
        mock.expect_write().returning(|_, _| Ok(()));
        mock
    }

    /// Walk an accepting sequencer to the subscribed/commands-issued
    /// point using the reference handle layout.
    fn advance_to_subscribed(sequencer: &mut SessionSequencer<MockGattRequests>) {
        sequencer.handle_connected().unwrap();
        sequencer.handle_attribute_found(44).unwrap();
        sequencer.handle_attribute_found(47).unwrap();
        sequencer.handle_attribute_found(49).unwrap();
    }

    #[test]
    fn test_authorized_happy_path() {
        let mut transport = MockGattRequests::new();
        let mut order = Sequence::new();

        transport
            .expect_write()
            .withf(|handle, payload| *handle == 45 && payload == OPEN_PASSTHROUGH_PAYLOAD)
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _| Ok(()));
        transport
            .expect_discover()
            .withf(|req| {
                req.kind == DiscoveryKind::PrimaryService
                    && req.uuid == BGM_SERVICE_UUID
                    && req.start_handle == FIRST_ATTRIBUTE_HANDLE
                    && req.end_handle == LAST_ATTRIBUTE_HANDLE
            })
            .times(1)
            .in_sequence(&mut order)
            .returning(|_| Ok(()));
        transport
            .expect_discover()
            .withf(|req| {
                req.kind == DiscoveryKind::Characteristic
                    && req.uuid == NOTIFY_CHARACTERISTIC_UUID
                    && req.start_handle == 45
            })
            .times(1)
            .in_sequence(&mut order)
            .returning(|_| Ok(()));
        transport
            .expect_discover()
            .withf(|req| {
                req.kind == DiscoveryKind::Descriptor
                    && req.uuid == CCC_DESCRIPTOR_UUID
                    && req.start_handle == 48
            })
            .times(1)
            .in_sequence(&mut order)
            .returning(|_| Ok(()));
        transport
            .expect_subscribe()
            .with(eq(49u16), eq(48u16))
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _| Ok(()));
        transport
            .expect_write()
            .withf(|handle, payload| *handle == 52 && payload == REQUEST_COUNT_PAYLOAD)
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _| Ok(()));
        transport
            .expect_write()
            .withf(|handle, payload| *handle == 52 && payload == REQUEST_BATCH_PAYLOAD)
            .times(1)
            .in_sequence(&mut order)
            .returning(|_, _| Ok(()));

        let mut sequencer = SessionSequencer::new(transport, MeterHandles::default());
        sequencer.handle_pairing_complete(true);
        assert!(sequencer.is_authorized());

        sequencer.handle_connected().unwrap();
        assert_eq!(sequencer.state(), SessionState::ServiceDiscovery);

        sequencer.handle_attribute_found(44).unwrap();
        assert_eq!(sequencer.state(), SessionState::CharacteristicDiscovery);

        sequencer.handle_attribute_found(47).unwrap();
        assert_eq!(sequencer.state(), SessionState::DescriptorDiscovery);
        assert_eq!(sequencer.value_handle(), Some(48));

        sequencer.handle_attribute_found(49).unwrap();
        assert_eq!(sequencer.state(), SessionState::CommandsIssued);
        // One-shot: consumed by the exchange.
        assert!(!sequencer.is_authorized());

        let events = sequencer
            .handle_notification(48, Some(b"\x01v1.0"))
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(sequencer.state(), SessionState::Streaming);

        sequencer.handle_disconnected(0x13);
        assert_eq!(sequencer.state(), SessionState::Idle);
        assert_eq!(sequencer.value_handle(), None);
    }

    #[test]
    fn test_unauthorized_session_stops_at_subscribed() {
        let mut transport = MockGattRequests::new();
        transport.expect_discover().times(3).returning(|_| Ok(()));
        transport
            .expect_subscribe()
            .times(1)
            .returning(|_, _| Ok(()));
        // No writes at all without authorization.
        transport.expect_write().never();

        let mut sequencer = SessionSequencer::new(transport, MeterHandles::default());
        advance_to_subscribed(&mut sequencer);
        assert_eq!(sequencer.state(), SessionState::Subscribed);
    }

    #[test]
    fn test_discover_submission_failure_parks_state() {
        let mut transport = MockGattRequests::new();
        transport
            .expect_discover()
            .times(1)
            .returning(|_| Err(Error::NotConnected));

        let mut sequencer = SessionSequencer::new(transport, MeterHandles::default());
        sequencer.handle_connected().unwrap();
        assert_eq!(sequencer.state(), SessionState::Idle);
    }

    #[test]
    fn test_subscribe_submission_failure_parks_state() {
        let mut transport = MockGattRequests::new();
        transport.expect_discover().times(3).returning(|_| Ok(()));
        transport
            .expect_subscribe()
            .times(1)
            .returning(|_, _| Err(Error::NotConnected));

        let mut sequencer = SessionSequencer::new(transport, MeterHandles::default());
        advance_to_subscribed(&mut sequencer);
        assert_eq!(sequencer.state(), SessionState::DescriptorDiscovery);
    }

    #[test]
    fn test_write_failure_leaves_subscribed_but_consumes_flag() {
        let mut transport = MockGattRequests::new();
        transport.expect_discover().times(3).returning(|_| Ok(()));
        transport
            .expect_subscribe()
            .times(1)
            .returning(|_, _| Ok(()));
        // Passthrough write succeeds, first readout write is refused.
        transport
            .expect_write()
            .withf(|handle, payload| *handle == 45 && payload == OPEN_PASSTHROUGH_PAYLOAD)
            .times(1)
            .returning(|_, _| Ok(()));
        transport
            .expect_write()
            .withf(|handle, payload| *handle == 52 && payload == REQUEST_COUNT_PAYLOAD)
            .times(1)
            .returning(|_, _| Err(Error::NotConnected));

        let mut sequencer = SessionSequencer::new(transport, MeterHandles::default());
        sequencer.handle_pairing_complete(true);
        advance_to_subscribed(&mut sequencer);

        assert_eq!(sequencer.state(), SessionState::Subscribed);
        assert!(!sequencer.is_authorized());
    }

    #[test]
    fn test_illegal_transitions_are_errors() {
        let mut sequencer =
            SessionSequencer::new(MockGattRequests::new(), MeterHandles::default());

        let err = sequencer.handle_attribute_found(44).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                state: SessionState::Idle,
                event: "attribute-found",
            }
        ));
        assert_eq!(sequencer.state(), SessionState::Idle);

        assert!(sequencer
            .handle_notification(48, Some(&[0x02]))
            .is_err());
        assert!(sequencer.handle_discovery_complete().is_err());
    }

    #[test]
    fn test_double_connected_is_an_error() {
        let mut sequencer =
            SessionSequencer::new(accepting_transport(), MeterHandles::default());
        sequencer.handle_connected().unwrap();
        assert!(sequencer.handle_connected().is_err());
    }

    #[test]
    fn test_attribute_at_last_handle_ends_discovery() {
        let mut transport = MockGattRequests::new();
        // Only the initial service discover and the one that follows
        // the in-range attribute; nothing starts past the table end.
        transport.expect_discover().times(2).returning(|_| Ok(()));

        let mut sequencer = SessionSequencer::new(transport, MeterHandles::default());
        sequencer.handle_connected().unwrap();

        sequencer.handle_attribute_found(u16::MAX).unwrap();
        assert_eq!(sequencer.state(), SessionState::ServiceDiscovery);

        sequencer.handle_attribute_found(44).unwrap();
        assert_eq!(sequencer.state(), SessionState::CharacteristicDiscovery);

        sequencer.handle_attribute_found(u16::MAX).unwrap();
        assert_eq!(sequencer.state(), SessionState::CharacteristicDiscovery);
        assert_eq!(sequencer.value_handle(), None);
    }

    #[test]
    fn test_discovery_complete_is_not_a_reset() {
        let mut sequencer =
            SessionSequencer::new(accepting_transport(), MeterHandles::default());
        sequencer.handle_connected().unwrap();
        sequencer.handle_discovery_complete().unwrap();
        assert_eq!(sequencer.state(), SessionState::ServiceDiscovery);
    }

    #[test]
    fn test_disconnect_resets_from_any_state() {
        let mut sequencer =
            SessionSequencer::new(accepting_transport(), MeterHandles::default());
        advance_to_subscribed(&mut sequencer);
        sequencer.handle_notification(48, Some(&[0x01])).unwrap();
        assert_eq!(sequencer.state(), SessionState::Streaming);

        sequencer.handle_disconnected(0x08);
        assert_eq!(sequencer.state(), SessionState::Idle);
    }

    #[test]
    fn test_authorized_flag_survives_disconnect_until_consumed() {
        let mut transport = MockGattRequests::new();
        transport.expect_discover().returning(|_| Ok(()));
        transport.expect_write().returning(|_, _| Ok(()));

        let mut sequencer = SessionSequencer::new(transport, MeterHandles::default());
        sequencer.handle_pairing_complete(true);
        sequencer.handle_connected().unwrap();
        sequencer.handle_disconnected(0x08);

        // Bonding-scoped, not connection-scoped.
        assert!(sequencer.is_authorized());
    }

    #[test]
    fn test_notification_on_wrong_handle_is_dropped() {
        let mut sequencer =
            SessionSequencer::new(accepting_transport(), MeterHandles::default());
        advance_to_subscribed(&mut sequencer);

        let events = sequencer.handle_notification(99, Some(&[0x02])).unwrap();
        assert!(events.is_empty());
        assert_eq!(sequencer.state(), SessionState::Subscribed);
    }

    #[test]
    fn test_unsubscription_clears_value_handle() {
        let mut sequencer =
            SessionSequencer::new(accepting_transport(), MeterHandles::default());
        advance_to_subscribed(&mut sequencer);
        assert_eq!(sequencer.value_handle(), Some(48));

        let events = sequencer.handle_notification(48, None).unwrap();
        assert!(events.is_empty());
        assert_eq!(sequencer.value_handle(), None);
    }
}
