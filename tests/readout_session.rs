//! End-to-end session test: a scripted transport walks the sequencer
//! through discovery and subscription, then a synthetic notification
//! stream delivers a full eight-record batch.

use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use bgm_rust_ble::protocol::{GlucoseRecord, MealMarker, RouterEvent};
use bgm_rust_ble::session::{
    DiscoveryKind, DiscoveryRequest, GattRequests, SessionSequencer, SessionState,
};
use bgm_rust_ble::{MeterHandles, Result};

/// What the sequencer asked the transport to do.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Submitted {
    Discover(DiscoveryKind, u16),
    Subscribe { ccc_handle: u16, value_handle: u16 },
    Write { handle: u16, payload: Vec<u8> },
}

/// Transport that accepts every submission and logs it.
struct ScriptedTransport {
    log: Arc<Mutex<Vec<Submitted>>>,
}

impl GattRequests for ScriptedTransport {
    fn discover(&mut self, request: DiscoveryRequest) -> Result<()> {
        self.log
            .lock()
            .push(Submitted::Discover(request.kind, request.start_handle));
        Ok(())
    }

    fn subscribe(&mut self, ccc_handle: u16, value_handle: u16) -> Result<()> {
        self.log.lock().push(Submitted::Subscribe {
            ccc_handle,
            value_handle,
        });
        Ok(())
    }

    fn write(&mut self, handle: u16, payload: &[u8]) -> Result<()> {
        self.log.lock().push(Submitted::Write {
            handle,
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

/// A record block for 2021-03-15 09:30, 123 mg/dL, after a meal,
/// GMT +0 (offset code 12).
fn sample_record_block() -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0] = 0x8E; // day 15, month low bits
    block[1] = 0x09; // hour 9
    block[2] = 0x9E; // minute 30, offset middle bits
    block[3] = 0x15; // year 2021
    block[4] = 0x48; // offset high bits, after-meal marker
    block[5] = 0x7B; // glucose 123
    block
}

/// Chunk eight concatenated record blocks into the meter's batch
/// packet framing: 20-byte notifications, a 6-byte response header on
/// the first packet and a 2-byte prefix on the rest.
fn batch_packets() -> Vec<Vec<u8>> {
    let mut stream = Vec::with_capacity(128);
    for _ in 0..8 {
        stream.extend_from_slice(&sample_record_block());
    }

    let mut packets = Vec::new();

    let mut first = vec![0x08, 0x01, 0x00, 0x00, 0x08, 0x00];
    first.extend_from_slice(&stream[..14]);
    packets.push(first);

    let mut offset = 14;
    for sequence in 2..=7u8 {
        let mut packet = vec![0x08, sequence];
        packet.extend_from_slice(&stream[offset..offset + 18]);
        packets.push(packet);
        offset += 18;
    }

    packets
}

#[test]
fn test_full_readout_session_decodes_eight_records() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport { log: log.clone() };
    let handles = MeterHandles::default();

    let mut sequencer = SessionSequencer::new(transport, handles);
    sequencer.handle_pairing_complete(true);

    // Discovery script: service, characteristic, descriptor, then
    // subscribe and the two readout writes.
    sequencer.handle_connected().unwrap();
    sequencer.handle_attribute_found(44).unwrap();
    sequencer.handle_attribute_found(handles.notify_declaration()).unwrap();
    sequencer.handle_attribute_found(handles.notify_ccc()).unwrap();
    assert_eq!(sequencer.state(), SessionState::CommandsIssued);

    {
        let submitted = log.lock();
        assert_eq!(
            *submitted,
            vec![
                Submitted::Write {
                    handle: 45,
                    payload: vec![0x00],
                },
                Submitted::Discover(DiscoveryKind::PrimaryService, 1),
                Submitted::Discover(DiscoveryKind::Characteristic, 45),
                Submitted::Discover(DiscoveryKind::Descriptor, 48),
                Submitted::Subscribe {
                    ccc_handle: 49,
                    value_handle: 48,
                },
                Submitted::Write {
                    handle: 52,
                    payload: vec![0xB0, 0x61, 0x00, 0x00, 0x11],
                },
                Submitted::Write {
                    handle: 52,
                    payload: vec![0xB0, 0x62, 0x08, 0x00, 0x1A],
                },
            ]
        );
    }

    // Totals announcement arrives first.
    let totals_payload = [
        0x02, 0x01, 0x0C, 0x00, 0x00, 0x00, 0x20, 0x00, 0xFF, 0x03, 0x08, 0x00,
    ];
    let events = sequencer
        .handle_notification(48, Some(&totals_payload))
        .unwrap();
    assert_eq!(events.len(), 1);
    let RouterEvent::Totals(totals) = &events[0] else {
        panic!("expected totals, got {:?}", events[0]);
    };
    assert_eq!(totals.total_amount, 0x20);
    assert_eq!(totals.max_amount, 0x03FF);
    assert_eq!(totals.last_transfer, 0x08);
    assert_eq!(sequencer.state(), SessionState::Streaming);

    // Then the eight-record batch, chunked across seven packets.
    let packets = batch_packets();
    let mut records: Vec<GlucoseRecord> = Vec::new();
    for packet in &packets {
        let events = sequencer.handle_notification(48, Some(packet)).unwrap();
        for event in events {
            match event {
                RouterEvent::Record(record) => records.push(record),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    assert_eq!(records.len(), 8);
    for record in &records {
        assert_eq!(record.year, 2021);
        assert_eq!(record.month, 3);
        assert_eq!(record.day, 15);
        assert_eq!(record.hour, 9);
        assert_eq!(record.minute, 30);
        assert_eq!(record.glucose_value, 123);
        assert_eq!(record.meal_marker, MealMarker::AfterMeal);
        assert_eq!(record.timezone.hours(), 0);
    }

    // Disconnect ends the session; nothing of the batch survives it.
    sequencer.handle_disconnected(0x13);
    assert_eq!(sequencer.state(), SessionState::Idle);
    assert!(!sequencer.is_authorized());
}

#[test]
fn test_second_connection_skips_the_one_shot_exchange() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let transport = ScriptedTransport { log: log.clone() };
    let handles = MeterHandles::default();

    let mut sequencer = SessionSequencer::new(transport, handles);
    sequencer.handle_pairing_complete(true);

    sequencer.handle_connected().unwrap();
    sequencer.handle_attribute_found(44).unwrap();
    sequencer.handle_attribute_found(handles.notify_declaration()).unwrap();
    sequencer.handle_attribute_found(handles.notify_ccc()).unwrap();
    sequencer.handle_disconnected(0x08);

    log.lock().clear();

    // Reconnect with the flag already consumed.
    sequencer.handle_connected().unwrap();
    sequencer.handle_attribute_found(44).unwrap();
    sequencer.handle_attribute_found(handles.notify_declaration()).unwrap();
    sequencer.handle_attribute_found(handles.notify_ccc()).unwrap();
    assert_eq!(sequencer.state(), SessionState::Subscribed);

    let writes: Vec<_> = log
        .lock()
        .iter()
        .filter(|s| matches!(s, Submitted::Write { .. }))
        .cloned()
        .collect();
    assert!(writes.is_empty(), "unexpected writes: {:?}", writes);
}
