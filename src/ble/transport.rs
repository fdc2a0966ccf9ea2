//! Request submission channel between the sequencer and the GATT
//! driver task.
//!
//! The sequencer runs synchronously and only submits work; the async
//! driver drains the queue and executes each request against the
//! platform, feeding results back through the sequencer's handlers.

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::session::{DiscoveryRequest, GattRequests};

/// One request handed to the GATT driver task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRequest {
    /// Run an attribute discovery.
    Discover(DiscoveryRequest),
    /// Enable notifications on a characteristic.
    Subscribe {
        /// Handle of the CCC descriptor to write.
        ccc_handle: u16,
        /// Handle of the characteristic value notified on.
        value_handle: u16,
    },
    /// Write a payload to an attribute.
    Write {
        /// Target attribute handle.
        handle: u16,
        /// Bytes to write.
        payload: Vec<u8>,
    },
}

/// [`GattRequests`] implementation that queues requests for the
/// driver task. Submission succeeds as long as the driver is alive.
#[derive(Debug, Clone)]
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<TransportRequest>,
}

impl RequestQueue {
    /// Create a queue and the receiving end for the driver task.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn submit(&self, request: TransportRequest) -> Result<()> {
        self.tx
            .send(request)
            .map_err(|_| Error::TransportClosed)
    }
}

impl GattRequests for RequestQueue {
    fn discover(&mut self, request: DiscoveryRequest) -> Result<()> {
        self.submit(TransportRequest::Discover(request))
    }

    fn subscribe(&mut self, ccc_handle: u16, value_handle: u16) -> Result<()> {
        self.submit(TransportRequest::Subscribe {
            ccc_handle,
            value_handle,
        })
    }

    fn write(&mut self, handle: u16, payload: &[u8]) -> Result<()> {
        self.submit(TransportRequest::Write {
            handle,
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::DiscoveryKind;
    use uuid::Uuid;

    #[test]
    fn test_requests_arrive_in_submission_order() {
        let (mut queue, mut rx) = RequestQueue::new();

        let discovery = DiscoveryRequest {
            uuid: Uuid::from_u128(0x2902),
            start_handle: 49,
            end_handle: 0xFFFF,
            kind: DiscoveryKind::Descriptor,
        };
        queue.discover(discovery).unwrap();
        queue.subscribe(49, 48).unwrap();
        queue.write(52, &[0xB0, 0x61]).unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            TransportRequest::Discover(discovery)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportRequest::Subscribe {
                ccc_handle: 49,
                value_handle: 48,
            }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportRequest::Write {
                handle: 52,
                payload: vec![0xB0, 0x61],
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_driver_refuses_submission() {
        let (mut queue, rx) = RequestQueue::new();
        drop(rx);

        let err = queue.write(52, &[0x00]).unwrap_err();
        assert!(matches!(err, Error::TransportClosed));
    }
}
