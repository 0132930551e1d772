use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::envelope::Envelope;

/// This is an abstraction for handing a serialized frame to the underlying transport, introduced
///  to decouple the protocol from the actual I/O and to facilitate mocking it away for testing.
///
/// The transport is expected to deliver frames unaltered (or not at all) - it may drop, duplicate
///  or reorder frames across reconnects. An `Err` means that the frame was not handed off.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FrameTransport: Send + Sync + 'static {
    async fn send_frame(&self, frame: Bytes) -> anyhow::Result<()>;
}

/// In-process transport, e.g. for connecting two peers in the same process
#[async_trait]
impl FrameTransport for mpsc::Sender<Bytes> {
    async fn send_frame(&self, frame: Bytes) -> anyhow::Result<()> {
        trace!("channel transport: sending frame of {} bytes", frame.len());
        self.send(frame).await
            .map_err(|_| anyhow!("channel transport is closed"))
    }
}

/// The adapter converts between envelopes and frames
#[derive(Clone)]
pub struct TransportAdapter {
    transport: Arc<dyn FrameTransport>,
    max_payload_size: usize,
}

impl TransportAdapter {
    pub fn new(transport: Arc<dyn FrameTransport>, max_payload_size: usize) -> TransportAdapter {
        TransportAdapter {
            transport,
            max_payload_size,
        }
    }

    pub async fn transmit(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let mut buf = BytesMut::with_capacity(envelope.max_serialized_len());
        envelope.ser(&mut buf);

        trace!("transmitting {:?}", envelope);
        self.transport.send_frame(buf.freeze()).await
    }

    /// Parses a received frame. Frames that can not be parsed are logged and dropped, and
    ///  `None` is returned for them.
    pub fn on_frame_received(&self, frame: &[u8]) -> Option<Envelope> {
        match Envelope::deser(frame, self.max_payload_size) {
            Ok(envelope) => {
                trace!("received {:?}", envelope);
                Some(envelope)
            }
            Err(e) => {
                warn!("received frame of {} bytes that can not be parsed - dropping: {}", frame.len(), e);
                None
            }
        }
    }
}
