use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::config::DeliveryConfig;
use crate::sequence_number::SequenceNumber;

/// The inbound sequencer keeps track of the highest contiguous sequence number received from
///  the peer, and it decides for every incoming message whether to deliver it, ignore it as a
///  duplicate or drop it.
///
/// Delivered messages are kept in a queue until the application picks them up.
pub struct InboundSequencer {
    max_delayed_acks: u32,

    received: Option<SequenceNumber>,
    num_unacknowledged: u32,
    delivered: VecDeque<Bytes>,
}

impl InboundSequencer {
    pub fn new(config: &DeliveryConfig) -> InboundSequencer {
        InboundSequencer {
            max_delayed_acks: config.max_delayed_acks,
            received: None,
            num_unacknowledged: 0,
            delivered: VecDeque::new(),
        }
    }

    /// Handles a received message, returning the sequence number to acknowledge right away if any.
    ///
    /// Messages are delivered exactly once and in order: A message with the next expected sequence
    ///  number is delivered, a message with a lower number was delivered before and is ignored
    ///  (but acknowledged, since the peer evidently missed our ack), and a message with a higher
    ///  number means the peer violated ordering, so it is dropped.
    pub fn on_data(&mut self, sequence: SequenceNumber, payload: Bytes) -> Option<SequenceNumber> {
        if let Some(received) = self.received {
            if sequence <= received {
                debug!("received message #{} which was delivered before - ignoring", sequence);
                self.num_unacknowledged = 0;
                return self.received;
            }
        }

        if SequenceNumber::after(self.received) != Some(sequence) {
            warn!("received message #{} which does not follow the receive watermark {:?} - dropping", sequence, self.received);
            return None;
        }

        trace!("delivering message #{}", sequence);
        self.received = Some(sequence);
        self.delivered.push_back(payload);

        self.num_unacknowledged += 1;
        if self.num_unacknowledged >= self.max_delayed_acks {
            self.num_unacknowledged = 0;
            Some(sequence)
        }
        else {
            None
        }
    }

    /// The receive watermark to report in a handshake
    pub fn on_handshake(&self) -> Option<SequenceNumber> {
        self.received
    }

    /// Returns the receive watermark if there are delivered messages that were not acknowledged yet
    pub fn take_pending_ack(&mut self) -> Option<SequenceNumber> {
        if self.num_unacknowledged == 0 {
            return None;
        }
        self.num_unacknowledged = 0;
        self.received
    }

    pub fn next_delivered(&mut self) -> Option<Bytes> {
        self.delivered.pop_front()
    }

    pub fn received(&self) -> Option<SequenceNumber> {
        self.received
    }

    /// all delivered messages were picked up by the application
    pub fn is_clean(&self) -> bool {
        self.delivered.is_empty()
    }

    pub fn reset(&mut self) {
        if !self.delivered.is_empty() {
            debug!("resetting inbound state - discarding {} messages that were not picked up", self.delivered.len());
        }
        self.received = None;
        self.num_unacknowledged = 0;
        self.delivered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn seq(n: u32) -> SequenceNumber {
        SequenceNumber::from_raw(n)
    }

    fn sequencer(max_delayed_acks: u32) -> InboundSequencer {
        InboundSequencer::new(&DeliveryConfig {
            max_delayed_acks,
            ..Default::default()
        })
    }

    fn drain(sequencer: &mut InboundSequencer) -> Vec<Bytes> {
        let mut result = Vec::new();
        while let Some(msg) = sequencer.next_delivered() {
            result.push(msg);
        }
        result
    }

    #[test]
    fn test_in_order_delivery() {
        let mut sequencer = sequencer(1);
        assert_eq!(sequencer.on_handshake(), None);

        assert_eq!(sequencer.on_data(seq(0), Bytes::from_static(b"a")), Some(seq(0)));
        assert_eq!(sequencer.on_data(seq(1), Bytes::from_static(b"b")), Some(seq(1)));

        assert!(!sequencer.is_clean());
        assert_eq!(drain(&mut sequencer), vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert!(sequencer.is_clean());
        assert_eq!(sequencer.received(), Some(seq(1)));
        assert_eq!(sequencer.on_handshake(), Some(seq(1)));
    }

    #[test]
    fn test_duplicate_is_acknowledged_but_not_delivered() {
        let mut sequencer = sequencer(1);
        for n in 0..3 {
            sequencer.on_data(seq(n), Bytes::from_static(b"x"));
        }
        drain(&mut sequencer);

        assert_eq!(sequencer.on_data(seq(1), Bytes::from_static(b"x")), Some(seq(2)));
        assert_eq!(sequencer.on_data(seq(2), Bytes::from_static(b"x")), Some(seq(2)));
        assert!(sequencer.is_clean());
        assert_eq!(sequencer.received(), Some(seq(2)));
    }

    #[rstest]
    #[case::first_message(vec![], 1)]
    #[case::skipping_one(vec![0, 1], 3)]
    #[case::far_ahead(vec![0], 1000)]
    fn test_gap_is_dropped(#[case] before: Vec<u32>, #[case] gap: u32) {
        let mut sequencer = sequencer(1);
        for n in &before {
            sequencer.on_data(seq(*n), Bytes::from_static(b"x"));
        }
        drain(&mut sequencer);
        let received_before = sequencer.received();

        assert_eq!(sequencer.on_data(seq(gap), Bytes::from_static(b"y")), None);
        assert!(sequencer.is_clean());
        assert_eq!(sequencer.received(), received_before);
    }

    #[test]
    fn test_delayed_acks() {
        let mut sequencer = sequencer(3);
        assert_eq!(sequencer.on_data(seq(0), Bytes::new()), None);
        assert_eq!(sequencer.on_data(seq(1), Bytes::new()), None);
        assert_eq!(sequencer.on_data(seq(2), Bytes::new()), Some(seq(2)));
        assert_eq!(sequencer.take_pending_ack(), None);

        assert_eq!(sequencer.on_data(seq(3), Bytes::new()), None);
        assert_eq!(sequencer.take_pending_ack(), Some(seq(3)));
        assert_eq!(sequencer.take_pending_ack(), None);

        // a duplicate is acknowledged right away, covering anything pending
        assert_eq!(sequencer.on_data(seq(4), Bytes::new()), None);
        assert_eq!(sequencer.on_data(seq(4), Bytes::new()), Some(seq(4)));
        assert_eq!(sequencer.take_pending_ack(), None);

        assert_eq!(drain(&mut sequencer).len(), 5);
    }

    #[test]
    fn test_reset() {
        let mut sequencer = sequencer(2);
        sequencer.on_data(seq(0), Bytes::from_static(b"a"));

        sequencer.reset();
        assert!(sequencer.is_clean());
        assert_eq!(sequencer.received(), None);
        assert_eq!(sequencer.take_pending_ack(), None);

        assert_eq!(sequencer.on_data(seq(0), Bytes::from_static(b"b")), None);
        assert_eq!(drain(&mut sequencer), vec![Bytes::from_static(b"b")]);

        sequencer.reset();
        sequencer.reset();
        assert_eq!(sequencer.on_handshake(), None);
    }
}
