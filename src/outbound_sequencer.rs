use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::config::DeliveryConfig;
use crate::sequence_number::SequenceNumber;

struct OutboundEntry {
    sequence: SequenceNumber,
    payload: Bytes,
    /// transmitted in the current session
    transmitted: bool,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EnqueueOutcome {
    Accepted(SequenceNumber),
    /// The payload is the very same buffer as a message that is still queued, so it was
    ///  collapsed into that message. This is the queued message's sequence number.
    Collapsed(SequenceNumber),
    /// The send queue is at capacity, the payload is handed back to the caller
    QueueFull(Bytes),
    /// The payload can not be sent at all, e.g. because the session was closed
    Rejected(Bytes),
}

/// The outbound sequencer holds all messages that were accepted for sending but not yet
///  acknowledged by the peer, in sequence number order. It decides which message to transmit
///  next, but it does no I/O itself.
///
/// Transmitted entries always form a prefix of the queue since transmission is in sequence
///  order and acks remove entries from the front.
pub struct OutboundSequencer {
    queue_capacity: usize,
    send_window: usize,

    queue: VecDeque<OutboundEntry>,
    next_sequence: SequenceNumber,
    /// highest sequence number acknowledged by the peer
    ack_watermark: Option<SequenceNumber>,
    num_in_flight: usize,
    is_paused: bool,
}

impl OutboundSequencer {
    /// A new sequencer starts out paused: nothing is transmitted before a session is established
    pub fn new(config: &DeliveryConfig) -> OutboundSequencer {
        OutboundSequencer {
            queue_capacity: config.effective_send_queue_capacity(),
            send_window: config.send_window,
            queue: VecDeque::new(),
            next_sequence: SequenceNumber::ZERO,
            ack_watermark: None,
            num_in_flight: 0,
            is_paused: true,
        }
    }

    pub fn enqueue(&mut self, payload: Bytes) -> EnqueueOutcome {
        if let Some(sequence) = self.find_identical(&payload) {
            debug!("payload is identical to queued message #{} - collapsing", sequence);
            return EnqueueOutcome::Collapsed(sequence);
        }

        if !self.has_capacity() {
            trace!("send queue is full with {} messages", self.queue.len());
            return EnqueueOutcome::QueueFull(payload);
        }

        let sequence = self.next_sequence;
        let Some(next_sequence) = sequence.next() else {
            warn!("sequence number space is exhausted - rejecting message");
            return EnqueueOutcome::Rejected(payload);
        };
        self.next_sequence = next_sequence;
        trace!("enqueueing message #{}", sequence);

        self.queue.push_back(OutboundEntry {
            sequence,
            payload,
            transmitted: false,
        });
        EnqueueOutcome::Accepted(sequence)
    }

    /// Identity is buffer identity: the same region of memory, not equal content. Equal content
    ///  is a regular use case, e.g. for heartbeats, and is sent every time.
    fn find_identical(&self, payload: &Bytes) -> Option<SequenceNumber> {
        if payload.is_empty() {
            return None;
        }
        self.queue.iter()
            .find(|e| e.payload.as_ptr() == payload.as_ptr() && e.payload.len() == payload.len())
            .map(|e| e.sequence)
    }

    pub fn has_capacity(&self) -> bool {
        self.queue.len() < self.queue_capacity
    }

    /// Returns the next message to transmit and marks it as transmitted, or `None` if nothing
    ///  should be transmitted right now - because the sequencer is paused, the send window is
    ///  full or all queued messages were transmitted already
    pub fn next_transmission(&mut self) -> Option<(SequenceNumber, Bytes)> {
        if self.is_paused {
            return None;
        }
        if self.num_in_flight >= self.send_window {
            trace!("send window is full with {} messages in flight", self.num_in_flight);
            return None;
        }

        let entry = self.queue.iter_mut()
            .find(|e| !e.transmitted)?;
        entry.transmitted = true;
        self.num_in_flight += 1;
        Some((entry.sequence, entry.payload.clone()))
    }

    /// The transport did not accept a message returned by `next_transmission`, so it is due
    ///  for transmission again
    pub fn transmission_failed(&mut self, sequence: SequenceNumber) {
        if let Some(entry) = self.queue.iter_mut().find(|e| e.sequence == sequence) {
            if entry.transmitted {
                entry.transmitted = false;
                self.num_in_flight -= 1;
            }
        }
    }

    /// Handles a cumulative ack, returning the number of messages it confirmed
    pub fn on_ack(&mut self, sequence: SequenceNumber) -> usize {
        if let Some(watermark) = self.ack_watermark {
            if sequence <= watermark {
                debug!("received ack #{} which is at or below the ack watermark #{} - ignoring", sequence, watermark);
                return 0;
            }
        }
        if sequence >= self.next_sequence {
            warn!("received ack #{} for a message that was never sent (next is #{}) - ignoring", sequence, self.next_sequence);
            return 0;
        }

        self.ack_watermark = Some(sequence);
        let num_confirmed = self.remove_up_to(sequence);
        trace!("ack #{} confirmed {} messages", sequence, num_confirmed);
        num_confirmed
    }

    fn remove_up_to(&mut self, sequence: SequenceNumber) -> usize {
        let mut num_removed = 0;
        while let Some(entry) = self.queue.front() {
            if entry.sequence > sequence {
                break;
            }
            if entry.transmitted {
                self.num_in_flight -= 1;
            }
            self.queue.pop_front();
            num_removed += 1;
        }
        num_removed
    }

    /// Resynchronizes with the peer's receive watermark after a handshake. Everything the peer
    ///  reports as received is discarded, and all remaining messages are transmitted again.
    pub fn on_new_session(&mut self, peer_last_received: Option<SequenceNumber>) {
        match peer_last_received {
            Some(last_received) => {
                if let Some(watermark) = self.ack_watermark {
                    if last_received < watermark {
                        warn!("peer reports #{} as received which is below the ack watermark #{}", last_received, watermark);
                    }
                }

                let num_confirmed = self.remove_up_to(last_received);
                debug!("new session: peer received up to #{}, {} queued messages confirmed", last_received, num_confirmed);

                self.ack_watermark = self.ack_watermark.max(Some(last_received));
                if last_received >= self.next_sequence {
                    info!("peer received up to #{} which is beyond the next sequence number #{} - continuing numbering after the peer's watermark", last_received, self.next_sequence);
                    match last_received.next() {
                        Some(next_sequence) => self.next_sequence = next_sequence,
                        None => warn!("peer watermark #{} leaves no sequence number space", last_received),
                    }
                }
            }
            None => {
                if self.ack_watermark.is_some() {
                    info!("peer has fresh protocol state - renumbering {} queued messages from #0", self.queue.len());
                    for (i, entry) in self.queue.iter_mut().enumerate() {
                        entry.sequence = SequenceNumber::from_raw(i as u32);
                    }
                    self.next_sequence = SequenceNumber::from_raw(self.queue.len() as u32);
                    self.ack_watermark = None;
                }
            }
        }

        for entry in self.queue.iter_mut() {
            entry.transmitted = false;
        }
        self.num_in_flight = 0;
    }

    pub fn pause(&mut self) {
        self.is_paused = true;
    }

    pub fn resume(&mut self) {
        self.is_paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused
    }

    /// no message is waiting for acknowledgement
    pub fn is_clean(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn num_in_flight(&self) -> usize {
        self.num_in_flight
    }

    pub fn next_sequence(&self) -> SequenceNumber {
        self.next_sequence
    }

    pub fn ack_watermark(&self) -> Option<SequenceNumber> {
        self.ack_watermark
    }

    /// Discards all queued messages and returns to fresh state. The sequencer is paused
    ///  afterwards.
    pub fn reset(&mut self) {
        if !self.queue.is_empty() {
            info!("resetting outbound state - discarding {} unacknowledged messages", self.queue.len());
        }
        self.queue.clear();
        self.next_sequence = SequenceNumber::ZERO;
        self.ack_watermark = None;
        self.num_in_flight = 0;
        self.is_paused = true;
    }
}
