//! This protocol provides guaranteed, in-order, exactly-once delivery of application messages
//!  between two peers on top of a connection-oriented transport that may break and be
//!  re-established at any time.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages*, i.e. opaque byte payloads
//! * Every message that is accepted for sending is delivered to the peer's application exactly
//!   once and in the order it was sent - across any number of reconnects
//!   * messages have sequence numbers and are acknowledged cumulatively
//!   * the sender keeps messages until they are acknowledged, and resends the unacknowledged
//!     ones after a reconnect
//!   * the receiver keeps a watermark of the highest contiguous sequence number it delivered,
//!     and it discards everything at or below that watermark as a duplicate
//! * There are no retransmit timers: the underlying transport is assumed to be reliable while
//!   connected, so retransmission happens only after a reconnect
//! * A bounded send queue provides backpressure when the peer does not keep up or is unreachable
//! * Every (re-)connect is a new *session* with its own id. Envelopes from earlier sessions are
//!   discarded, so traffic still in flight from a broken connection can not interfere.
//! * There is a reliable checksum per envelope
//!
//! ## Handshake
//!
//! One side is the *initiator* and the other side is the *responder*. For every new session,
//!  the initiator sends a HANDSHAKE carrying its receive watermark, and the responder replies
//!  with a HANDSHAKE_ACK carrying its own receive watermark. Each side then discards the
//!  messages the peer reports as received, and transmits the rest.
//!
//! If a peer reports having received more than this side ever numbered, this side's state
//!  was reset while the peer's was not. Numbering then continues after the peer's watermark
//!  so that no message is taken for a duplicate.
//!
//! ## Envelope structure
//!
//! ```ascii
//!  0: CRC-32 checksum (ISO-HDLC) of the rest of the envelope (u32)
//!  4: protocol version (u8), currently 0
//!  5: session id (u16)
//!  7: kind (u8):
//!     * 0: HANDSHAKE
//!     * 1: HANDSHAKE_ACK
//!     * 2: DATA
//!     * 3: ACK
//!     * 4: GOODBYE
//!  8: sequence number (u32):
//!     * HANDSHAKE / HANDSHAKE_ACK: the sender's receive watermark, FFFFFFFF for 'nothing received'
//!     * DATA: the message's sequence number
//!     * ACK: the highest acknowledged sequence number
//!     * not present for GOODBYE
//! 12: payload length (varint), followed by the payload - only for DATA
//! ```
//!
//! All fixed-width numbers are in network byte order.

pub mod config;
pub mod delivery_coordinator;
pub mod delivery_task;
pub mod envelope;
pub mod inbound_sequencer;
pub mod outbound_sequencer;
pub mod sequence_number;
pub mod transport_adapter;
