use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use crate::config::DeliveryConfig;
use crate::envelope::{Envelope, EnvelopeKind, SessionId};
use crate::inbound_sequencer::InboundSequencer;
use crate::outbound_sequencer::{EnqueueOutcome, OutboundSequencer};
use crate::sequence_number::SequenceNumber;
use crate::transport_adapter::{FrameTransport, TransportAdapter};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Role {
    /// opens sessions by sending HANDSHAKE, and closes them with GOODBYE
    Initiator,
    /// waits for the peer's HANDSHAKE and replies with HANDSHAKE_ACK
    Responder,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CoordinatorState {
    New,
    AwaitingHandshake,
    Active,
    Closed,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DeliveryEvent {
    Message(Bytes),
    Connected(SessionId),
    Disconnected,
    Closed,
    /// no session was established within the reconnect timeout, protocol state was reset
    RestoreFailed,
    TransportFailed(String),
}

/// The coordinator ties both sequencers and the transport adapter together, running the
///  session handshake and routing envelopes. It is a plain state object without internal
///  synchronization: exactly one owner drives it (see [crate::delivery_task]).
///
/// NB: None of the functions return Result. Malformed or stale envelopes are logged and dropped,
///  and transport failures are reported as [DeliveryEvent::TransportFailed] - they pause
///  transmission, and unacknowledged messages are transmitted again on resume or after the next handshake.
pub struct DeliveryCoordinator {
    role: Role,
    state: CoordinatorState,
    session_id: Option<SessionId>,
    /// the session that was current before a reset, until the next `start`
    stale_session: Option<SessionId>,
    max_payload_size: usize,

    outbound: OutboundSequencer,
    inbound: InboundSequencer,
    adapter: TransportAdapter,

    events: VecDeque<DeliveryEvent>,
}

impl DeliveryCoordinator {
    pub fn new(role: Role, config: &DeliveryConfig, transport: Arc<dyn FrameTransport>) -> DeliveryCoordinator {
        DeliveryCoordinator {
            role,
            state: CoordinatorState::New,
            session_id: None,
            stale_session: None,
            max_payload_size: config.max_payload_size,
            outbound: OutboundSequencer::new(config),
            inbound: InboundSequencer::new(config),
            adapter: TransportAdapter::new(transport, config.max_payload_size),
            events: VecDeque::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    pub fn outbound(&self) -> &OutboundSequencer {
        &self.outbound
    }

    pub fn inbound(&self) -> &InboundSequencer {
        &self.inbound
    }

    pub fn is_clean(&self) -> bool {
        self.outbound.is_clean() && self.inbound.is_clean()
    }

    pub fn has_send_capacity(&self) -> bool {
        self.outbound.has_capacity()
    }

    /// the next message delivered by the peer, in order
    pub fn next_delivered(&mut self) -> Option<Bytes> {
        self.inbound.next_delivered()
    }

    /// the next lifecycle event (never [DeliveryEvent::Message], see [Self::next_delivered])
    pub fn next_event(&mut self) -> Option<DeliveryEvent> {
        self.events.pop_front()
    }

    /// Starts a new session. Messages are not transmitted before the handshake for this session
    ///  completes.
    pub async fn start(&mut self, session_id: SessionId) {
        if self.state == CoordinatorState::Closed {
            warn!("attempting to start session {} after close - ignoring", session_id);
            return;
        }

        info!("starting session {} as {:?}", session_id, self.role);
        self.session_id = Some(session_id);
        self.stale_session = None;
        self.state = CoordinatorState::AwaitingHandshake;
        self.outbound.pause();

        if self.role == Role::Initiator {
            let last_received = self.inbound.on_handshake();
            self.transmit(Envelope::handshake(session_id, last_received)).await;
        }
    }

    pub async fn send(&mut self, payload: Bytes) -> EnqueueOutcome {
        if self.state == CoordinatorState::Closed {
            debug!("send after close - rejecting");
            return EnqueueOutcome::Rejected(payload);
        }
        if payload.len() > self.max_payload_size {
            warn!("payload of {} bytes exceeds the maximum of {} bytes - rejecting", payload.len(), self.max_payload_size);
            return EnqueueOutcome::Rejected(payload);
        }

        let outcome = self.outbound.enqueue(payload);
        if let EnqueueOutcome::Accepted(_) = outcome {
            self.transmit_pending().await;
        }
        outcome
    }

    pub async fn on_frame_received(&mut self, frame: &[u8]) {
        if let Some(envelope) = self.adapter.on_frame_received(frame) {
            self.receive(envelope).await;
        }
    }

    pub async fn receive(&mut self, envelope: Envelope) {
        if self.state == CoordinatorState::Closed {
            debug!("received envelope for session {} after close - dropping", envelope.session_id);
            return;
        }
        if !self.is_current_session(&envelope) {
            debug!("received envelope for session {} while current session is {:?} - dropping", envelope.session_id, self.session_id);
            return;
        }

        match envelope.kind {
            EnvelopeKind::Handshake { last_received } => self.on_handshake(envelope.session_id, last_received).await,
            EnvelopeKind::HandshakeAck { last_received } => self.on_handshake_ack(envelope.session_id, last_received).await,
            EnvelopeKind::Data { sequence, payload } => self.on_data(sequence, payload).await,
            EnvelopeKind::Ack { sequence } => self.on_ack(sequence).await,
            EnvelopeKind::Goodbye => self.on_goodbye(),
        }
    }

    fn is_current_session(&self, envelope: &Envelope) -> bool {
        match self.session_id {
            Some(session_id) => session_id == envelope.session_id,
            None => self.role == Role::Responder
                && matches!(envelope.kind, EnvelopeKind::Handshake { .. })
                && self.stale_session != Some(envelope.session_id),
        }
    }

    async fn on_handshake(&mut self, session_id: SessionId, peer_last_received: Option<SequenceNumber>) {
        if self.role == Role::Initiator {
            warn!("received HANDSHAKE for session {} as initiator - dropping", session_id);
            return;
        }
        if !Self::is_valid_watermark(session_id, peer_last_received) {
            return;
        }
        if self.session_id.is_none() {
            info!("adopting session {} from incoming HANDSHAKE", session_id);
            self.session_id = Some(session_id);
        }

        let last_received = self.inbound.on_handshake();
        if self.transmit(Envelope::handshake_ack(session_id, last_received)).await {
            self.complete_handshake(session_id, peer_last_received).await;
        }
    }

    async fn on_handshake_ack(&mut self, session_id: SessionId, peer_last_received: Option<SequenceNumber>) {
        if self.role == Role::Responder {
            warn!("received HANDSHAKE_ACK for session {} as responder - dropping", session_id);
            return;
        }
        if self.state != CoordinatorState::AwaitingHandshake {
            debug!("received HANDSHAKE_ACK for session {} in state {:?} - ignoring", session_id, self.state);
            return;
        }
        if !Self::is_valid_watermark(session_id, peer_last_received) {
            return;
        }
        self.complete_handshake(session_id, peer_last_received).await;
    }

    /// A watermark at the end of the sequence number space can not come from a well-behaved peer
    fn is_valid_watermark(session_id: SessionId, peer_last_received: Option<SequenceNumber>) -> bool {
        if SequenceNumber::after(peer_last_received).is_none() {
            warn!("peer reports watermark {:?} for session {} which leaves no sequence number space - dropping handshake", peer_last_received, session_id);
            return false;
        }
        true
    }

    async fn complete_handshake(&mut self, session_id: SessionId, peer_last_received: Option<SequenceNumber>) {
        debug!("handshake for session {} complete, peer received up to {:?}", session_id, peer_last_received);

        self.outbound.on_new_session(peer_last_received);
        if self.state != CoordinatorState::Active {
            self.state = CoordinatorState::Active;
            self.events.push_back(DeliveryEvent::Connected(session_id));
        }
        self.outbound.resume();
        self.transmit_pending().await;
    }

    async fn on_data(&mut self, sequence: SequenceNumber, payload: Bytes) {
        if self.state != CoordinatorState::Active {
            debug!("received message #{} in state {:?} - dropping", sequence, self.state);
            return;
        }
        if let Some(ack) = self.inbound.on_data(sequence, payload) {
            self.send_ack(ack).await;
        }
    }

    async fn on_ack(&mut self, sequence: SequenceNumber) {
        if self.state != CoordinatorState::Active {
            debug!("received ack #{} in state {:?} - dropping", sequence, self.state);
            return;
        }
        if self.outbound.on_ack(sequence) > 0 {
            self.transmit_pending().await;
        }
    }

    fn on_goodbye(&mut self) {
        if self.state != CoordinatorState::Active {
            warn!("received GOODBYE in state {:?} - ignoring", self.state);
            return;
        }
        info!("peer closed session {:?}", self.session_id);
        self.outbound.pause();
        self.state = CoordinatorState::Closed;
        self.events.push_back(DeliveryEvent::Closed);
    }

    /// Transmits whatever is eligible for transmission, and flushes a pending delayed ack
    pub async fn drain(&mut self) {
        if self.state != CoordinatorState::Active {
            return;
        }
        if let Some(ack) = self.inbound.take_pending_ack() {
            self.send_ack(ack).await;
        }
        self.transmit_pending().await;
    }

    pub fn pause(&mut self) {
        self.outbound.pause();
    }

    /// Re-enables transmission. Before the handshake for the current session is complete, this
    ///  has no effect: completing the handshake resumes transmission.
    pub async fn resume(&mut self) {
        if self.state != CoordinatorState::Active {
            debug!("resume in state {:?} - transmission starts after the handshake", self.state);
            return;
        }
        self.outbound.resume();
        self.transmit_pending().await;
    }

    /// The transport lost its connection: transmission pauses until a new session is started
    ///  and its handshake completes. No state is discarded.
    pub fn transport_disconnected(&mut self) {
        self.outbound.pause();
        if self.state == CoordinatorState::Active {
            info!("transport disconnected in session {:?}", self.session_id);
            self.state = CoordinatorState::AwaitingHandshake;
            self.events.push_back(DeliveryEvent::Disconnected);
        }
    }

    /// Discards all protocol state, returning to state `New` (unless closed). The session that
    ///  was current is stale from then on: a responder does not adopt it from a late HANDSHAKE,
    ///  only a `start` for it makes it current again.
    pub fn reset(&mut self) {
        debug!("resetting protocol state");
        self.outbound.reset();
        self.inbound.reset();
        if self.state != CoordinatorState::Closed {
            self.state = CoordinatorState::New;
            if let Some(session_id) = self.session_id.take() {
                self.stale_session = Some(session_id);
            }
        }
    }

    /// Closes the session for good. An initiator notifies the peer with GOODBYE.
    pub async fn close(&mut self) {
        if self.state == CoordinatorState::Closed {
            return;
        }

        if let (Role::Initiator, CoordinatorState::Active, Some(session_id)) = (self.role, self.state, self.session_id) {
            self.transmit(Envelope::goodbye(session_id)).await;
        }

        self.reset();
        self.state = CoordinatorState::Closed;
        info!("closed");
    }

    async fn send_ack(&mut self, sequence: SequenceNumber) {
        if let Some(session_id) = self.session_id {
            trace!("acknowledging #{}", sequence);
            self.transmit(Envelope::ack(session_id, sequence)).await;
        }
    }

    async fn transmit_pending(&mut self) {
        let Some(session_id) = self.session_id else {
            return;
        };

        while let Some((sequence, payload)) = self.outbound.next_transmission() {
            if !self.transmit(Envelope::data(session_id, sequence, payload)).await {
                self.outbound.transmission_failed(sequence);
                break;
            }
        }
    }

    async fn transmit(&mut self, envelope: Envelope) -> bool {
        match self.adapter.transmit(&envelope).await {
            Ok(()) => true,
            Err(e) => {
                //NB: a message that failed to transmit stays in the queue and is transmitted again on resume or after the next handshake
                warn!("failed to transmit envelope for session {}: {} - pausing transmission", envelope.session_id, e);
                self.outbound.pause();
                self.events.push_back(DeliveryEvent::TransportFailed(e.to_string()));
                false
            }
        }
    }
}
