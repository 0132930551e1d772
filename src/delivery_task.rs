use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, span, trace, warn, Instrument, Level};

use crate::config::DeliveryConfig;
use crate::delivery_coordinator::{CoordinatorState, DeliveryCoordinator, DeliveryEvent, Role};
use crate::envelope::SessionId;
use crate::outbound_sequencer::EnqueueOutcome;
use crate::sequence_number::SequenceNumber;
use crate::transport_adapter::FrameTransport;

enum DeliveryCommand {
    Start(SessionId),
    Send {
        payload: Bytes,
        accepted: oneshot::Sender<anyhow::Result<SequenceNumber>>,
    },
    TrySend {
        payload: Bytes,
        reply: oneshot::Sender<EnqueueOutcome>,
    },
    FrameReceived(Bytes),
    Pause,
    Resume,
    Drain,
    TransportDisconnected,
    Reset,
    Close,
    State(oneshot::Sender<CoordinatorState>),
    IsClean(oneshot::Sender<bool>),
}

type WaitingSender = (Bytes, oneshot::Sender<anyhow::Result<SequenceNumber>>);

/// A handle for interacting with a running delivery task. Handles are cheap to clone, and the
///  task terminates when the last handle is dropped.
#[derive(Clone)]
pub struct DeliveryHandle {
    commands: mpsc::Sender<DeliveryCommand>,
}

impl DeliveryHandle {
    async fn command(&self, command: DeliveryCommand) -> anyhow::Result<()> {
        self.commands.send(command).await
            .map_err(|_| anyhow!("delivery task has terminated"))
    }

    async fn query<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> DeliveryCommand) -> anyhow::Result<T> {
        let (send, recv) = oneshot::channel();
        self.command(command(send)).await?;
        Ok(recv.await?)
    }

    pub async fn start(&self, session_id: SessionId) -> anyhow::Result<()> {
        self.command(DeliveryCommand::Start(session_id)).await
    }

    /// Sends a message, waiting while the send queue is at capacity. The returned future
    ///  completes when the message is accepted, not when the peer received it.
    ///
    /// NB: If this future is dropped while waiting, the message is discarded.
    pub async fn send(&self, payload: Bytes) -> anyhow::Result<SequenceNumber> {
        self.query(|accepted| DeliveryCommand::Send { payload, accepted }).await?
    }

    /// Sends a message if there is room in the send queue, handing it back otherwise
    pub async fn try_send(&self, payload: Bytes) -> anyhow::Result<EnqueueOutcome> {
        self.query(|reply| DeliveryCommand::TrySend { payload, reply }).await
    }

    /// to be called by the transport for every frame it receives
    pub async fn on_frame_received(&self, frame: Bytes) -> anyhow::Result<()> {
        self.command(DeliveryCommand::FrameReceived(frame)).await
    }

    pub async fn pause(&self) -> anyhow::Result<()> {
        self.command(DeliveryCommand::Pause).await
    }

    pub async fn resume(&self) -> anyhow::Result<()> {
        self.command(DeliveryCommand::Resume).await
    }

    pub async fn drain(&self) -> anyhow::Result<()> {
        self.command(DeliveryCommand::Drain).await
    }

    /// to be called by the transport when it loses its connection
    pub async fn transport_disconnected(&self) -> anyhow::Result<()> {
        self.command(DeliveryCommand::TransportDisconnected).await
    }

    pub async fn reset(&self) -> anyhow::Result<()> {
        self.command(DeliveryCommand::Reset).await
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.command(DeliveryCommand::Close).await
    }

    pub async fn state(&self) -> anyhow::Result<CoordinatorState> {
        self.query(DeliveryCommand::State).await
    }

    pub async fn is_clean(&self) -> anyhow::Result<bool> {
        self.query(DeliveryCommand::IsClean).await
    }
}

/// Spawns a task that owns a [DeliveryCoordinator], returning a handle for controlling it and
///  the receiver for delivered messages and lifecycle events.
///
/// The task drains periodically, and it applies the reconnect timeout after the transport
///  disconnected.
pub fn spawn_delivery_task(role: Role, config: Arc<DeliveryConfig>, transport: Arc<dyn FrameTransport>) -> anyhow::Result<(DeliveryHandle, mpsc::Receiver<DeliveryEvent>)> {
    config.validate()?;

    let (command_send, command_recv) = mpsc::channel(config.channel_buffer_size);
    let (event_send, event_recv) = mpsc::channel(config.channel_buffer_size);

    let coordinator = DeliveryCoordinator::new(role, &config, transport);
    tokio::spawn(run_delivery_loop(coordinator, config, command_recv, event_send));

    Ok((DeliveryHandle { commands: command_send }, event_recv))
}

async fn run_delivery_loop(
    mut coordinator: DeliveryCoordinator,
    config: Arc<DeliveryConfig>,
    mut commands: mpsc::Receiver<DeliveryCommand>,
    events: mpsc::Sender<DeliveryEvent>,
) {
    let mut waiting_senders: VecDeque<WaitingSender> = VecDeque::new();
    let mut restore_deadline: Option<Instant> = None;

    let mut drain_ticks = time::interval(config.drain_interval);
    drain_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!("starting delivery loop as {:?}", coordinator.role());

    loop {
        select! {
            cmd = commands.recv() => {
                match cmd {
                    Some(cmd) => on_command(cmd, &mut coordinator, &mut waiting_senders, &mut restore_deadline, &config).await,
                    None => {
                        info!("all delivery handles were dropped - shutting down delivery loop");
                        break;
                    }
                }
            }
            _ = drain_ticks.tick() => {
                coordinator.drain().await;
            }
            _ = time::sleep_until(restore_deadline.unwrap_or_else(Instant::now)), if restore_deadline.is_some() => {
                warn!("no session was established within {:?} after the transport disconnected - resetting", config.reconnect_timeout);
                restore_deadline = None;
                coordinator.reset();
                emit(&events, DeliveryEvent::RestoreFailed).await;
            }
        }

        if coordinator.state() == CoordinatorState::Active {
            restore_deadline = None;
        }

        admit_waiting_senders(&mut coordinator, &mut waiting_senders).await;
        forward_events(&mut coordinator, &events).await;
    }
}

async fn on_command(
    command: DeliveryCommand,
    coordinator: &mut DeliveryCoordinator,
    waiting_senders: &mut VecDeque<WaitingSender>,
    restore_deadline: &mut Option<Instant>,
    config: &DeliveryConfig,
) {
    match command {
        DeliveryCommand::Start(session_id) => coordinator.start(session_id).await,
        DeliveryCommand::Send { payload, accepted } => {
            if !waiting_senders.is_empty() {
                // preserve send order behind the senders that are already waiting
                waiting_senders.push_back((payload, accepted));
            }
            else if let Some(waiting) = try_enqueue(coordinator, payload, accepted).await {
                waiting_senders.push_back(waiting);
            }
        }
        DeliveryCommand::TrySend { payload, reply } => {
            let outcome = if waiting_senders.is_empty() {
                coordinator.send(payload).await
            }
            else {
                EnqueueOutcome::QueueFull(payload)
            };
            let _ = reply.send(outcome);
        }
        DeliveryCommand::FrameReceived(frame) => {
            let span = span!(Level::TRACE, "frame_received", len = frame.len());
            coordinator.on_frame_received(&frame)
                .instrument(span)
                .await;
        }
        DeliveryCommand::Pause => coordinator.pause(),
        DeliveryCommand::Resume => coordinator.resume().await,
        DeliveryCommand::Drain => coordinator.drain().await,
        DeliveryCommand::TransportDisconnected => {
            coordinator.transport_disconnected();
            if restore_deadline.is_none() && coordinator.state() == CoordinatorState::AwaitingHandshake {
                debug!("waiting up to {:?} for a new session", config.reconnect_timeout);
                *restore_deadline = Some(Instant::now() + config.reconnect_timeout);
            }
        }
        DeliveryCommand::Reset => {
            coordinator.reset();
            *restore_deadline = None;
        }
        DeliveryCommand::Close => {
            coordinator.close().await;
            *restore_deadline = None;
        }
        DeliveryCommand::State(reply) => {
            let _ = reply.send(coordinator.state());
        }
        DeliveryCommand::IsClean(reply) => {
            let _ = reply.send(coordinator.is_clean());
        }
    }
}

/// returns the sender if it has to wait for room in the send queue
async fn try_enqueue(coordinator: &mut DeliveryCoordinator, payload: Bytes, accepted: oneshot::Sender<anyhow::Result<SequenceNumber>>) -> Option<WaitingSender> {
    match coordinator.send(payload).await {
        EnqueueOutcome::Accepted(sequence) | EnqueueOutcome::Collapsed(sequence) => {
            let _ = accepted.send(Ok(sequence));
            None
        }
        EnqueueOutcome::QueueFull(payload) => {
            trace!("send queue is full - waiting for acks");
            Some((payload, accepted))
        }
        EnqueueOutcome::Rejected(_) => {
            let _ = accepted.send(Err(anyhow!("message was rejected")));
            None
        }
    }
}

async fn admit_waiting_senders(coordinator: &mut DeliveryCoordinator, waiting_senders: &mut VecDeque<WaitingSender>) {
    while coordinator.has_send_capacity() {
        let Some((payload, accepted)) = waiting_senders.pop_front() else {
            break;
        };
        if accepted.is_closed() {
            debug!("sender stopped waiting - discarding message");
            continue;
        }
        if let Some(waiting) = try_enqueue(coordinator, payload, accepted).await {
            waiting_senders.push_front(waiting);
            break;
        }
    }
}

async fn forward_events(coordinator: &mut DeliveryCoordinator, events: &mpsc::Sender<DeliveryEvent>) {
    while let Some(event) = coordinator.next_event() {
        emit(events, event).await;
    }
    while let Some(message) = coordinator.next_delivered() {
        emit(events, DeliveryEvent::Message(message)).await;
    }
}

async fn emit(events: &mpsc::Sender<DeliveryEvent>, event: DeliveryEvent) {
    if events.send(event).await.is_err() {
        trace!("event receiver was dropped - discarding event");
    }
}
