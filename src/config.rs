use std::time::Duration;

use anyhow::bail;

pub struct DeliveryConfig {
    /// This is the maximum number of messages held by the sending side pending acknowledgement,
    ///  i.e. messages that were accepted for sending but are not confirmed by the peer yet.
    ///  Further sends are refused (or wait, depending on the API) until acks free up space.
    ///
    /// `0` means 'unbounded'. That is supported for compatibility, but an unbounded send queue
    ///  can grow without limit while the peer is unreachable, so it should be used with care.
    pub send_queue_capacity: usize,

    /// This is the maximum number of messages transmitted but not yet acknowledged at any given
    ///  time. It is independent of the queue capacity: messages beyond the window stay queued
    ///  and are transmitted as acks come in.
    pub send_window: usize,

    /// The receiving side acknowledges every n-th contiguous message rather than every single one.
    ///  A pending ack is flushed on the next drain, and duplicates are always acknowledged
    ///  immediately. `1` acknowledges every message.
    pub max_delayed_acks: u32,

    /// After the transport reports a disconnect, the owner has this much time to re-establish
    ///  a session. If no handshake completes within this time, the protocol state is reset and
    ///  the owner is notified that the connection could not be restored.
    pub reconnect_timeout: Duration,

    /// Interval for periodic draining: transmitting queued messages and flushing delayed acks
    pub drain_interval: Duration,

    pub max_payload_size: usize,

    /// buffer size of the channels between the delivery task, its handles and the event receiver
    pub channel_buffer_size: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            send_queue_capacity: 5000,
            send_window: 32,
            max_delayed_acks: 1,
            reconnect_timeout: Duration::from_secs(5),
            drain_interval: Duration::from_millis(100),
            max_payload_size: 16*1024*1024,
            channel_buffer_size: 1024,
        }
    }
}

impl DeliveryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.send_window == 0 {
            bail!("send window must be at least 1");
        }
        if self.max_delayed_acks == 0 {
            bail!("max delayed acks must be at least 1");
        }
        if self.drain_interval.is_zero() {
            bail!("drain interval must be positive");
        }
        if self.reconnect_timeout.is_zero() {
            bail!("reconnect timeout must be positive");
        }
        if self.max_payload_size == 0 || self.max_payload_size > u32::MAX as usize {
            bail!("max payload size must be between 1 and {}", u32::MAX);
        }
        if self.channel_buffer_size == 0 {
            bail!("channel buffer size must be at least 1");
        }

        Ok(())
    }

    pub fn effective_send_queue_capacity(&self) -> usize {
        match self.send_queue_capacity {
            0 => usize::MAX,
            n => n,
        }
    }
}
