use std::fmt::{Display, Formatter};

/// Sequence numbers are assigned to application messages by the sending side, starting at
///  0 for fresh protocol state. They are never reused while the protocol state lives, so a
///  message keeps its number across any number of retransmissions.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SequenceNumber(u32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    /// Handshake envelopes carry the peer's receive watermark, which is 'nothing received yet'
    ///  for fresh protocol state. On the wire, that is encoded as this value - which means that
    ///  this value is not available as a regular sequence number.
    pub const NONE_ON_WIRE: u32 = u32::MAX;

    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }

    /// `None` if the sequence number space is exhausted
    pub fn next(&self) -> Option<SequenceNumber> {
        self.0.checked_add(1)
            .filter(|&n| n != Self::NONE_ON_WIRE)
            .map(SequenceNumber)
    }

    /// The sequence number expected after a given watermark, i.e. 0 if nothing was
    ///  received / acknowledged yet. `None` if the watermark leaves no sequence number space.
    pub fn after(watermark: Option<SequenceNumber>) -> Option<SequenceNumber> {
        match watermark {
            None => Some(SequenceNumber::ZERO),
            Some(seq) => seq.next(),
        }
    }

    pub fn watermark_to_wire(watermark: Option<SequenceNumber>) -> u32 {
        watermark
            .map(|seq| seq.0)
            .unwrap_or(Self::NONE_ON_WIRE)
    }

    pub fn watermark_from_wire(raw: u32) -> Option<SequenceNumber> {
        if raw == Self::NONE_ON_WIRE {
            None
        }
        else {
            Some(SequenceNumber(raw))
        }
    }
}
