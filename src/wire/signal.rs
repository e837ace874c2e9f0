//! # Control Signal Module
//!
//! Signals are single parcels on the SIGNAL channel. The subtype rides in
//! the low 16 bits of the sequence field, the referenced object (or ping id)
//! in the object-id field, and the payload is a big-endian `i32` info value
//! followed by optional UTF-8 text.

use super::parcel::{Channel, Parcel, Priority, WireError};

/// Signal vocabulary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SignalKind {
    /// Unsolicited liveness beacon
    Alive = 1,
    /// Ask the peer to beacon every `info` milliseconds
    AliveRequest = 2,
    /// Acknowledge an alive request
    AliveConfirm = 3,
    /// Request the peer cap its send rate at `info` bytes/second
    Tempo = 4,
    /// File received correctly
    Confirm = 5,
    /// A transfer failed at the peer
    Fail = 6,
    /// The peer cancels a transfer
    Break = 7,
    /// Round-trip probe
    Ping = 8,
    /// Reply to a ping
    Echo = 9,
    /// The peer entered the SHUTDOWN state
    Shutdown = 10,
    /// All-data-sent marker of the shutdown phase
    Closed = 11,
}

impl SignalKind {
    pub fn from_wire(code: u16) -> Option<Self> {
        match code {
            1 => Some(Self::Alive),
            2 => Some(Self::AliveRequest),
            3 => Some(Self::AliveConfirm),
            4 => Some(Self::Tempo),
            5 => Some(Self::Confirm),
            6 => Some(Self::Fail),
            7 => Some(Self::Break),
            8 => Some(Self::Ping),
            9 => Some(Self::Echo),
            10 => Some(Self::Shutdown),
            11 => Some(Self::Closed),
            _ => None,
        }
    }

    /// Send priority. BREAK travels below the probe signals so it can never
    /// starve them; everything else wins against data outright.
    pub fn priority(self) -> Priority {
        match self {
            Self::Break => Priority::High,
            _ => Priority::Top,
        }
    }
}

/// A decoded control signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub kind: SignalKind,
    /// Referenced object id, ping id, or 0
    pub object_id: u64,
    pub info: i32,
    pub text: Option<String>,
}

impl Signal {
    pub fn new(kind: SignalKind, object_id: u64, info: i32, text: Option<String>) -> Self {
        Self {
            kind,
            object_id,
            info,
            text,
        }
    }

    pub fn alive() -> Self {
        Self::new(SignalKind::Alive, 0, 0, None)
    }

    pub fn alive_request(period_ms: i32) -> Self {
        Self::new(SignalKind::AliveRequest, 0, period_ms, None)
    }

    pub fn alive_confirm(period_ms: i32) -> Self {
        Self::new(SignalKind::AliveConfirm, 0, period_ms, None)
    }

    pub fn tempo(bytes_per_second: i64) -> Self {
        // the wire info field is 32-bit; rates above that are uncapped anyway
        let clamped = bytes_per_second.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
        Self::new(SignalKind::Tempo, 0, clamped, None)
    }

    pub fn confirm(object_id: u64) -> Self {
        Self::new(SignalKind::Confirm, object_id, 0, None)
    }

    pub fn fail(object_id: u64, reason: i32, text: Option<String>) -> Self {
        Self::new(SignalKind::Fail, object_id, reason, text)
    }

    pub fn brk(object_id: u64, reason: i32, text: Option<String>) -> Self {
        Self::new(SignalKind::Break, object_id, reason, text)
    }

    pub fn ping(ping_id: u64) -> Self {
        Self::new(SignalKind::Ping, ping_id, 0, None)
    }

    pub fn echo(ping_id: u64) -> Self {
        Self::new(SignalKind::Echo, ping_id, 0, None)
    }

    pub fn shutdown(info: i32, text: Option<String>) -> Self {
        Self::new(SignalKind::Shutdown, 0, info, text)
    }

    pub fn closed(info: i32, text: Option<String>) -> Self {
        Self::new(SignalKind::Closed, 0, info, text)
    }

    /// Frame this signal as a single parcel
    pub fn into_parcel(self) -> Parcel {
        let mut payload = Vec::with_capacity(4 + self.text.as_ref().map_or(0, |t| t.len()));
        payload.extend_from_slice(&self.info.to_be_bytes());
        if let Some(text) = &self.text {
            payload.extend_from_slice(text.as_bytes());
        }
        Parcel {
            channel: Channel::Signal,
            priority: self.kind.priority(),
            object_id: self.object_id,
            sequence: self.kind as u32,
            header: None,
            payload,
        }
    }

    /// Decode a SIGNAL-channel parcel
    pub fn from_parcel(parcel: &Parcel) -> Result<Self, WireError> {
        debug_assert_eq!(parcel.channel, Channel::Signal);
        let code = (parcel.sequence & 0xFFFF) as u16;
        let kind = SignalKind::from_wire(code)
            .ok_or_else(|| WireError::Protocol(format!("unknown signal subtype {}", code)))?;
        if parcel.payload.len() < 4 {
            return Err(WireError::Protocol("signal payload below 4 bytes".into()));
        }
        let info = i32::from_be_bytes(parcel.payload[..4].try_into().unwrap());
        let text = if parcel.payload.len() > 4 {
            Some(String::from_utf8_lossy(&parcel.payload[4..]).into_owned())
        } else {
            None
        };
        Ok(Self {
            kind,
            object_id: parcel.object_id,
            info,
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_round_trips_through_parcel() {
        let sig = Signal::fail(99, 3, Some("CRC failure".into()));
        let parcel = sig.clone().into_parcel();
        assert_eq!(parcel.channel, Channel::Signal);
        assert_eq!(parcel.sequence, SignalKind::Fail as u32);
        let back = Signal::from_parcel(&parcel).unwrap();
        assert_eq!(back, sig);
    }

    #[test]
    fn textless_signal_round_trips() {
        let sig = Signal::confirm(12);
        let back = Signal::from_parcel(&sig.clone().into_parcel()).unwrap();
        assert_eq!(back, sig);
    }

    #[test]
    fn break_travels_at_high_everything_else_at_top() {
        assert_eq!(Signal::brk(1, 0, None).into_parcel().priority, Priority::High);
        assert_eq!(Signal::ping(1).into_parcel().priority, Priority::Top);
        assert_eq!(Signal::alive().into_parcel().priority, Priority::Top);
        assert_eq!(Signal::shutdown(0, None).into_parcel().priority, Priority::Top);
    }

    #[test]
    fn unknown_subtype_is_rejected() {
        let mut parcel = Signal::alive().into_parcel();
        parcel.sequence = 0xFFFF;
        assert!(Signal::from_parcel(&parcel).is_err());
    }

    #[test]
    fn tempo_clamps_to_wire_width() {
        let sig = Signal::tempo(i64::MAX);
        assert_eq!(sig.info, i32::MAX);
        let sig = Signal::tempo(-1);
        assert_eq!(sig.info, -1);
    }
}
