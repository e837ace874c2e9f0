//! # Error Taxonomy Module
//!
//! This module defines the error types surfaced by the transport layer,
//! together with the numeric close causes and transfer info codes that
//! appear in listener events and on the wire.
//!
//! ## Error Categories
//!
//! - **Config**: invalid parameter values, rejected synchronously at the setter
//! - **Protocol**: malformed parcels, sequence gaps, object-id reuse, handshake
//!   mismatch
//! - **Environment**: filesystem, disk space, path resolution, socket I/O
//! - **User**: rejected send orders (oversized value, unregistered class,
//!   closed connection, saturated queue)
//! - **Remote**: peer-reported failures, surfaced as ABORTED events
//!
//! Recoverable errors are confined to the affected transfer; socket, protocol
//! and internal errors close the whole connection with one of the
//! [`CloseCause`] codes below.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for all fallible transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// Invalid configuration value, raised synchronously by a parameter setter
    #[error("configuration error: {0}")]
    Config(String),

    /// Peer violated the parcel protocol
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Underlying socket or filesystem failure
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Environment problem outside the protocol itself (paths, disk space)
    #[error("environment error: {0}")]
    Environment(String),

    /// Peer presented an unexpected handshake block
    #[error("handshake rejected: {0}")]
    Handshake(String),

    /// A bounded wait expired during connection setup or shutdown
    #[error("connection timeout while {0}")]
    Timeout(&'static str),

    /// A send order was rejected before it entered the pipeline
    #[error(transparent)]
    User(#[from] UserFault),

    /// Value serialization or deserialization failed
    #[error("serialization failure: {0}")]
    Serialization(String),

    /// The peer reported a failure for one of our transmissions
    #[error("remote failure (info {info}): {}", .text.as_deref().unwrap_or("no detail"))]
    Remote { info: i32, text: Option<String> },
}

/// Synchronous rejections of user send orders; the connection stays usable
#[derive(Debug, Error)]
pub enum UserFault {
    #[error("object exceeds the maximum serialization size ({size} > {max} bytes)")]
    Oversized { size: u64, max: u64 },

    #[error("type {0} is not registered with the class registry")]
    UnregisteredClass(&'static str),

    #[error("connection is closed")]
    ConnectionClosed,

    #[error("connection is shutting down, new send orders are refused")]
    ShuttingDown,

    #[error("send order queue is saturated")]
    QueueSaturated,

    #[error("remote tempo changes are blocked on this connection")]
    TempoBlocked,

    #[error("file is missing or unreadable: {0}")]
    UnreadableFile(PathBuf),

    #[error("no transfer with object-id {0} is in flight")]
    UnknownTransfer(u64),
}

/// Why a connection reached the CLOSED state, visible in the CLOSED event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseCause {
    /// Regular close requested by the local application
    LocalClose = 0,
    /// Regular close because the local server is shutting down
    LocalServerShutdown = 1,
    /// Regular close requested by the remote application
    RemoteClose = 2,
    /// Regular close because the remote server is shutting down
    RemoteServerShutdown = 3,
    /// Socket error or unexpected end of stream
    SocketError = 4,
    /// Internal error in the connection runtime
    Internal = 5,
    /// Unrecoverable protocol violation by the peer
    Protocol = 6,
    /// The two-phase shutdown did not complete within the timeout
    ShutdownTimeout = 8,
    /// No traffic arrived within the ALIVE watchdog horizon
    AliveTimeout = 9,
    /// Hard close requested by the local application
    HardClose = 10,
    /// Outbound object serialization failed
    SerializationFailure = 11,
}

impl CloseCause {
    /// Numeric code carried in events and signals
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::LocalClose),
            1 => Some(Self::LocalServerShutdown),
            2 => Some(Self::RemoteClose),
            3 => Some(Self::RemoteServerShutdown),
            4 => Some(Self::SocketError),
            5 => Some(Self::Internal),
            6 => Some(Self::Protocol),
            8 => Some(Self::ShutdownTimeout),
            9 => Some(Self::AliveTimeout),
            10 => Some(Self::HardClose),
            11 => Some(Self::SerializationFailure),
            _ => None,
        }
    }

    /// True for the causes produced by the regular two-phase shutdown
    pub fn is_regular(self) -> bool {
        matches!(
            self,
            Self::LocalClose
                | Self::LocalServerShutdown
                | Self::RemoteClose
                | Self::RemoteServerShutdown
        )
    }

    /// True when the remote side initiated the closure
    pub fn is_remote(self) -> bool {
        matches!(self, Self::RemoteClose | Self::RemoteServerShutdown)
    }
}

/// Info codes for file-transfer abort events, mirrored between the outgoing
/// and incoming sides of a transfer.
pub mod file_code {
    /// Outgoing transfer failed, peer could not assign the destination
    pub const OUT_REMOTE_ASSIGNMENT: i32 = 101;
    /// Incoming transfer failed, destination could not be assigned locally
    pub const IN_LOCAL_ASSIGNMENT: i32 = 102;
    /// Outgoing transfer completed but no CONFIRM arrived in time
    pub const OUT_CONFIRM_TIMEOUT: i32 = 103;
    /// Outgoing transfer cancelled by the local user
    pub const OUT_LOCAL_BREAK: i32 = 105;
    /// Incoming transfer cancelled by the local user
    pub const IN_LOCAL_BREAK: i32 = 106;
    /// Incoming transfer cancelled by the remote user
    pub const IN_REMOTE_BREAK: i32 = 107;
    /// Outgoing transfer cancelled by the remote user
    pub const OUT_REMOTE_BREAK: i32 = 108;
    /// Outgoing transfer failed locally (source unreadable, disk error)
    pub const OUT_LOCAL_ERROR: i32 = 109;
    /// Outgoing transfer dropped because the local side closed
    pub const OUT_LOCAL_CLOSE: i32 = 113;
    /// Incoming transfer dropped because the local side closed
    pub const IN_LOCAL_CLOSE: i32 = 114;
    /// Outgoing transfer dropped because the remote side closed
    pub const OUT_REMOTE_CLOSE: i32 = 115;
    /// Incoming transfer dropped because the remote side closed
    pub const IN_REMOTE_CLOSE: i32 = 116;
    /// Payload CRC-32 did not match the header CRC
    pub const CRC_FAILURE: i32 = 118;
}

/// Info codes for object-transfer abort events
pub mod object_code {
    /// Outgoing object cancelled by the local user
    pub const LOCAL_BREAK: i32 = 201;
    /// Outgoing object failed locally (serialization or internal error)
    pub const LOCAL_ERROR: i32 = 203;
    /// Object dropped by a hard closure
    pub const HARD_CLOSURE: i32 = 205;
    /// Peer could not deserialize the object
    pub const REMOTE_DESERIALIZATION: i32 = 207;
    /// Peer has no reception configured for this object
    pub const NO_REMOTE_RECEPTION: i32 = 209;
}

/// Failure reason codes carried in the info field of FAIL signals
pub mod fail_reason {
    /// Destination could not be assigned (missing root, bad path, no space,
    /// colliding transfer, orphan or out-of-sync parcel)
    pub const ASSIGNMENT: i32 = 1;
    /// Receiver could not deserialize the completed object
    pub const DESERIALIZATION: i32 = 2;
    /// Received file payload failed the CRC-32 check
    pub const CRC: i32 = 3;
    /// Receiver has no reception configured for this channel
    pub const NO_RECEPTION: i32 = 4;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_cause_codes_round_trip() {
        for cause in [
            CloseCause::LocalClose,
            CloseCause::LocalServerShutdown,
            CloseCause::RemoteClose,
            CloseCause::RemoteServerShutdown,
            CloseCause::SocketError,
            CloseCause::Internal,
            CloseCause::Protocol,
            CloseCause::ShutdownTimeout,
            CloseCause::AliveTimeout,
            CloseCause::HardClose,
            CloseCause::SerializationFailure,
        ] {
            assert_eq!(CloseCause::from_code(cause.code() as i32), Some(cause));
        }
        // 7 was never assigned
        assert_eq!(CloseCause::from_code(7), None);
    }

    #[test]
    fn regular_and_remote_classification() {
        assert!(CloseCause::LocalClose.is_regular());
        assert!(CloseCause::RemoteClose.is_regular());
        assert!(!CloseCause::SocketError.is_regular());
        assert!(CloseCause::RemoteServerShutdown.is_remote());
        assert!(!CloseCause::LocalClose.is_remote());
    }
}
