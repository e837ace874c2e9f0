//! # Parcelnet
//!
//! A connection-oriented transport layer on top of TCP that multiplexes
//! application objects and filesystem files across a single stream. Traffic
//! is cut into parcels and scheduled by channel and priority, so urgent
//! objects overtake bulk file transfers at parcel granularity while every
//! channel keeps strict per-priority FIFO ordering. The layer embeds
//! liveness signaling, idle detection, send-rate capping and a two-phase
//! graceful shutdown.

pub mod assembly;
pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod files;
pub mod logging;
pub mod net;
pub mod params;
pub mod scheduler;
pub mod wire;

pub use codec::{register_class, set_custom_codec, ClassRegistry, Codec};
pub use connection::{Connection, ConnectionState};
pub use error::{CloseCause, TransportError, UserFault};
pub use events::{ConnectionEvent, ConnectionInfo, ConnectionListener};
pub use net::{dial, Acceptor};
pub use params::{DeliveryMode, Parameters};
pub use wire::{Channel, Priority};

/// The current version of the transport layer
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Restore process-global state (class registry, custom codec, active file
/// destinations) to factory defaults. Meant for tests.
pub fn reset() {
    codec::reset();
    files::reset();
}

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default maximum payload bytes per parcel
    pub const PARCEL_SIZE: usize = 64 * 1024;

    /// Default capacity of the pending send-order queue
    pub const OBJECT_QUEUE_CAPACITY: usize = 200;

    /// Default capacity of the ordered outgoing parcel queue
    pub const PARCEL_QUEUE_CAPACITY: usize = 600;

    /// Default ceiling on the serialized size of one object
    pub const MAX_SERIALIZATION_SIZE: u64 = 100 * 1024 * 1024;

    /// Default wait for a file CONFIRM from the peer
    pub const CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

    /// Default idle-monitor sampling period
    pub const IDLE_CHECK_PERIOD: Duration = Duration::from_secs(60);

    /// Default blocking-output detector horizon
    pub const DELIVER_TOLERANCE: Duration = Duration::from_secs(10);

    /// Default bound on the drain phase of a regular shutdown
    pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

    /// Bound on the handshake exchange
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

    /// How long a user send waits on a saturated order queue before failing
    pub const SEND_ORDER_TIMEOUT: Duration = Duration::from_secs(20);

    /// Capacity of a connection's event queue
    pub const EVENT_QUEUE_CAPACITY: usize = 512;

    /// Time budget of one transmit iteration of the send worker
    pub const TRANSMIT_BUDGET: Duration = Duration::from_millis(50);

    /// Silent alive periods tolerated before the watchdog closes
    pub const ALIVE_MISS_FACTOR: u64 = 2;
}
