//! # Wire Format Module
//!
//! Everything that touches raw bytes: parcel framing with scan-resync,
//! control-signal packing, and the connection handshake blocks.

pub mod handshake;
pub mod parcel;
pub mod signal;

pub use parcel::{read_parcel, write_parcel, Channel, ObjectHeader, Parcel, Priority, WireError};
pub use signal::{Signal, SignalKind};
