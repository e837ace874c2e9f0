//! # Connection Handshake Module
//!
//! Immediately after TCP connect, each side writes its role greeting: a
//! fixed 16-byte block whose value differs between the client and server
//! roles, so a client dialed into another client (or a server into a server)
//! is detected before any parcel traffic. Each side then writes a 20-byte
//! CONNECTION_CONFIRM block, a fixed 16-byte prefix followed by a big-endian
//! `u32` carrying the sender's requested ALIVE period in milliseconds. Both
//! reads run under a bounded timer.

use crate::error::TransportError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

/// Greeting written by the dialing side
pub const CLIENT_GREETING: [u8; 16] = *b"PARCELNET-C/1.0\n";

/// Greeting written by the accepting side
pub const SERVER_GREETING: [u8; 16] = *b"PARCELNET-S/1.0\n";

/// Prefix of the CONNECTION_CONFIRM block
pub const CONFIRM_PREFIX: [u8; 16] = *b"PARCELNET-OK/1.0";

/// Which end of the stream this side is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn own_greeting(self) -> &'static [u8; 16] {
        match self {
            Role::Client => &CLIENT_GREETING,
            Role::Server => &SERVER_GREETING,
        }
    }

    fn peer_greeting(self) -> &'static [u8; 16] {
        match self {
            Role::Client => &SERVER_GREETING,
            Role::Server => &CLIENT_GREETING,
        }
    }
}

/// Run the handshake for `role`, returning the peer's requested ALIVE period
/// in milliseconds (0 = none requested).
pub async fn exchange<S>(
    stream: &mut S,
    role: Role,
    alive_request_ms: u32,
    limit: Duration,
) -> Result<u32, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    timeout(limit, run(stream, role, alive_request_ms))
        .await
        .map_err(|_| TransportError::Timeout("performing the connection handshake"))?
}

async fn run<S>(stream: &mut S, role: Role, alive_request_ms: u32) -> Result<u32, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // both sides write first, then read, so neither blocks the other
    stream.write_all(role.own_greeting()).await?;
    stream.flush().await?;

    let mut greeting = [0u8; 16];
    stream.read_exact(&mut greeting).await?;
    if &greeting != role.peer_greeting() {
        if &greeting == role.own_greeting() {
            return Err(TransportError::Handshake(format!(
                "peer presented the same {:?}-role greeting, both ends have the same role",
                role
            )));
        }
        return Err(TransportError::Handshake(
            "peer greeting does not match this protocol".into(),
        ));
    }

    let mut confirm = [0u8; 20];
    confirm[..16].copy_from_slice(&CONFIRM_PREFIX);
    confirm[16..].copy_from_slice(&alive_request_ms.to_be_bytes());
    stream.write_all(&confirm).await?;
    stream.flush().await?;

    let mut peer_confirm = [0u8; 20];
    stream.read_exact(&mut peer_confirm).await?;
    if peer_confirm[..16] != CONFIRM_PREFIX {
        return Err(TransportError::Handshake(
            "peer confirm block is malformed".into(),
        ));
    }
    let peer_alive_ms = u32::from_be_bytes(peer_confirm[16..].try_into().unwrap());
    debug!(role = ?role, peer_alive_ms, "handshake complete");
    Ok(peer_alive_ms)
}
