//! Shared helpers for the integration tests: a loopback connection pair,
//! an event recorder and a handshaken raw peer for wire-level tests.

#![allow(dead_code)]

use parcelnet::wire::handshake::{self, Role};
use parcelnet::{
    dial, register_class, Acceptor, Connection, ConnectionEvent, ConnectionInfo,
    ConnectionListener, Parameters,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;

/// Cloneable mirror of the listener events, for assertions
#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Connected,
    Object {
        id: u64,
        text: Option<String>,
        bytes: Option<Vec<u8>>,
    },
    ObjectAborted { id: u64, info: i32 },
    File { id: u64, path: PathBuf, size: u64 },
    FileAborted { id: u64, info: i32 },
    FileConfirmed { id: u64 },
    PingEcho { id: u64 },
    Idle(bool),
    Shutdown,
    Closed { cause: u8 },
}

pub struct Recorder {
    seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn snapshot(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    /// Poll until the predicate holds over the recorded events
    pub async fn wait_for(
        &self,
        what: &str,
        limit: Duration,
        pred: impl Fn(&[Seen]) -> bool,
    ) -> Vec<Seen> {
        let started = std::time::Instant::now();
        loop {
            let snapshot = self.snapshot();
            if pred(&snapshot) {
                return snapshot;
            }
            if started.elapsed() > limit {
                panic!("timed out waiting for {}; saw {:?}", what, snapshot);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl ConnectionListener for Recorder {
    fn on_event(&self, _connection: &ConnectionInfo, event: &ConnectionEvent) {
        let seen = match event {
            ConnectionEvent::Connected => Seen::Connected,
            ConnectionEvent::ObjectReceived {
                object_id, value, ..
            } => Seen::Object {
                id: *object_id,
                text: value.downcast_ref::<String>().cloned(),
                bytes: value.downcast_ref::<Vec<u8>>().cloned(),
            },
            ConnectionEvent::ObjectAborted {
                object_id, info, ..
            } => Seen::ObjectAborted {
                id: *object_id,
                info: *info,
            },
            ConnectionEvent::FileReceived {
                object_id,
                path,
                size,
                ..
            } => Seen::File {
                id: *object_id,
                path: path.clone(),
                size: *size,
            },
            ConnectionEvent::FileAborted {
                object_id, info, ..
            } => Seen::FileAborted {
                id: *object_id,
                info: *info,
            },
            ConnectionEvent::FileConfirmed { object_id } => Seen::FileConfirmed { id: *object_id },
            ConnectionEvent::PingEcho { ping_id, .. } => Seen::PingEcho { id: *ping_id },
            ConnectionEvent::IdleChanged { idle } => Seen::Idle(*idle),
            ConnectionEvent::Shutdown { .. } => Seen::Shutdown,
            ConnectionEvent::Closed { cause, .. } => Seen::Closed {
                cause: cause.code(),
            },
        };
        self.seen.lock().unwrap().push(seen);
    }
}

/// Both ends must register the same classes in the same order
pub fn register_test_classes() {
    register_class::<String>("String");
    register_class::<Vec<u8>>("Vec<u8>");
}

/// A connected loopback pair with recorders attached on both sides:
/// `(server, server_events, client, client_events)`
pub async fn pair(
    server_params: Parameters,
    client_params: Parameters,
) -> (Connection, Arc<Recorder>, Connection, Arc<Recorder>) {
    register_test_classes();
    let acceptor = Acceptor::bind("127.0.0.1:0", server_params).await.unwrap();
    let addr = acceptor.local_addr().unwrap();
    let (server, client) = tokio::join!(acceptor.accept(), dial(addr, client_params));
    let server = server.unwrap();
    let client = client.unwrap();

    let server_events = Recorder::new();
    let client_events = Recorder::new();
    server.add_listener(server_events.clone());
    client.add_listener(client_events.clone());
    (server, server_events, client, client_events)
}

/// Dial and handshake by hand, returning the raw stream for wire-level tests
pub async fn raw_client(addr: std::net::SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    handshake::exchange(&mut stream, Role::Client, 0, Duration::from_secs(5))
        .await
        .unwrap();
    stream
}
