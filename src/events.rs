//! # Event Delivery Module
//!
//! Listener-visible events pass through a bounded per-connection queue and
//! are delivered by a worker task, so slow application code can never stall
//! the socket workers. In GLOBAL mode every connection shares one process
//! -wide delivery worker; in INDIVIDUAL mode each connection runs its own.
//!
//! A blocking-output monitor samples the global worker's progress. When one
//! connection's listener stalls the shared worker beyond that connection's
//! `deliver-tolerance`, the connection is migrated to a dedicated worker and
//! the shared worker stops serving it. Events stay in the connection's own
//! queue throughout, and a per-connection delivery lock serializes the
//! handoff, so listener call order is preserved across the migration.
//!
//! A connection never emits events after its CLOSED event.

use crate::codec::AnyValue;
use crate::defaults;
use crate::error::CloseCause;
use crate::params::DeliveryMode;
use crate::wire::Priority;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Identity of a connection, handed to listeners with every event
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Process-local connection number
    pub id: u64,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

/// Listener-visible connection events
pub enum ConnectionEvent {
    /// Handshake completed, the connection is usable
    Connected,
    /// A complete object arrived and was deserialized
    ObjectReceived {
        priority: Priority,
        object_id: u64,
        value: AnyValue,
    },
    /// An object transmission failed; `info` is one of the object codes
    ObjectAborted {
        object_id: u64,
        info: i32,
        text: Option<String>,
    },
    /// A file arrived, was verified and renamed to its destination
    FileReceived {
        object_id: u64,
        priority: Priority,
        path: PathBuf,
        size: u64,
    },
    /// A file transfer failed; `info` is one of the file codes
    FileAborted {
        object_id: u64,
        info: i32,
        text: Option<String>,
    },
    /// The peer confirmed correct reception of an outgoing file
    FileConfirmed { object_id: u64 },
    /// An ECHO answered our PING
    PingEcho { ping_id: u64, rtt: Duration },
    /// Traffic crossed the idle threshold
    IdleChanged { idle: bool },
    /// The connection entered the SHUTDOWN state
    Shutdown { info: i32, text: Option<String> },
    /// Terminal event; no further events follow
    Closed {
        cause: CloseCause,
        text: Option<String>,
    },
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::ObjectReceived {
                priority,
                object_id,
                ..
            } => write!(
                f,
                "ObjectReceived {{ priority: {:?}, object_id: {} }}",
                priority, object_id
            ),
            Self::ObjectAborted {
                object_id, info, ..
            } => write!(f, "ObjectAborted {{ object_id: {}, info: {} }}", object_id, info),
            Self::FileReceived {
                object_id,
                path,
                size,
                ..
            } => write!(
                f,
                "FileReceived {{ object_id: {}, path: {}, size: {} }}",
                object_id,
                path.display(),
                size
            ),
            Self::FileAborted {
                object_id, info, ..
            } => write!(f, "FileAborted {{ object_id: {}, info: {} }}", object_id, info),
            Self::FileConfirmed { object_id } => {
                write!(f, "FileConfirmed {{ object_id: {} }}", object_id)
            }
            Self::PingEcho { ping_id, rtt } => {
                write!(f, "PingEcho {{ ping_id: {}, rtt: {:?} }}", ping_id, rtt)
            }
            Self::IdleChanged { idle } => write!(f, "IdleChanged {{ idle: {} }}", idle),
            Self::Shutdown { info, .. } => write!(f, "Shutdown {{ info: {} }}", info),
            Self::Closed { cause, .. } => write!(f, "Closed {{ cause: {:?} }}", cause),
        }
    }
}

/// Application callback surface. Listeners are invoked synchronously, in
/// registration order, from a delivery worker.
pub trait ConnectionListener: Send + Sync {
    fn on_event(&self, connection: &ConnectionInfo, event: &ConnectionEvent);
}

/// Per-connection event queue plus the listener set it feeds
pub(crate) struct DeliveryTarget {
    pub(crate) info: ConnectionInfo,
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
    queue: Mutex<VecDeque<ConnectionEvent>>,
    /// Producers wait here while the queue is full
    space: Notify,
    /// The individual worker waits here
    wake: Notify,
    /// Serializes delivery across the global/individual worker handoff
    delivery_lock: tokio::sync::Mutex<()>,
    migrated: AtomicBool,
    /// The CLOSED event has been enqueued; later emits are dropped
    closed: AtomicBool,
    /// The CLOSED event has been delivered; workers retire the target
    finished: AtomicBool,
    tolerance: Duration,
}

impl DeliveryTarget {
    pub(crate) fn new(info: ConnectionInfo, mode: DeliveryMode, tolerance: Duration) -> Arc<Self> {
        let target = Arc::new(Self {
            info,
            listeners: RwLock::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            space: Notify::new(),
            wake: Notify::new(),
            delivery_lock: tokio::sync::Mutex::new(()),
            migrated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            tolerance,
        });
        match mode {
            DeliveryMode::Individual => {
                target.migrated.store(true, Ordering::SeqCst);
                spawn_individual_worker(target.clone());
            }
            DeliveryMode::Global => hub().attach(target.clone()),
        }
        target
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Enqueue without waiting; only for connection setup, where the queue
    /// cannot be full yet.
    pub(crate) fn emit_now(&self, event: ConnectionEvent) {
        {
            let mut queue = self.queue.lock();
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            queue.push_back(event);
        }
        self.wake_worker();
    }

    /// Enqueue an event, waiting while the queue is at capacity. The CLOSED
    /// event bypasses the bound so closing can never block indefinitely; the
    /// closed flag is checked and set under the queue lock, so nothing can
    /// slip into the queue behind the CLOSED event.
    pub(crate) async fn emit(&self, event: ConnectionEvent) {
        let is_close = matches!(event, ConnectionEvent::Closed { .. });
        let mut event = Some(event);
        loop {
            {
                let mut queue = self.queue.lock();
                if self.closed.load(Ordering::SeqCst) {
                    debug!(conn = self.info.id, "event dropped after close");
                    return;
                }
                if queue.len() < defaults::EVENT_QUEUE_CAPACITY || is_close {
                    queue.push_back(event.take().unwrap());
                    if is_close {
                        self.closed.store(true, Ordering::SeqCst);
                    }
                    break;
                }
            }
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut queue = self.queue.lock();
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }
                if queue.len() < defaults::EVENT_QUEUE_CAPACITY {
                    queue.push_back(event.take().unwrap());
                    break;
                }
            }
            notified.await;
        }
        self.wake_worker();
    }

    fn wake_worker(&self) {
        if self.migrated.load(Ordering::SeqCst) {
            self.wake.notify_one();
        } else {
            let hub = hub();
            // the worker pair dies with the runtime that hosted it; respawn
            // into the current one if that happened
            hub.ensure_worker();
            hub.wake.notify_one();
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.queue.lock().is_empty()
    }

    /// Deliver at most one queued event. `record` is the hub when the caller
    /// is the global worker, so the blocking-output monitor can see progress.
    async fn deliver_one(self: Arc<Self>, record: Option<&'static GlobalHub>) -> bool {
        let _serial = self.delivery_lock.lock().await;
        let event = self.queue.lock().pop_front();
        let Some(event) = event else {
            return false;
        };

        if let Some(hub) = record {
            *hub.current.lock() = Some((Arc::downgrade(&self), Instant::now()));
        }
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            listener.on_event(&self.info, &event);
        }
        if let Some(hub) = record {
            *hub.current.lock() = None;
        }

        if matches!(event, ConnectionEvent::Closed { .. }) {
            self.finished.store(true, Ordering::SeqCst);
        }
        self.space.notify_waiters();
        true
    }

    fn retired(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Process-global delivery worker shared by GLOBAL-mode connections
struct GlobalHub {
    targets: Mutex<Vec<Arc<DeliveryTarget>>>,
    wake: Notify,
    /// What the global worker is delivering right now, for the monitor
    current: Mutex<Option<(Weak<DeliveryTarget>, Instant)>>,
    /// Liveness flag of the current worker pair; cleared when the runtime
    /// that hosted it shuts down, so the next attach respawns the workers
    worker: Mutex<Option<Arc<AtomicBool>>>,
}

static HUB: OnceLock<GlobalHub> = OnceLock::new();

fn hub() -> &'static GlobalHub {
    HUB.get_or_init(|| GlobalHub {
        targets: Mutex::new(Vec::new()),
        wake: Notify::new(),
        current: Mutex::new(None),
        worker: Mutex::new(None),
    })
}

/// Marks the worker dead when its task is dropped with its runtime
struct WorkerGuard {
    alive: Arc<AtomicBool>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

impl GlobalHub {
    fn attach(&'static self, target: Arc<DeliveryTarget>) {
        self.targets.lock().push(target);
        self.ensure_worker();
        self.wake.notify_one();
    }

    fn ensure_worker(&'static self) {
        let mut worker = self.worker.lock();
        if worker
            .as_ref()
            .is_some_and(|alive| alive.load(Ordering::SeqCst))
        {
            return;
        }
        let alive = Arc::new(AtomicBool::new(true));
        *worker = Some(alive.clone());
        tokio::spawn(run_global_worker(self, WorkerGuard { alive: alive.clone() }));
        tokio::spawn(run_blocking_monitor(self, WorkerGuard { alive }));
    }

    /// Retire the current worker pair and start a fresh one. Used when the
    /// worker is wedged inside a listener that never returns; the old worker
    /// exits as soon as that listener lets go of it.
    fn respawn_worker(&'static self) {
        if let Some(old) = self.worker.lock().take() {
            old.store(false, Ordering::SeqCst);
        }
        self.ensure_worker();
        self.wake.notify_one();
    }
}

async fn run_global_worker(hub: &'static GlobalHub, guard: WorkerGuard) {
    loop {
        if !guard.alive.load(Ordering::SeqCst) {
            debug!("superseded global delivery worker exiting");
            break;
        }
        let snapshot: Vec<Arc<DeliveryTarget>> = hub.targets.lock().clone();
        let mut delivered = false;
        for target in &snapshot {
            if target.migrated.load(Ordering::SeqCst) || target.retired() {
                continue;
            }
            if target.clone().deliver_one(Some(hub)).await {
                delivered = true;
            }
        }
        hub.targets
            .lock()
            .retain(|t| !t.retired() && !t.migrated.load(Ordering::SeqCst));
        if delivered {
            continue;
        }

        let notified = hub.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let pending = hub
            .targets
            .lock()
            .iter()
            .any(|t| !t.migrated.load(Ordering::SeqCst) && t.has_pending());
        if pending {
            continue;
        }
        notified.await;
    }
}

/// Samples the global worker's in-flight delivery; a connection that holds
/// the worker beyond its own tolerance is moved to a dedicated worker.
async fn run_blocking_monitor(hub: &'static GlobalHub, guard: WorkerGuard) {
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    loop {
        tick.tick().await;
        if !guard.alive.load(Ordering::SeqCst) {
            break;
        }
        let stalled = {
            let current = hub.current.lock();
            match current.as_ref() {
                Some((weak, since)) => weak
                    .upgrade()
                    .filter(|t| since.elapsed() > t.tolerance),
                None => None,
            }
        };
        if let Some(target) = stalled {
            migrate(target);
            // the old worker is wedged inside that listener; replace it so
            // the remaining connections keep getting their events
            *hub.current.lock() = None;
            hub.respawn_worker();
        }
    }
}

fn migrate(target: Arc<DeliveryTarget>) {
    if target.migrated.swap(true, Ordering::SeqCst) {
        return;
    }
    warn!(
        conn = target.info.id,
        "event delivery stalled beyond tolerance, moving connection to a dedicated delivery worker"
    );
    spawn_individual_worker(target);
}

fn spawn_individual_worker(target: Arc<DeliveryTarget>) {
    tokio::spawn(async move {
        loop {
            if target.clone().deliver_one(None).await {
                continue;
            }
            if target.retired() {
                break;
            }
            let notified = target.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if target.has_pending() {
                continue;
            }
            if target.retired() {
                break;
            }
            notified.await;
        }
        debug!(conn = target.info.id, "delivery worker retired");
    });
}
