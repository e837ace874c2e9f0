//! # Connection Module
//!
//! A `Connection` owns one duplex TCP stream and composes the send
//! scheduler, the receive dispatcher, the aggregators, the signal state
//! machine, the liveness timers and the event delivery target. The state
//! machine is `Connected → Shutdown → Closed`, with a direct jump to
//! `Closed` for irregular causes; `Closed` is terminal.
//!
//! The socket's read half is owned by the receive worker and its write half
//! by the send worker; nothing else touches the stream. Signals raised from
//! other tasks (timers, the receive side, user calls) reach the wire by
//! being pushed onto the ordered parcel queue, where they outrank data.

use crate::codec::{self, Codec};
use crate::defaults;
use crate::dispatch;
use crate::error::{file_code, object_code, CloseCause, TransportError, UserFault};
use crate::events::{ConnectionEvent, ConnectionInfo, ConnectionListener, DeliveryTarget};
use crate::files::FileAssembler;
use crate::assembly::ObjectAssembler;
use crate::params::Parameters;
use crate::scheduler::{self, OrderKind, ParcelQueue, SendOrder};
use crate::wire::{Channel, Priority, Signal, SignalKind};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, info, warn};

/// Lifecycle states of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    Shutdown,
    Closed,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Outbound file bookkeeping, alive until CONFIRM, FAIL, BREAK or timeout
pub(crate) struct OutboundFile {
    pub destination: String,
    /// Set when the last parcel has been handed to the wire; the CONFIRM
    /// timeout runs from here
    pub completed_at: Option<Instant>,
}

/// Shared state behind a [`Connection`] handle
pub(crate) struct ConnectionCore {
    pub(crate) info: ConnectionInfo,
    pub(crate) params: Parameters,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) target: Arc<DeliveryTarget>,
    pub(crate) parcel_queue: Arc<ParcelQueue>,
    pub(crate) input_tx: mpsc::Sender<SendOrder>,
    state_tx: watch::Sender<ConnectionState>,

    terminated: AtomicBool,
    finalized: AtomicBool,
    /// Wakes suspended workers; with the terminal flag set it stops them
    pub(crate) wakeup: Notify,

    next_object_id: AtomicU64,
    next_file_id: AtomicU64,
    next_ping_id: AtomicU64,

    pub(crate) object_assemblers: Mutex<HashMap<u64, ObjectAssembler>>,
    pub(crate) file_assemblers: Mutex<HashMap<u64, FileAssembler>>,
    pub(crate) retired_objects: Mutex<HashSet<u64>>,
    pub(crate) retired_files: Mutex<HashSet<u64>>,
    pub(crate) outbound_files: Mutex<HashMap<u64, OutboundFile>>,
    cancelled_outbound: Mutex<HashSet<(Channel, u64)>>,
    pings: Mutex<HashMap<u64, Instant>>,

    tempo: AtomicI64,
    tempo_blocked: AtomicBool,
    alive_period_ms: AtomicU64,

    epoch: Instant,
    last_sent_ms: AtomicU64,
    last_received_ms: AtomicU64,
    window_bytes: AtomicU64,
    idle: AtomicBool,

    remote_initiated_close: AtomicBool,
    remote_server_shutdown: AtomicBool,
    local_server_shutdown: AtomicBool,
    all_sent_pushed: AtomicBool,
    all_sent_written: AtomicBool,
    remote_all_sent: AtomicBool,
}

impl ConnectionCore {
    pub(crate) fn id(&self) -> u64 {
        self.info.id
    }

    pub(crate) fn params(&self) -> &Parameters {
        &self.params
    }

    pub(crate) fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub(crate) fn parcel_queue(&self) -> &Arc<ParcelQueue> {
        &self.parcel_queue
    }

    pub(crate) fn wakeup(&self) -> &Notify {
        &self.wakeup
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub(crate) fn send_tempo(&self) -> i64 {
        self.tempo.load(Ordering::Relaxed)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn note_bytes_sent(&self, bytes: u64) {
        self.last_sent_ms.store(self.now_ms(), Ordering::Relaxed);
        self.window_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn note_bytes_received(&self, bytes: u64) {
        self.last_received_ms.store(self.now_ms(), Ordering::Relaxed);
        self.window_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) async fn emit(&self, event: ConnectionEvent) {
        self.target.emit(event).await;
    }

    pub(crate) async fn emit_object_aborted(&self, object_id: u64, info: i32, text: Option<String>) {
        self.emit(ConnectionEvent::ObjectAborted {
            object_id,
            info,
            text,
        })
        .await;
    }

    pub(crate) fn push_signal(&self, signal: Signal) {
        self.parcel_queue.push_signal(signal.into_parcel());
    }

    pub(crate) fn is_outbound_cancelled(&self, channel: Channel, object_id: u64) -> bool {
        self.cancelled_outbound
            .lock()
            .contains(&(channel, object_id))
    }

    /// The send worker finished handing a file to the wire; the CONFIRM
    /// timeout starts now.
    pub(crate) fn note_file_fully_queued(&self, object_id: u64) {
        if let Some(entry) = self.outbound_files.lock().get_mut(&object_id) {
            entry.completed_at = Some(Instant::now());
        }
    }

    /// An outbound stream died mid-flight (source unreadable, disk error)
    pub(crate) async fn note_stream_failed(
        &self,
        channel: Channel,
        object_id: u64,
        error: &TransportError,
    ) {
        warn!(
            conn = self.id(),
            object_id,
            "outbound {:?} transmission failed: {}",
            channel,
            error
        );
        match channel {
            Channel::File => {
                self.outbound_files.lock().remove(&object_id);
                self.push_signal(Signal::brk(
                    object_id,
                    crate::error::fail_reason::ASSIGNMENT,
                    Some(error.to_string()),
                ));
                self.emit(ConnectionEvent::FileAborted {
                    object_id,
                    info: file_code::OUT_LOCAL_ERROR,
                    text: Some(error.to_string()),
                })
                .await;
            }
            _ => {
                self.emit_object_aborted(object_id, object_code::LOCAL_ERROR, Some(error.to_string()))
                    .await;
            }
        }
    }

    /// Send-side drain hook: in the SHUTDOWN state, once the order queue and
    /// the parcel queue are both empty, push the all-data-sent marker.
    pub(crate) async fn on_send_side_drained(&self) {
        if self.state() != ConnectionState::Shutdown {
            return;
        }
        if !self.all_sent_pushed.swap(true, Ordering::SeqCst) {
            debug!(conn = self.id(), "all data sent, pushing CLOSED marker");
            self.push_signal(Signal::closed(0, None));
        }
    }

    /// The all-data-sent marker went out on the wire
    pub(crate) async fn note_all_sent_written(&self) {
        self.all_sent_written.store(true, Ordering::SeqCst);
        self.maybe_finalize_regular().await;
    }

    async fn maybe_finalize_regular(&self) {
        if self.all_sent_written.load(Ordering::SeqCst)
            && self.remote_all_sent.load(Ordering::SeqCst)
        {
            let cause = if self.remote_initiated_close.load(Ordering::SeqCst) {
                if self.remote_server_shutdown.load(Ordering::SeqCst) {
                    CloseCause::RemoteServerShutdown
                } else {
                    CloseCause::RemoteClose
                }
            } else if self.local_server_shutdown.load(Ordering::SeqCst) {
                CloseCause::LocalServerShutdown
            } else {
                CloseCause::LocalClose
            };
            self.finalize(cause, None).await;
        }
    }

    /// Irregular closure entry point
    pub(crate) async fn fail_connection(&self, cause: CloseCause, text: String) {
        self.finalize(cause, Some(text)).await;
    }

    /// Move to CLOSED exactly once: stop the workers, abort outstanding
    /// transfers with their close codes, release every registration and
    /// deliver the terminal event.
    pub(crate) async fn finalize(&self, cause: CloseCause, text: Option<String>) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(conn = self.id(), cause = ?cause, "connection closed");
        self.state_tx.send_replace(ConnectionState::Closed);
        self.terminated.store(true, Ordering::SeqCst);
        self.wakeup.notify_waiters();
        self.parcel_queue.ready().notify_waiters();

        let (in_code, out_code) = if cause.is_remote() {
            (file_code::IN_REMOTE_CLOSE, file_code::OUT_REMOTE_CLOSE)
        } else {
            (file_code::IN_LOCAL_CLOSE, file_code::OUT_LOCAL_CLOSE)
        };

        let inbound: Vec<FileAssembler> = {
            let mut map = self.file_assemblers.lock();
            map.drain().map(|(_, asm)| asm).collect()
        };
        for assembler in inbound {
            let object_id = assembler.object_id;
            self.retired_files.lock().insert(object_id);
            assembler.abort();
            self.emit(ConnectionEvent::FileAborted {
                object_id,
                info: in_code,
                text: None,
            })
            .await;
        }

        let outbound: Vec<u64> = {
            let mut map = self.outbound_files.lock();
            map.drain().map(|(id, _)| id).collect()
        };
        for object_id in outbound {
            self.emit(ConnectionEvent::FileAborted {
                object_id,
                info: out_code,
                text: None,
            })
            .await;
        }

        self.object_assemblers.lock().clear();
        self.pings.lock().clear();

        self.emit(ConnectionEvent::Closed { cause, text }).await;
    }

    /// Enter the SHUTDOWN state. `remote` marks who initiated; `info` 1
    /// carries the server-shutdown flavor across the wire.
    async fn enter_shutdown(self: Arc<Self>, remote: bool, info: i32, text: Option<String>) {
        let moved = {
            let mut entered = false;
            self.state_tx.send_if_modified(|state| {
                if *state == ConnectionState::Connected {
                    *state = ConnectionState::Shutdown;
                    entered = true;
                    true
                } else {
                    false
                }
            });
            entered
        };
        if !moved {
            return;
        }

        if remote {
            self.remote_initiated_close.store(true, Ordering::SeqCst);
            if info == 1 {
                self.remote_server_shutdown.store(true, Ordering::SeqCst);
            }
        } else {
            if info == 1 {
                self.local_server_shutdown.store(true, Ordering::SeqCst);
            }
            self.push_signal(Signal::shutdown(info, text.clone()));
        }
        debug!(conn = self.id(), remote, "entering shutdown");
        self.emit(ConnectionEvent::Shutdown { info, text }).await;
        // rotate the send worker out of its wait so the drain check runs
        self.wakeup.notify_waiters();

        let core = self.clone();
        let limit = core.params.shutdown_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            if core.state() != ConnectionState::Closed {
                warn!(conn = core.id(), "shutdown did not drain within {:?}", limit);
                core.finalize(CloseCause::ShutdownTimeout, None).await;
            }
        });
    }

    /// Receive-side signal state machine
    pub(crate) async fn handle_signal(self: Arc<Self>, signal: Signal) {
        match signal.kind {
            SignalKind::Alive => {
                // traffic itself feeds the watchdog
            }
            SignalKind::AliveRequest => {
                let requested = Duration::from_millis(signal.info.max(0) as u64);
                if requested.is_zero()
                    || (Duration::from_secs(5)..=Duration::from_secs(600)).contains(&requested)
                {
                    self.alive_period_ms
                        .store(requested.as_millis() as u64, Ordering::Relaxed);
                    self.push_signal(Signal::alive_confirm(signal.info));
                } else {
                    warn!(conn = self.id(), period = signal.info, "unreasonable alive request ignored");
                }
            }
            SignalKind::AliveConfirm => {
                debug!(conn = self.id(), period = signal.info, "peer confirmed alive request");
            }
            SignalKind::Tempo => {
                let rate = if signal.info <= 0 { -1 } else { signal.info as i64 };
                info!(conn = self.id(), rate, "peer adjusted our send tempo");
                self.tempo.store(rate, Ordering::Relaxed);
            }
            SignalKind::Confirm => {
                let entry = self.outbound_files.lock().remove(&signal.object_id);
                if let Some(entry) = entry {
                    debug!(
                        conn = self.id(),
                        object_id = signal.object_id,
                        dest = %entry.destination,
                        "peer confirmed file reception"
                    );
                    self.emit(ConnectionEvent::FileConfirmed {
                        object_id: signal.object_id,
                    })
                    .await;
                } else {
                    debug!(conn = self.id(), object_id = signal.object_id, "stray CONFIRM");
                }
            }
            SignalKind::Fail => self.handle_remote_fail(signal).await,
            SignalKind::Break => self.handle_remote_break(signal).await,
            SignalKind::Ping => {
                self.push_signal(Signal::echo(signal.object_id));
            }
            SignalKind::Echo => {
                let started = self.pings.lock().remove(&signal.object_id);
                if let Some(started) = started {
                    self.emit(ConnectionEvent::PingEcho {
                        ping_id: signal.object_id,
                        rtt: started.elapsed(),
                    })
                    .await;
                }
            }
            SignalKind::Shutdown => {
                self.clone().enter_shutdown(true, signal.info, signal.text).await;
            }
            SignalKind::Closed => {
                debug!(conn = self.id(), "peer finished sending");
                self.remote_all_sent.store(true, Ordering::SeqCst);
                self.maybe_finalize_regular().await;
            }
        }
    }

    /// FAIL from the peer: one of our transmissions died on their side
    async fn handle_remote_fail(&self, signal: Signal) {
        let object_id = signal.object_id;
        let was_file = self.outbound_files.lock().remove(&object_id).is_some();
        if was_file {
            self.cancelled_outbound
                .lock()
                .insert((Channel::File, object_id));
            self.parcel_queue.purge(Channel::File, object_id);
            let info = match signal.info {
                crate::error::fail_reason::CRC => file_code::CRC_FAILURE,
                _ => file_code::OUT_REMOTE_ASSIGNMENT,
            };
            self.emit(ConnectionEvent::FileAborted {
                object_id,
                info,
                text: signal.text,
            })
            .await;
        } else {
            let info = match signal.info {
                crate::error::fail_reason::DESERIALIZATION => object_code::REMOTE_DESERIALIZATION,
                crate::error::fail_reason::NO_RECEPTION => object_code::NO_REMOTE_RECEPTION,
                _ => object_code::LOCAL_ERROR,
            };
            self.cancelled_outbound
                .lock()
                .insert((Channel::Object, object_id));
            self.parcel_queue.purge(Channel::Object, object_id);
            self.emit_object_aborted(object_id, info, signal.text).await;
        }
    }

    /// BREAK from the peer: they cancel a transfer in either direction
    async fn handle_remote_break(&self, signal: Signal) {
        let object_id = signal.object_id;

        let inbound = self.file_assemblers.lock().remove(&object_id);
        if let Some(assembler) = inbound {
            self.retired_files.lock().insert(object_id);
            assembler.abort();
            self.emit(ConnectionEvent::FileAborted {
                object_id,
                info: file_code::IN_REMOTE_BREAK,
                text: signal.text,
            })
            .await;
            return;
        }

        if self.outbound_files.lock().remove(&object_id).is_some() {
            self.cancelled_outbound
                .lock()
                .insert((Channel::File, object_id));
            self.parcel_queue.purge(Channel::File, object_id);
            self.emit(ConnectionEvent::FileAborted {
                object_id,
                info: file_code::OUT_REMOTE_BREAK,
                text: signal.text,
            })
            .await;
            return;
        }

        // an inbound object the peer gave up on mid-flight
        if self.object_assemblers.lock().remove(&object_id).is_some() {
            self.retired_objects.lock().insert(object_id);
            debug!(conn = self.id(), object_id, "peer broke an inbound object");
        }
    }
}

/// One prioritized transport connection over TCP
pub struct Connection {
    core: Arc<ConnectionCore>,
}

impl Connection {
    /// Assemble the runtime around a handshaken stream and start the
    /// workers. Called by the dial/accept helpers.
    pub(crate) fn start(
        stream: TcpStream,
        params: Parameters,
        peer_alive_request_ms: u32,
    ) -> Result<Self, TransportError> {
        let codec = codec::resolve(params.serialization_method())?;
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let info = ConnectionInfo {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            local_addr,
            remote_addr,
        };

        // the local setting wins; a peer request only fills in an unset one
        let alive_ms = if params.alive_period().is_zero() {
            peer_alive_request_ms as u64
        } else {
            params.alive_period().as_millis() as u64
        };

        let target = DeliveryTarget::new(
            info.clone(),
            params.delivery_mode(),
            params.deliver_tolerance(),
        );
        let parcel_queue = ParcelQueue::new(params.parcel_queue_capacity());
        let (input_tx, input_rx) = mpsc::channel(params.object_queue_capacity());

        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        let core = Arc::new(ConnectionCore {
            info: info.clone(),
            codec,
            target,
            parcel_queue,
            input_tx,
            state_tx,
            terminated: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            wakeup: Notify::new(),
            // odd ids for objects, even for files: two counters, one id space
            next_object_id: AtomicU64::new(1),
            next_file_id: AtomicU64::new(2),
            next_ping_id: AtomicU64::new(1),
            object_assemblers: Mutex::new(HashMap::new()),
            file_assemblers: Mutex::new(HashMap::new()),
            retired_objects: Mutex::new(HashSet::new()),
            retired_files: Mutex::new(HashSet::new()),
            outbound_files: Mutex::new(HashMap::new()),
            cancelled_outbound: Mutex::new(HashSet::new()),
            pings: Mutex::new(HashMap::new()),
            tempo: AtomicI64::new(params.tempo()),
            tempo_blocked: AtomicBool::new(false),
            alive_period_ms: AtomicU64::new(alive_ms),
            epoch: Instant::now(),
            last_sent_ms: AtomicU64::new(0),
            last_received_ms: AtomicU64::new(0),
            window_bytes: AtomicU64::new(0),
            idle: AtomicBool::new(false),
            remote_initiated_close: AtomicBool::new(false),
            remote_server_shutdown: AtomicBool::new(false),
            local_server_shutdown: AtomicBool::new(false),
            all_sent_pushed: AtomicBool::new(false),
            all_sent_written: AtomicBool::new(false),
            remote_all_sent: AtomicBool::new(false),
            params,
        });

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(scheduler::run(core.clone(), write_half, input_rx));
        tokio::spawn(dispatch::run(core.clone(), read_half));
        tokio::spawn(run_housekeeping(core.clone()));
        tokio::spawn(run_idle_monitor(core.clone()));

        let connection = Self { core };
        connection.core.target.emit_now(ConnectionEvent::Connected);
        info!(
            conn = connection.core.id(),
            local = %info.local_addr,
            remote = %info.remote_addr,
            "connection established"
        );
        Ok(connection)
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.core.info
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.info.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.core.info.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn parameters(&self) -> &Parameters {
        &self.core.params
    }

    pub fn is_idle(&self) -> bool {
        self.core.idle.load(Ordering::Relaxed)
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.core.target.add_listener(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ConnectionListener>) {
        self.core.target.remove_listener(listener);
    }

    fn check_open(&self) -> Result<(), TransportError> {
        match self.core.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Shutdown => Err(UserFault::ShuttingDown.into()),
            _ => Err(UserFault::ConnectionClosed.into()),
        }
    }

    /// Queue a registered value for transmission. Serialization happens on
    /// the send worker; this call only blocks while the order queue is full,
    /// and fails after a bounded wait.
    pub async fn send_object<T>(&self, value: T, priority: Priority) -> Result<u64, TransportError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.check_open()?;
        let code = codec::registry()
            .read()
            .code_for::<T>()
            .ok_or(UserFault::UnregisteredClass(std::any::type_name::<T>()))?;
        let object_id = self.core.next_object_id.fetch_add(2, Ordering::Relaxed);
        let order = SendOrder {
            object_id,
            priority,
            kind: OrderKind::Object {
                value: Box::new(value),
                code,
            },
        };
        self.enqueue(order).await?;
        Ok(object_id)
    }

    /// Queue a file for transmission to `destination`, a path relative to
    /// the receiver's file root.
    pub async fn send_file(
        &self,
        source: impl AsRef<Path>,
        destination: &str,
        priority: Priority,
    ) -> Result<u64, TransportError> {
        self.check_open()?;
        let source = source.as_ref().to_path_buf();
        let readable = std::fs::metadata(&source)
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !readable {
            return Err(UserFault::UnreadableFile(source).into());
        }

        let object_id = self.core.next_file_id.fetch_add(2, Ordering::Relaxed);
        self.core.outbound_files.lock().insert(
            object_id,
            OutboundFile {
                destination: destination.to_owned(),
                completed_at: None,
            },
        );
        let order = SendOrder {
            object_id,
            priority,
            kind: OrderKind::File {
                source,
                destination: destination.to_owned(),
            },
        };
        if let Err(e) = self.enqueue(order).await {
            self.core.outbound_files.lock().remove(&object_id);
            return Err(e);
        }
        Ok(object_id)
    }

    async fn enqueue(&self, order: SendOrder) -> Result<(), TransportError> {
        match self
            .core
            .input_tx
            .send_timeout(order, defaults::SEND_ORDER_TIMEOUT)
            .await
        {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => Err(UserFault::QueueSaturated.into()),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                Err(UserFault::ConnectionClosed.into())
            }
        }
    }

    /// Cancel a file transfer in either direction. The peer is informed
    /// with a BREAK signal and the matching FILE_ABORTED event fires locally.
    pub async fn cancel_file(&self, object_id: u64) -> Result<(), TransportError> {
        let core = &self.core;

        if core.outbound_files.lock().remove(&object_id).is_some() {
            core.cancelled_outbound
                .lock()
                .insert((Channel::File, object_id));
            core.parcel_queue.purge(Channel::File, object_id);
            core.push_signal(Signal::brk(object_id, 0, Some("user break".into())));
            core.emit(ConnectionEvent::FileAborted {
                object_id,
                info: file_code::OUT_LOCAL_BREAK,
                text: None,
            })
            .await;
            return Ok(());
        }

        let inbound = core.file_assemblers.lock().remove(&object_id);
        if let Some(assembler) = inbound {
            core.retired_files.lock().insert(object_id);
            assembler.abort();
            core.push_signal(Signal::brk(object_id, 0, Some("user break".into())));
            core.emit(ConnectionEvent::FileAborted {
                object_id,
                info: file_code::IN_LOCAL_BREAK,
                text: None,
            })
            .await;
            return Ok(());
        }

        Err(UserFault::UnknownTransfer(object_id).into())
    }

    /// Cancel a queued outbound object
    pub async fn cancel_object(&self, object_id: u64) -> Result<(), TransportError> {
        let core = &self.core;
        core.cancelled_outbound
            .lock()
            .insert((Channel::Object, object_id));
        let purged = core.parcel_queue.purge(Channel::Object, object_id);
        if purged == 0 {
            debug!(conn = core.id(), object_id, "cancel found nothing queued");
        }
        core.push_signal(Signal::brk(object_id, 0, Some("user break".into())));
        core.emit_object_aborted(object_id, object_code::LOCAL_BREAK, None)
            .await;
        Ok(())
    }

    /// Measure the round trip; the answer arrives as a PING_ECHO event
    pub fn ping(&self) -> Result<u64, TransportError> {
        self.check_open()?;
        let ping_id = self.core.next_ping_id.fetch_add(1, Ordering::Relaxed);
        self.core.pings.lock().insert(ping_id, Instant::now());
        self.core.push_signal(Signal::ping(ping_id));
        Ok(ping_id)
    }

    /// Cap the local outbound rate in bytes/second; -1 removes the cap
    pub fn set_tempo(&self, bytes_per_second: i64) -> Result<(), TransportError> {
        if bytes_per_second != -1 && bytes_per_second <= 0 {
            return Err(TransportError::Config(
                "tempo must be -1 (uncapped) or positive".into(),
            ));
        }
        self.core.tempo.store(bytes_per_second, Ordering::Relaxed);
        Ok(())
    }

    /// Ask the peer to cap its send rate. Refused locally, with no wire
    /// traffic, while tempo requests are blocked on this connection.
    pub fn request_peer_tempo(&self, bytes_per_second: i64) -> Result<(), TransportError> {
        self.check_open()?;
        if self.core.tempo_blocked.load(Ordering::Relaxed) {
            return Err(UserFault::TempoBlocked.into());
        }
        self.core.push_signal(Signal::tempo(bytes_per_second));
        Ok(())
    }

    /// Block or unblock outgoing tempo requests on this connection
    pub fn block_tempo_requests(&self, blocked: bool) {
        self.core.tempo_blocked.store(blocked, Ordering::Relaxed);
    }

    /// Ask the peer to beacon ALIVE every `period`
    pub fn request_alive(&self, period: Duration) -> Result<(), TransportError> {
        self.check_open()?;
        if !period.is_zero()
            && !(Duration::from_secs(5)..=Duration::from_secs(600)).contains(&period)
        {
            return Err(TransportError::Config(format!(
                "alive period {:?} outside 5s..=10min",
                period
            )));
        }
        self.core
            .push_signal(Signal::alive_request(period.as_millis() as i32));
        Ok(())
    }

    /// Rotate suspended workers out of their waits without losing state
    pub fn interrupt(&self) {
        self.core.wakeup.notify_waiters();
        self.core.parcel_queue.ready().notify_waiters();
    }

    /// Regular two-phase close: stop accepting send orders, drain in-flight
    /// traffic both ways, then settle into CLOSED.
    pub async fn close(&self) {
        self.core.clone().enter_shutdown(false, 0, None).await;
    }

    /// Regular close on behalf of a shutting-down server; both sides report
    /// the server-shutdown close causes.
    pub async fn close_for_server_shutdown(&self) {
        self.core.clone().enter_shutdown(false, 1, None).await;
    }

    /// Drop everything immediately; in-flight transfers are aborted
    pub async fn close_hard(&self) {
        self.core
            .finalize(CloseCause::HardClose, Some("hard close".into()))
            .await;
    }

    /// Wait until the connection reaches CLOSED
    pub async fn wait_closed(&self) {
        let mut rx = self.core.state_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == ConnectionState::Closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.core.info.id)
            .field("local", &self.core.info.local_addr)
            .field("remote", &self.core.info.remote_addr)
            .field("state", &self.core.state())
            .finish()
    }
}

/// Beacon, watchdog and CONFIRM sweep, one tick per second
async fn run_housekeeping(core: Arc<ConnectionCore>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_beacon_ms = 0u64;
    loop {
        tick.tick().await;
        if core.is_terminated() {
            break;
        }
        let now = core.epoch.elapsed().as_millis() as u64;
        let period = core.alive_period_ms.load(Ordering::Relaxed);

        if period > 0 {
            let last_sent = core.last_sent_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last_sent) >= period && now.saturating_sub(last_beacon_ms) >= period
            {
                last_beacon_ms = now;
                core.push_signal(Signal::alive());
            }

            let last_received = core.last_received_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last_received) > period * defaults::ALIVE_MISS_FACTOR {
                warn!(conn = core.id(), "no traffic within the alive horizon");
                core.finalize(CloseCause::AliveTimeout, None).await;
                break;
            }
        }

        let overdue: Vec<u64> = {
            let limit = core.params.confirm_timeout();
            let map = core.outbound_files.lock();
            map.iter()
                .filter(|(_, f)| f.completed_at.is_some_and(|at| at.elapsed() > limit))
                .map(|(&id, _)| id)
                .collect()
        };
        for object_id in overdue {
            if core.outbound_files.lock().remove(&object_id).is_none() {
                continue;
            }
            warn!(conn = core.id(), object_id, "no CONFIRM within the timeout");
            core.emit(ConnectionEvent::FileAborted {
                object_id,
                info: file_code::OUT_CONFIRM_TIMEOUT,
                text: None,
            })
            .await;
        }
    }
}

/// Samples bytes exchanged per minute against the idle threshold
async fn run_idle_monitor(core: Arc<ConnectionCore>) {
    let period = core.params.idle_check_period();
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // immediate first tick carries no sample
    loop {
        tick.tick().await;
        if core.is_terminated() {
            break;
        }
        let threshold = core.params.idle_threshold();
        if threshold == 0 {
            continue;
        }
        let bytes = core.window_bytes.swap(0, Ordering::Relaxed);
        let per_minute = bytes.saturating_mul(60) / period.as_secs().max(1);
        let idle = per_minute < threshold;
        if core.idle.swap(idle, Ordering::Relaxed) != idle {
            debug!(conn = core.id(), per_minute, idle, "idle state changed");
            core.emit(ConnectionEvent::IdleChanged { idle }).await;
        }
    }
}
