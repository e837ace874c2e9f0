//! # Send Scheduler Module
//!
//! Outbound traffic runs through a two-stage pipeline driven by one worker
//! task per connection. Stage A turns send orders into parcel sequences:
//! objects are serialized in one shot through the configured codec, files are
//! streamed from disk chunk by chunk. Stage B drains the ordered parcel
//! queue to the socket under the TEMPO rate cap. The worker alternates
//! between the stages on a small time budget so serialization and
//! transmission stay interleaved, and it suspends only when there is neither
//! an order to serialize nor a parcel to write.
//!
//! The parcel queue is a min-heap on the key
//! `(channel rank, priority rank, object id, sequence)`, so signals preempt
//! objects, objects preempt files, higher priorities preempt lower ones, and
//! parcels of one object always leave in order with the header parcel first.
//! Signals bypass both the input queue and the capacity bound.

use crate::codec::{self, AnyValue};
use crate::connection::ConnectionCore;
use crate::defaults;
use crate::error::{object_code, CloseCause, TransportError};
use crate::wire::{write_parcel, Channel, ObjectHeader, Parcel, Priority, SignalKind};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::{debug, error, trace, warn};

/// What a user thread hands to the scheduler
pub(crate) enum OrderKind {
    Object { value: AnyValue, code: u16 },
    File { source: PathBuf, destination: String },
}

pub(crate) struct SendOrder {
    pub object_id: u64,
    pub priority: Priority,
    pub kind: OrderKind,
}

struct QueuedParcel {
    parcel: Parcel,
}

impl QueuedParcel {
    fn key(&self) -> (u8, u8, u64, u32) {
        (
            self.parcel.channel.rank(),
            self.parcel.priority.rank(),
            self.parcel.object_id,
            self.parcel.sequence,
        )
    }
}

impl PartialEq for QueuedParcel {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedParcel {}

impl Ord for QueuedParcel {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for QueuedParcel {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The ordered outgoing parcel queue. Data parcels respect the capacity
/// bound; signal parcels do not.
pub(crate) struct ParcelQueue {
    heap: Mutex<BinaryHeap<Reverse<QueuedParcel>>>,
    capacity: usize,
    /// Wakes the send worker when a parcel arrives
    ready: Notify,
}

impl ParcelQueue {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity,
            ready: Notify::new(),
        })
    }

    pub fn push_signal(&self, parcel: Parcel) {
        debug_assert_eq!(parcel.channel, Channel::Signal);
        self.heap.lock().push(Reverse(QueuedParcel { parcel }));
        self.ready.notify_one();
    }

    /// True while a data parcel may be pushed. Only the send worker pushes
    /// data parcels, so the answer stays valid until it pushes.
    pub fn has_data_space(&self) -> bool {
        self.heap.lock().len() < self.capacity
    }

    fn push_data(&self, parcel: Parcel) {
        self.heap.lock().push(Reverse(QueuedParcel { parcel }));
        self.ready.notify_one();
    }

    pub fn pop(&self) -> Option<Parcel> {
        self.heap.lock().pop().map(|Reverse(q)| q.parcel)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    /// Drop every queued parcel of one transmission; used for BREAK
    pub fn purge(&self, channel: Channel, object_id: u64) -> usize {
        let mut heap = self.heap.lock();
        let before = heap.len();
        let kept: BinaryHeap<Reverse<QueuedParcel>> = heap
            .drain()
            .filter(|Reverse(q)| {
                q.parcel.channel != channel || q.parcel.object_id != object_id
            })
            .collect();
        *heap = kept;
        before - heap.len()
    }

    pub fn ready(&self) -> &Notify {
        &self.ready
    }
}

/// Long-run rate limiter for stage B
struct TempoGate {
    rate: i64,
    window_start: Instant,
    sent: u64,
}

impl TempoGate {
    fn new() -> Self {
        Self {
            rate: -1,
            window_start: Instant::now(),
            sent: 0,
        }
    }

    /// Sleep so the cumulative byte rate stays at or below `rate`, then
    /// account for the parcel about to be written.
    async fn pace(&mut self, rate: i64, next_len: usize) {
        if rate != self.rate {
            self.rate = rate;
            self.window_start = Instant::now();
            self.sent = 0;
        }
        if self.rate <= 0 {
            return;
        }
        let required = Duration::from_secs_f64(self.sent as f64 / self.rate as f64);
        let elapsed = self.window_start.elapsed();
        if required > elapsed {
            tokio::time::sleep(required - elapsed).await;
        }
        self.sent += next_len as u64;
    }
}

/// An in-progress outbound transmission being cut into parcels
enum OutboundStream {
    Object {
        object_id: u64,
        priority: Priority,
        buffer: Vec<u8>,
        pos: usize,
        next_seq: u32,
        expected_parcels: u32,
    },
    File {
        object_id: u64,
        priority: Priority,
        file: tokio::fs::File,
        destination: String,
        total: u64,
        remaining: u64,
        crc32: u32,
        next_seq: u32,
        expected_parcels: u32,
    },
}

impl OutboundStream {
    fn channel(&self) -> Channel {
        match self {
            Self::Object { .. } => Channel::Object,
            Self::File { .. } => Channel::File,
        }
    }

    fn object_id(&self) -> u64 {
        match self {
            Self::Object { object_id, .. } | Self::File { object_id, .. } => *object_id,
        }
    }

    /// Produce the next parcel, or `None` when the transmission is complete
    async fn next_parcel(&mut self, parcel_size: usize) -> Result<Option<Parcel>, TransportError> {
        match self {
            Self::Object {
                object_id,
                priority,
                buffer,
                pos,
                next_seq,
                expected_parcels,
            } => {
                if *next_seq >= *expected_parcels {
                    return Ok(None);
                }
                let chunk_end = (*pos + parcel_size).min(buffer.len());
                let payload = buffer[*pos..chunk_end].to_vec();
                let header = (*next_seq == 0).then(|| ObjectHeader {
                    method: 0,
                    expected_size: buffer.len() as u64,
                    expected_parcels: *expected_parcels,
                    path: None,
                    crc32: None,
                });
                let parcel = Parcel {
                    channel: Channel::Object,
                    priority: *priority,
                    object_id: *object_id,
                    sequence: *next_seq,
                    header,
                    payload,
                };
                *pos = chunk_end;
                *next_seq += 1;
                Ok(Some(parcel))
            }
            Self::File {
                object_id,
                priority,
                file,
                destination,
                total,
                remaining,
                crc32,
                next_seq,
                expected_parcels,
            } => {
                if *next_seq >= *expected_parcels {
                    return Ok(None);
                }
                let chunk = (*remaining).min(parcel_size as u64) as usize;
                let mut payload = vec![0u8; chunk];
                file.read_exact(&mut payload).await?;
                *remaining -= chunk as u64;
                let header = (*next_seq == 0).then(|| ObjectHeader {
                    method: 0,
                    expected_size: *total,
                    expected_parcels: *expected_parcels,
                    path: Some(destination.clone()),
                    crc32: Some(*crc32),
                });
                let parcel = Parcel {
                    channel: Channel::File,
                    priority: *priority,
                    object_id: *object_id,
                    sequence: *next_seq,
                    header,
                    payload,
                };
                *next_seq += 1;
                Ok(Some(parcel))
            }
        }
    }
}

fn parcel_count(total: u64, parcel_size: usize) -> u32 {
    if total == 0 {
        1
    } else {
        total.div_ceil(parcel_size as u64) as u32
    }
}

/// The per-connection send worker: stage B drains the parcel queue under the
/// TEMPO cap, stage A refills it from the order queue.
pub(crate) async fn run(
    core: Arc<ConnectionCore>,
    mut writer: OwnedWriteHalf,
    mut orders: mpsc::Receiver<SendOrder>,
) {
    let queue = core.parcel_queue().clone();
    let parcel_size = core.params().parcel_size();
    let mut gate = TempoGate::new();
    let mut current: Option<OutboundStream> = None;

    'worker: loop {
        if core.is_terminated() {
            break;
        }

        // Stage B: transmit within the iteration budget
        let entered = Instant::now();
        while entered.elapsed() < defaults::TRANSMIT_BUDGET {
            let Some(parcel) = queue.pop() else { break };
            gate.pace(core.send_tempo(), parcel.wire_len()).await;
            if core.is_terminated() {
                break 'worker;
            }
            let all_sent_marker = parcel.channel == Channel::Signal
                && (parcel.sequence & 0xFFFF) as u16 == SignalKind::Closed as u16;
            if let Err(e) = write_parcel(&mut writer, &parcel).await {
                error!(conn = core.id(), "socket write failed: {}", e);
                core.fail_connection(CloseCause::SocketError, format!("socket write: {}", e))
                    .await;
                break 'worker;
            }
            trace!(
                conn = core.id(),
                channel = ?parcel.channel,
                object_id = parcel.object_id,
                sequence = parcel.sequence,
                "parcel written"
            );
            core.note_bytes_sent(parcel.wire_len() as u64);
            if all_sent_marker {
                core.note_all_sent_written().await;
            }
        }

        // Stage A: produce parcels
        if let Some(mut stream) = current.take() {
            if core.is_outbound_cancelled(stream.channel(), stream.object_id()) {
                debug!(
                    conn = core.id(),
                    object_id = stream.object_id(),
                    "outbound transmission cancelled, dropping stream"
                );
                continue;
            }
            let mut settled = false;
            while queue.has_data_space() {
                match stream.next_parcel(parcel_size).await {
                    Ok(Some(parcel)) => queue.push_data(parcel),
                    Ok(None) => {
                        if stream.channel() == Channel::File {
                            core.note_file_fully_queued(stream.object_id());
                        }
                        settled = true;
                        break;
                    }
                    Err(e) => {
                        core.note_stream_failed(stream.channel(), stream.object_id(), &e)
                            .await;
                        settled = true;
                        break;
                    }
                }
            }
            if !settled {
                current = Some(stream);
            }
            continue;
        }

        match orders.try_recv() {
            Ok(order) => {
                current = open_stream(&core, order, parcel_size).await;
            }
            Err(mpsc::error::TryRecvError::Empty) => {
                if queue.is_empty() {
                    core.on_send_side_drained().await;
                    if core.is_terminated() {
                        break;
                    }
                    tokio::select! {
                        next = orders.recv() => {
                            if let Some(order) = next {
                                current = open_stream(&core, order, parcel_size).await;
                            }
                        }
                        _ = queue.ready().notified() => {}
                        _ = core.wakeup().notified() => {}
                    }
                }
            }
            Err(mpsc::error::TryRecvError::Disconnected) => {
                if queue.is_empty() {
                    core.on_send_side_drained().await;
                    if core.is_terminated() {
                        break;
                    }
                    tokio::select! {
                        _ = queue.ready().notified() => {}
                        _ = core.wakeup().notified() => {}
                    }
                }
            }
        }
    }

    // remaining parcels are dropped once the terminal flag is observed
    let _ = writer.shutdown().await;
    debug!(conn = core.id(), "send worker stopped");
}

/// Start a new outbound stream from a send order. Objects are serialized
/// here, in the worker, never on the caller's thread.
async fn open_stream(
    core: &Arc<ConnectionCore>,
    order: SendOrder,
    parcel_size: usize,
) -> Option<OutboundStream> {
    match order.kind {
        OrderKind::Object { value, code } => {
            let encoded = {
                let registry = codec::registry().read();
                core.codec().encode(&registry, code, value.as_ref())
            };
            let encoded = match encoded {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(conn = core.id(), object_id = order.object_id, "serialization failed: {}", e);
                    core.emit_object_aborted(
                        order.object_id,
                        object_code::LOCAL_ERROR,
                        Some(e.to_string()),
                    )
                    .await;
                    core.fail_connection(
                        CloseCause::SerializationFailure,
                        format!("object {} serialization: {}", order.object_id, e),
                    )
                    .await;
                    return None;
                }
            };

            let mut buffer = Vec::with_capacity(2 + encoded.len());
            buffer.extend_from_slice(&code.to_be_bytes());
            buffer.extend_from_slice(&encoded);

            let max = core.params().max_serialization_size();
            if buffer.len() as u64 > max {
                warn!(
                    conn = core.id(),
                    object_id = order.object_id,
                    size = buffer.len(),
                    "serialized object exceeds the configured ceiling, dropping"
                );
                core.emit_object_aborted(
                    order.object_id,
                    object_code::LOCAL_ERROR,
                    Some(format!("serialized size {} exceeds limit {}", buffer.len(), max)),
                )
                .await;
                return None;
            }

            let expected_parcels = parcel_count(buffer.len() as u64, parcel_size);
            Some(OutboundStream::Object {
                object_id: order.object_id,
                priority: order.priority,
                buffer,
                pos: 0,
                next_seq: 0,
                expected_parcels,
            })
        }
        OrderKind::File {
            source,
            destination,
        } => match open_file_stream(order.object_id, order.priority, source, destination, parcel_size).await
        {
            Ok(stream) => Some(stream),
            Err(e) => {
                core.note_stream_failed(Channel::File, order.object_id, &e).await;
                None
            }
        },
    }
}

/// Open the source, pre-compute the payload CRC-32 for the header, and
/// rewind for the chunking pass.
async fn open_file_stream(
    object_id: u64,
    priority: Priority,
    source: PathBuf,
    destination: String,
    parcel_size: usize,
) -> Result<OutboundStream, TransportError> {
    use tokio::io::AsyncSeekExt;

    let mut file = tokio::fs::File::open(&source).await?;
    let total = file.metadata().await?.len();

    let mut hasher = crc32fast::Hasher::new();
    let mut scan = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut scan).await?;
        if n == 0 {
            break;
        }
        hasher.update(&scan[..n]);
    }
    let crc32 = hasher.finalize();
    file.seek(std::io::SeekFrom::Start(0)).await?;

    Ok(OutboundStream::File {
        object_id,
        priority,
        file,
        destination,
        total,
        remaining: total,
        crc32,
        next_seq: 0,
        expected_parcels: parcel_count(total, parcel_size),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Signal;

    fn data_parcel(channel: Channel, priority: Priority, object_id: u64, sequence: u32) -> Parcel {
        Parcel {
            channel,
            priority,
            object_id,
            sequence,
            header: None,
            payload: vec![],
        }
    }

    #[test]
    fn queue_orders_by_channel_priority_id_sequence() {
        let queue = ParcelQueue::new(100);
        queue.push_data(data_parcel(Channel::File, Priority::Normal, 5, 0));
        queue.push_data(data_parcel(Channel::File, Priority::Normal, 5, 1));
        queue.push_data(data_parcel(Channel::Object, Priority::Bottom, 9, 0));
        queue.push_data(data_parcel(Channel::Object, Priority::Top, 8, 0));
        queue.push_signal(Signal::alive().into_parcel());
        queue.push_data(data_parcel(Channel::File, Priority::Top, 6, 0));

        let order: Vec<(Channel, u64, u32)> = std::iter::from_fn(|| queue.pop())
            .map(|p| (p.channel, p.object_id, p.sequence))
            .collect();
        assert_eq!(
            order,
            vec![
                (Channel::Signal, 0, SignalKind::Alive as u32),
                (Channel::Object, 8, 0),
                (Channel::Object, 9, 0),
                (Channel::File, 6, 0),
                (Channel::File, 5, 0),
                (Channel::File, 5, 1),
            ]
        );
    }

    #[test]
    fn same_class_objects_drain_in_send_order() {
        let queue = ParcelQueue::new(100);
        queue.push_data(data_parcel(Channel::Object, Priority::Normal, 2, 0));
        queue.push_data(data_parcel(Channel::Object, Priority::Normal, 1, 0));
        queue.push_data(data_parcel(Channel::Object, Priority::Normal, 1, 1));
        queue.push_data(data_parcel(Channel::Object, Priority::Normal, 2, 1));

        let ids: Vec<(u64, u32)> = std::iter::from_fn(|| queue.pop())
            .map(|p| (p.object_id, p.sequence))
            .collect();
        assert_eq!(ids, vec![(1, 0), (1, 1), (2, 0), (2, 1)]);
    }

    #[test]
    fn capacity_gates_data_but_not_signals() {
        let queue = ParcelQueue::new(2);
        assert!(queue.has_data_space());
        queue.push_data(data_parcel(Channel::Object, Priority::Normal, 1, 0));
        queue.push_data(data_parcel(Channel::Object, Priority::Normal, 1, 1));
        assert!(!queue.has_data_space());
        queue.push_signal(Signal::alive().into_parcel());
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn purge_removes_one_transmission_only() {
        let queue = ParcelQueue::new(100);
        queue.push_data(data_parcel(Channel::File, Priority::Normal, 1, 0));
        queue.push_data(data_parcel(Channel::File, Priority::Normal, 1, 1));
        queue.push_data(data_parcel(Channel::File, Priority::Normal, 2, 0));
        queue.push_data(data_parcel(Channel::Object, Priority::Normal, 1, 0));

        assert_eq!(queue.purge(Channel::File, 1), 2);
        let left: Vec<(Channel, u64)> = std::iter::from_fn(|| queue.pop())
            .map(|p| (p.channel, p.object_id))
            .collect();
        assert_eq!(left, vec![(Channel::Object, 1), (Channel::File, 2)]);
    }

    #[tokio::test]
    async fn object_stream_cuts_header_then_chunks() {
        let mut stream = OutboundStream::Object {
            object_id: 3,
            priority: Priority::Normal,
            buffer: vec![7u8; 2500],
            pos: 0,
            next_seq: 0,
            expected_parcels: parcel_count(2500, 1024),
        };

        let first = stream.next_parcel(1024).await.unwrap().unwrap();
        assert_eq!(first.sequence, 0);
        let header = first.header.unwrap();
        assert_eq!(header.expected_size, 2500);
        assert_eq!(header.expected_parcels, 3);
        assert_eq!(first.payload.len(), 1024);

        let second = stream.next_parcel(1024).await.unwrap().unwrap();
        assert!(second.header.is_none());
        assert_eq!(second.payload.len(), 1024);

        let third = stream.next_parcel(1024).await.unwrap().unwrap();
        assert_eq!(third.payload.len(), 452);
        assert!(stream.next_parcel(1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_stream_carries_path_and_crc() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("payload.bin");
        let content = vec![0x5Au8; 3000];
        std::fs::write(&source, &content).unwrap();
        let expected_crc = crc32fast::hash(&content);

        let mut stream =
            open_file_stream(11, Priority::Low, source, "in/payload.bin".into(), 1024)
                .await
                .unwrap();

        let first = stream.next_parcel(1024).await.unwrap().unwrap();
        let header = first.header.clone().unwrap();
        assert_eq!(header.expected_size, 3000);
        assert_eq!(header.expected_parcels, 3);
        assert_eq!(header.path.as_deref(), Some("in/payload.bin"));
        assert_eq!(header.crc32, Some(expected_crc));

        let mut collected = first.payload.clone();
        while let Some(parcel) = stream.next_parcel(1024).await.unwrap() {
            collected.extend_from_slice(&parcel.payload);
        }
        assert_eq!(collected, content);
    }

    #[tokio::test]
    async fn empty_file_still_produces_a_header_parcel() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("empty.bin");
        std::fs::write(&source, b"").unwrap();

        let mut stream =
            open_file_stream(12, Priority::Normal, source, "in/empty.bin".into(), 1024)
                .await
                .unwrap();
        let first = stream.next_parcel(1024).await.unwrap().unwrap();
        assert_eq!(first.header.unwrap().expected_parcels, 1);
        assert!(first.payload.is_empty());
        assert!(stream.next_parcel(1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tempo_gate_spaces_writes_to_the_cap() {
        let mut gate = TempoGate::new();
        let start = Instant::now();
        // 5 writes of 1000 bytes at 10_000 bytes/s: the last write waits
        // until 4000 bytes of budget have elapsed, i.e. 400 ms.
        for _ in 0..5 {
            gate.pace(10_000, 1000).await;
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(380), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(900), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn uncapped_tempo_never_sleeps() {
        let mut gate = TempoGate::new();
        let start = Instant::now();
        for _ in 0..100 {
            gate.pace(-1, 64 * 1024).await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
