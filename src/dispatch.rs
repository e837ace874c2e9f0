//! # Receive Dispatcher Module
//!
//! One worker per connection reads parcels off the socket, classifies them
//! and routes them: signals to the connection's state machine, data parcels
//! to the aggregator registered for their object id. Aggregators are created
//! on header parcels for unseen ids and retired on completion or abort;
//! retired ids are remembered so a reuse attempt is detected for the rest of
//! the connection. The dispatcher never calls listeners directly, everything
//! user-visible goes through the event queue.

use crate::assembly::{AbsorbOutcome, ObjectAssembler};
use crate::codec;
use crate::connection::ConnectionCore;
use crate::error::{fail_reason, object_code, CloseCause};
use crate::events::ConnectionEvent;
use crate::files::{FileAssembler, FileProgress};
use crate::wire::{read_parcel, Channel, Parcel, Signal, WireError};
use std::sync::Arc;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, warn};

/// The per-connection receive worker
pub(crate) async fn run(core: Arc<ConnectionCore>, mut reader: OwnedReadHalf) {
    let max_payload = core.params().parcel_size();
    loop {
        if core.is_terminated() {
            break;
        }
        let outcome = tokio::select! {
            outcome = read_parcel(&mut reader, max_payload) => outcome,
            _ = core.wakeup().notified() => {
                // woken for termination or an interrupt; a dropped partial
                // read is recovered by the marker resync on the next frame
                continue;
            }
        };
        match outcome {
            Ok(parcel) => {
                core.note_bytes_received(parcel.wire_len() as u64);
                route(&core, parcel).await;
            }
            Err(WireError::Io(e)) => {
                if !core.is_terminated() {
                    debug!(conn = core.id(), "socket read ended: {}", e);
                    core.fail_connection(CloseCause::SocketError, format!("socket read: {}", e))
                        .await;
                }
                break;
            }
            Err(WireError::Protocol(message)) => {
                warn!(conn = core.id(), "unrecoverable protocol error: {}", message);
                core.fail_connection(CloseCause::Protocol, message).await;
                break;
            }
        }
    }
    debug!(conn = core.id(), "receive worker stopped");
}

async fn route(core: &Arc<ConnectionCore>, parcel: Parcel) {
    match parcel.channel {
        Channel::Signal => match Signal::from_parcel(&parcel) {
            Ok(signal) => core.clone().handle_signal(signal).await,
            Err(e) => {
                core.fail_connection(CloseCause::Protocol, e.to_string()).await;
            }
        },
        Channel::Object => route_object(core, parcel).await,
        Channel::File => route_file(core, parcel).await,
    }
}

async fn route_object(core: &Arc<ConnectionCore>, parcel: Parcel) {
    let object_id = parcel.object_id;

    let mut assembler = if parcel.sequence == 0 {
        if core.object_assemblers.lock().contains_key(&object_id)
            || core.retired_objects.lock().contains(&object_id)
        {
            warn!(conn = core.id(), object_id, "header parcel reuses a live or retired object id");
            core.push_signal(Signal::fail(
                object_id,
                fail_reason::ASSIGNMENT,
                Some("object id reuse".into()),
            ));
            return;
        }
        let Some(header) = parcel.header.as_ref() else {
            warn!(conn = core.id(), object_id, "first object parcel carries no header");
            core.retired_objects.lock().insert(object_id);
            core.push_signal(Signal::fail(
                object_id,
                fail_reason::ASSIGNMENT,
                Some("missing object header".into()),
            ));
            return;
        };
        match ObjectAssembler::new(
            object_id,
            parcel.priority,
            header,
            core.params().max_serialization_size(),
        ) {
            Ok(assembler) => assembler,
            Err(e) => {
                warn!(conn = core.id(), object_id, "object reception refused: {}", e);
                core.retired_objects.lock().insert(object_id);
                core.push_signal(Signal::fail(
                    object_id,
                    fail_reason::ASSIGNMENT,
                    Some(e.to_string()),
                ));
                return;
            }
        }
    } else {
        match core.object_assemblers.lock().remove(&object_id) {
            Some(assembler) => assembler,
            None => {
                if core.retired_objects.lock().contains(&object_id) {
                    debug!(conn = core.id(), object_id, "parcel for a settled object dropped");
                } else {
                    warn!(conn = core.id(), object_id, "continuation parcel for an unknown object");
                    core.retired_objects.lock().insert(object_id);
                    core.push_signal(Signal::fail(
                        object_id,
                        fail_reason::ASSIGNMENT,
                        Some("no aggregator for this object id".into()),
                    ));
                }
                return;
            }
        }
    };

    match assembler.absorb(&parcel) {
        Ok(AbsorbOutcome::More) => {
            if core.is_terminated() {
                return;
            }
            core.object_assemblers.lock().insert(object_id, assembler);
        }
        Ok(AbsorbOutcome::Done(payload)) => {
            core.retired_objects.lock().insert(object_id);
            complete_object(core, assembler, payload).await;
        }
        Err(e) => {
            warn!(conn = core.id(), object_id, "inbound object aborted: {}", e);
            core.retired_objects.lock().insert(object_id);
            core.push_signal(Signal::fail(
                object_id,
                fail_reason::ASSIGNMENT,
                Some(e.to_string()),
            ));
        }
    }
}

/// Split off the class code, run the sender's codec, deliver the value
async fn complete_object(core: &Arc<ConnectionCore>, assembler: ObjectAssembler, payload: Vec<u8>) {
    let object_id = assembler.object_id;
    if payload.len() < 2 {
        deserialization_failed(core, object_id, "payload below the class code prefix".into()).await;
        return;
    }
    let code = u16::from_be_bytes(payload[..2].try_into().unwrap());

    let decoder = match codec::resolve(assembler.method) {
        Ok(decoder) => decoder,
        Err(e) => {
            deserialization_failed(core, object_id, e.to_string()).await;
            return;
        }
    };
    let decoded = {
        let registry = codec::registry().read();
        decoder.decode(&registry, code, &payload[2..])
    };
    match decoded {
        Ok(value) => {
            core.emit(ConnectionEvent::ObjectReceived {
                priority: assembler.priority,
                object_id,
                value,
            })
            .await;
        }
        Err(e) => deserialization_failed(core, object_id, e.to_string()).await,
    }
}

async fn deserialization_failed(core: &Arc<ConnectionCore>, object_id: u64, detail: String) {
    warn!(conn = core.id(), object_id, "inbound object deserialization failed: {}", detail);
    core.push_signal(Signal::fail(
        object_id,
        fail_reason::DESERIALIZATION,
        Some(detail.clone()),
    ));
    core.emit(ConnectionEvent::ObjectAborted {
        object_id,
        info: object_code::REMOTE_DESERIALIZATION,
        text: Some(detail),
    })
    .await;
}

async fn route_file(core: &Arc<ConnectionCore>, parcel: Parcel) {
    let object_id = parcel.object_id;

    let mut assembler = if parcel.sequence == 0 {
        if core.file_assemblers.lock().contains_key(&object_id)
            || core.retired_files.lock().contains(&object_id)
        {
            warn!(conn = core.id(), object_id, "header parcel reuses a live or retired file id");
            core.push_signal(Signal::fail(
                object_id,
                fail_reason::ASSIGNMENT,
                Some("file id reuse".into()),
            ));
            return;
        }
        let Some(header) = parcel.header.as_ref() else {
            warn!(conn = core.id(), object_id, "first file parcel carries no header");
            core.retired_files.lock().insert(object_id);
            core.push_signal(Signal::fail(
                object_id,
                fail_reason::ASSIGNMENT,
                Some("missing file header".into()),
            ));
            return;
        };
        match FileAssembler::create(
            object_id,
            parcel.priority,
            header,
            core.params().file_root(),
            core.params().max_file_size(),
        ) {
            Ok(assembler) => assembler,
            Err(e) => {
                warn!(conn = core.id(), object_id, "file reception refused: {}", e);
                core.retired_files.lock().insert(object_id);
                core.push_signal(Signal::fail(
                    object_id,
                    e.fail_reason(),
                    Some(e.to_string()),
                ));
                core.emit(ConnectionEvent::FileAborted {
                    object_id,
                    info: e.local_code(),
                    text: Some(e.to_string()),
                })
                .await;
                return;
            }
        }
    } else {
        match core.file_assemblers.lock().remove(&object_id) {
            Some(assembler) => assembler,
            None => {
                if core.retired_files.lock().contains(&object_id) {
                    debug!(conn = core.id(), object_id, "parcel for a settled file dropped");
                } else {
                    warn!(conn = core.id(), object_id, "continuation parcel for an unknown file");
                    core.retired_files.lock().insert(object_id);
                    core.push_signal(Signal::fail(
                        object_id,
                        fail_reason::ASSIGNMENT,
                        Some("no aggregator for this file id".into()),
                    ));
                }
                return;
            }
        }
    };

    match assembler.absorb(&parcel) {
        Ok(FileProgress::More) => {
            if core.is_terminated() {
                assembler.abort();
                return;
            }
            core.file_assemblers.lock().insert(object_id, assembler);
        }
        Ok(FileProgress::Complete) => {
            core.retired_files.lock().insert(object_id);
            let priority = assembler.priority;
            match assembler.finish() {
                Ok((path, size)) => {
                    core.push_signal(Signal::confirm(object_id));
                    core.emit(ConnectionEvent::FileReceived {
                        object_id,
                        priority,
                        path,
                        size,
                    })
                    .await;
                }
                Err(e) => {
                    warn!(conn = core.id(), object_id, "file finalization failed: {}", e);
                    core.push_signal(Signal::fail(
                        object_id,
                        e.fail_reason(),
                        Some(e.to_string()),
                    ));
                    core.emit(ConnectionEvent::FileAborted {
                        object_id,
                        info: e.local_code(),
                        text: Some(e.to_string()),
                    })
                    .await;
                }
            }
        }
        Err(e) => {
            warn!(conn = core.id(), object_id, "inbound file aborted: {}", e);
            core.retired_files.lock().insert(object_id);
            let info = e.local_code();
            let reason = e.fail_reason();
            let text = e.to_string();
            assembler.abort();
            core.push_signal(Signal::fail(object_id, reason, Some(text.clone())));
            core.emit(ConnectionEvent::FileAborted {
                object_id,
                info,
                text: Some(text),
            })
            .await;
        }
    }
}
