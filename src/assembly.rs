//! # Object Aggregator Module
//!
//! Receive-side reassembly of one in-flight inbound object. Parcels must
//! arrive with strictly monotonic sequence numbers starting at 0; any gap or
//! overflow aborts the transfer. The assembled payload is handed back to the
//! dispatcher, which runs the codec and fires the delivery event.

use crate::error::TransportError;
use crate::wire::{ObjectHeader, Parcel, Priority};
use std::time::Instant;

/// Result of feeding one parcel to an assembler
#[derive(Debug)]
pub(crate) enum AbsorbOutcome {
    /// More parcels expected
    More,
    /// Transmission complete; the full payload
    Done(Vec<u8>),
}

/// Reassembles one inbound object transmission in memory
#[derive(Debug)]
pub(crate) struct ObjectAssembler {
    pub object_id: u64,
    pub priority: Priority,
    pub method: u8,
    expected_size: u64,
    expected_parcels: u32,
    next_seq: u32,
    buffer: Vec<u8>,
    #[allow(dead_code)]
    started: Instant,
}

impl ObjectAssembler {
    /// Set up for the transmission announced by a header parcel. The
    /// expected size is checked against the serialization ceiling before
    /// any buffer is grown.
    pub fn new(
        object_id: u64,
        priority: Priority,
        header: &ObjectHeader,
        max_size: u64,
    ) -> Result<Self, TransportError> {
        if header.expected_size > max_size {
            return Err(TransportError::Protocol(format!(
                "announced object size {} exceeds the {} byte ceiling",
                header.expected_size, max_size
            )));
        }
        if header.expected_parcels == 0 {
            return Err(TransportError::Protocol(
                "announced parcel count of zero".into(),
            ));
        }
        Ok(Self {
            object_id,
            priority,
            method: header.method,
            expected_size: header.expected_size,
            expected_parcels: header.expected_parcels,
            next_seq: 0,
            buffer: Vec::with_capacity(header.expected_size as usize),
            started: Instant::now(),
        })
    }

    pub fn absorb(&mut self, parcel: &Parcel) -> Result<AbsorbOutcome, TransportError> {
        if parcel.sequence != self.next_seq {
            return Err(TransportError::Protocol(format!(
                "object {} parcel out of sync: got sequence {}, expected {}",
                self.object_id, parcel.sequence, self.next_seq
            )));
        }
        if self.buffer.len() as u64 + parcel.payload.len() as u64 > self.expected_size {
            return Err(TransportError::Protocol(format!(
                "object {} payload overflows its announced size of {} bytes",
                self.object_id, self.expected_size
            )));
        }
        self.buffer.extend_from_slice(&parcel.payload);
        self.next_seq += 1;

        if self.next_seq == self.expected_parcels {
            if self.buffer.len() as u64 != self.expected_size {
                return Err(TransportError::Protocol(format!(
                    "object {} ended with {} bytes, header announced {}",
                    self.object_id,
                    self.buffer.len(),
                    self.expected_size
                )));
            }
            return Ok(AbsorbOutcome::Done(std::mem::take(&mut self.buffer)));
        }
        Ok(AbsorbOutcome::More)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Channel;

    fn header(size: u64, parcels: u32) -> ObjectHeader {
        ObjectHeader {
            method: 0,
            expected_size: size,
            expected_parcels: parcels,
            path: None,
            crc32: None,
        }
    }

    fn parcel(object_id: u64, sequence: u32, payload: Vec<u8>) -> Parcel {
        Parcel {
            channel: Channel::Object,
            priority: Priority::Normal,
            object_id,
            sequence,
            header: None,
            payload,
        }
    }

    #[test]
    fn reassembles_in_order_parcels() {
        let mut asm = ObjectAssembler::new(1, Priority::Normal, &header(6, 3), 1024).unwrap();
        assert!(matches!(
            asm.absorb(&parcel(1, 0, vec![1, 2])).unwrap(),
            AbsorbOutcome::More
        ));
        assert!(matches!(
            asm.absorb(&parcel(1, 1, vec![3, 4])).unwrap(),
            AbsorbOutcome::More
        ));
        match asm.absorb(&parcel(1, 2, vec![5, 6])).unwrap() {
            AbsorbOutcome::Done(payload) => assert_eq!(payload, vec![1, 2, 3, 4, 5, 6]),
            AbsorbOutcome::More => panic!("expected completion"),
        }
    }

    #[test]
    fn sequence_gap_aborts() {
        let mut asm = ObjectAssembler::new(1, Priority::Normal, &header(6, 3), 1024).unwrap();
        asm.absorb(&parcel(1, 0, vec![1, 2])).unwrap();
        let err = asm.absorb(&parcel(1, 2, vec![5, 6])).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn oversized_announcement_is_rejected() {
        let err = ObjectAssembler::new(1, Priority::Normal, &header(2048, 1), 1024).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn payload_overflow_aborts() {
        let mut asm = ObjectAssembler::new(1, Priority::Normal, &header(3, 2), 1024).unwrap();
        asm.absorb(&parcel(1, 0, vec![1, 2])).unwrap();
        let err = asm.absorb(&parcel(1, 1, vec![3, 4])).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn short_final_payload_aborts() {
        let mut asm = ObjectAssembler::new(1, Priority::Normal, &header(10, 2), 1024).unwrap();
        asm.absorb(&parcel(1, 0, vec![1, 2])).unwrap();
        let err = asm.absorb(&parcel(1, 1, vec![3, 4])).unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }
}
