//! The bidirectional transport bundle: one shared region hosting the input
//! and output rings, plus the two wake signals. The opener (the daemon)
//! allocates it; the peer reconstructs it from the descriptor. Roles are
//! fixed by convention: the client writes the input ring and reads the
//! output ring, the daemon does the opposite.

use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use fxd_protocol::types::{DescriptorFlags, TransportDescriptor};

use crate::event::{EventError, EventFd};
use crate::ring::{Consumer, Producer, RingError, RingHeader, HEADER_SIZE};
use crate::shm::{ShmError, ShmHandle, ShmMapping};

/// Refuse to map absurd regions from a misbehaving peer.
const MAX_REGION_SIZE: u64 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("shared memory: {0}")]
    Shm(#[from] ShmError),
    #[error("event signal: {0}")]
    Event(#[from] EventError),
    #[error("ring: {0}")]
    Ring(#[from] RingError),
    #[error("descriptor does not describe a usable region")]
    Layout,
}

pub struct TransportPair {
    map: ShmMapping,
    shm: ShmHandle,
    descriptor: TransportDescriptor,
    pub event_in: EventFd,
    pub event_out: EventFd,
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) / align * align
}

impl TransportPair {
    /// Allocates the region, initializes both ring headers and creates the
    /// two event signals. Called by the daemon at session open.
    pub fn allocate(
        input_capacity: u32,
        output_capacity: u32,
    ) -> Result<TransportPair, TransportError> {
        static SEQ: AtomicU32 = AtomicU32::new(0);

        let input_offset = 0u64;
        let output_offset = align_up(
            HEADER_SIZE as u64 + input_capacity as u64,
            HEADER_SIZE as u64,
        );
        let region_size = output_offset + HEADER_SIZE as u64 + output_capacity as u64;

        let name = format!("fxd-ring-{}", SEQ.fetch_add(1, Ordering::Relaxed));
        let shm = ShmHandle::create(&name, region_size as usize)?;
        let map = shm.map()?;

        unsafe {
            RingHeader::init(
                map.as_ptr().add(input_offset as usize) as *mut RingHeader,
                input_capacity,
            )?;
            RingHeader::init(
                map.as_ptr().add(output_offset as usize) as *mut RingHeader,
                output_capacity,
            )?;
        }

        let descriptor = TransportDescriptor {
            region_size,
            input_ring_offset: input_offset,
            output_ring_offset: output_offset,
            input_ring_capacity: input_capacity,
            output_ring_capacity: output_capacity,
            flags: DescriptorFlags::SYNCHRONIZED,
            padding: 0,
        };

        Ok(TransportPair {
            map,
            shm,
            descriptor,
            event_in: EventFd::new()?,
            event_out: EventFd::new()?,
        })
    }

    /// Reconstructs the transport from a received descriptor and the fds
    /// that rode alongside it.
    pub fn from_descriptor(
        descriptor: TransportDescriptor,
        shm_fd: OwnedFd,
        event_in: OwnedFd,
        event_out: OwnedFd,
    ) -> Result<TransportPair, TransportError> {
        if descriptor.region_size == 0 || descriptor.region_size > MAX_REGION_SIZE {
            return Err(TransportError::Layout);
        }

        for (offset, capacity) in [
            (descriptor.input_ring_offset, descriptor.input_ring_capacity),
            (descriptor.output_ring_offset, descriptor.output_ring_capacity),
        ] {
            if capacity == 0 {
                return Err(TransportError::Layout);
            }
            if offset % HEADER_SIZE as u64 != 0 {
                return Err(TransportError::Layout);
            }
            let end = offset
                .checked_add(HEADER_SIZE as u64)
                .and_then(|end| end.checked_add(capacity as u64))
                .ok_or(TransportError::Layout)?;
            if end > descriptor.region_size {
                return Err(TransportError::Layout);
            }
        }

        let shm = ShmHandle::from_fd(shm_fd, descriptor.region_size as usize);
        let map = shm.map()?;

        let pair = TransportPair {
            map,
            shm,
            descriptor,
            event_in: EventFd::from(event_in),
            event_out: EventFd::from(event_out),
        };

        // the mapped headers are authoritative; cross-check the descriptor
        for (header, capacity) in [
            (pair.input_header(), descriptor.input_ring_capacity),
            (pair.output_header(), descriptor.output_ring_capacity),
        ] {
            if header.capacity() != capacity {
                return Err(TransportError::Ring(RingError::CapacityMismatch {
                    header: header.capacity(),
                    descriptor: capacity,
                }));
            }
        }

        Ok(pair)
    }

    pub fn descriptor(&self) -> TransportDescriptor {
        self.descriptor
    }

    /// Fds to transfer with the descriptor, in wire order.
    pub fn fds(&self) -> [RawFd; 3] {
        [
            self.shm.as_fd().as_raw_fd(),
            self.event_in.as_raw_fd(),
            self.event_out.as_raw_fd(),
        ]
    }

    fn ring(&self, offset: u64) -> (&RingHeader, *mut u8) {
        unsafe {
            let base = self.map.as_ptr().add(offset as usize);
            (&*(base as *const RingHeader), base.add(HEADER_SIZE))
        }
    }

    fn input_header(&self) -> &RingHeader {
        self.ring(self.descriptor.input_ring_offset).0
    }

    fn output_header(&self) -> &RingHeader {
        self.ring(self.descriptor.output_ring_offset).0
    }

    /// Client-side write endpoint. Only the client may use this.
    pub fn input_producer(&self) -> Producer<'_> {
        let (header, data) = self.ring(self.descriptor.input_ring_offset);
        unsafe { Producer::from_raw(header, data) }
    }

    /// Daemon-side read endpoint. Only the daemon may use this.
    pub fn input_consumer(&self) -> Consumer<'_> {
        let (header, data) = self.ring(self.descriptor.input_ring_offset);
        unsafe { Consumer::from_raw(header, data) }
    }

    /// Daemon-side write endpoint. Only the daemon may use this.
    pub fn output_producer(&self) -> Producer<'_> {
        let (header, data) = self.ring(self.descriptor.output_ring_offset);
        unsafe { Producer::from_raw(header, data) }
    }

    /// Client-side read endpoint. Only the client may use this.
    pub fn output_consumer(&self) -> Consumer<'_> {
        let (header, data) = self.ring(self.descriptor.output_ring_offset);
        unsafe { Consumer::from_raw(header, data) }
    }

    /// Discards anything buffered in either direction. Only legal while no
    /// endpoint is in use, i.e. before the worker starts.
    pub fn reset(&self) {
        self.input_header().reset();
        self.output_header().reset();
    }
}
