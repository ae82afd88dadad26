//! # Fenced Ring Buffer
//!
//! One host-visible buffer split into N equal rungs, each paired with a
//! [`Fence`]. The CPU fills one rung while the GPU still consumes older ones.
//!
//! ## Protocol
//! 1. `begin_write` moves to the next rung and spins until that rung's fence is
//!    raised, i.e. the GPU has finished with whatever was last written there.
//! 2. `write` bump-allocates 4-byte aligned ranges inside the rung.
//! 3. `flush` makes the bytes written so far visible to the device.
//! 4. `end_write` flushes the rest and places the rung's fence.
//!
//! CPU writes to a rung happen before its fence is placed, and the fence is
//! raised only after the GPU is done reading, so the CPU never touches bytes
//! the GPU may still read. With a single rung the CPU and GPU simply take
//! turns.
//!
//! The spin-wait is bounded; expiry is reported as `FenceTimeout` and treated
//! as a lost device by callers.

use std::time::Duration;

use log::{error, trace};
use web_time::Instant;

use crate::core::StResource;
use crate::error::{Result, StreamingError};

use super::{BufferHandle, DeletionQueue, Fence, GpuDevice, MappedRegion, RetiredResource};

const WRITE_ALIGNMENT: u64 = 4;

/// The rung handed out by [`FencedRingBuffer::begin_write`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RungLease {
    /// Index of the writable rung.
    pub rung: usize,
    /// Epoch passed to `end_write` the last time this rung was written, if any.
    /// Its fence has now been raised, so all GPU work of that epoch is done.
    pub completed_epoch: Option<u64>,
}

/// Multi-buffered, fence-guarded host-visible memory.
pub struct FencedRingBuffer {
    buffer: BufferHandle,
    region: MappedRegion,
    rung_size: u64,
    fences: Vec<Fence>,
    rung_epochs: Vec<Option<u64>>,
    current_rung: usize,
    write_cursor: u64,
    flushed_cursor: u64,
    writing: bool,
    fence_timeout: Duration,
    retire_to: StResource<DeletionQueue>,
}

impl FencedRingBuffer {
    /// Allocates `rung_count * rung_size` bytes of mapped memory and one fence per rung.
    ///
    /// # Arguments
    /// * `device` - Device to allocate from
    /// * `retire_to` - Deletion ring receiving the buffer and fences on drop
    /// * `label` - Debug label of the buffer
    /// * `rung_count` - Number of rungs N, at least 1
    /// * `rung_size` - Bytes per rung, a multiple of 4
    /// * `fence_timeout` - Upper bound on the wait in `begin_write`
    pub fn new<D: GpuDevice + ?Sized>(
        device: &mut D,
        retire_to: StResource<DeletionQueue>,
        label: &str,
        rung_count: usize,
        rung_size: u64,
        fence_timeout: Duration,
    ) -> Result<Self> {
        if rung_count == 0 || rung_size == 0 || rung_size % WRITE_ALIGNMENT != 0 {
            return Err(StreamingError::InvalidConfig(format!(
                "ring '{label}' needs at least one rung of a non-zero multiple of 4 bytes"
            )));
        }
        let (buffer, region) =
            device.allocate_mapped_buffer(label, rung_size * rung_count as u64)?;
        let fences = (0..rung_count)
            .map(|_| Fence::new(device, retire_to.clone()))
            .collect();

        Ok(Self {
            buffer,
            region,
            rung_size,
            fences,
            rung_epochs: vec![None; rung_count],
            current_rung: rung_count - 1,
            write_cursor: 0,
            flushed_cursor: 0,
            writing: false,
            fence_timeout,
            retire_to,
        })
    }

    /// Advances to the next rung and waits for the GPU to release it.
    ///
    /// The previous window must not be used after this call.
    ///
    /// # Returns
    /// - `Ok(lease)` once the rung is safe to write
    /// - `Err(FenceTimeout)` if its fence stays down past the timeout; the
    ///   current rung is left unchanged
    pub fn begin_write<D: GpuDevice + ?Sized>(&mut self, device: &mut D) -> Result<RungLease> {
        if self.writing {
            return Err(StreamingError::FrameState(
                "begin_write called twice without end_write",
            ));
        }
        let next = (self.current_rung + 1) % self.fences.len();

        let start = Instant::now();
        while !self.fences[next].raised(device) {
            let waited = start.elapsed();
            if waited >= self.fence_timeout {
                error!("Fence on rung {next} still pending after {waited:?}");
                return Err(StreamingError::FenceTimeout { rung: next, waited });
            }
            std::hint::spin_loop();
        }

        self.current_rung = next;
        self.write_cursor = 0;
        self.flushed_cursor = 0;
        self.writing = true;
        trace!("Acquired staging rung {next} after {:?}", start.elapsed());

        Ok(RungLease {
            rung: next,
            completed_epoch: self.rung_epochs[next],
        })
    }

    /// Copies `bytes` into the current rung at the next aligned position.
    ///
    /// # Returns
    /// - `Ok(offset)` of the data from the start of the whole buffer
    /// - `Err(StagingExhausted)` if the rung cannot hold it; nothing is written
    pub fn write(&mut self, bytes: &[u8]) -> Result<u64> {
        if !self.writing {
            return Err(StreamingError::FrameState("write outside begin_write/end_write"));
        }
        let requested = (bytes.len() as u64).next_multiple_of(WRITE_ALIGNMENT);
        let available = self.remaining();
        if requested > available {
            return Err(StreamingError::StagingExhausted {
                requested,
                available,
            });
        }

        let offset = self.rung_base() + self.write_cursor;
        let start = offset as usize;
        self.region.as_mut_slice()[start..start + bytes.len()].copy_from_slice(bytes);
        self.write_cursor += requested;
        Ok(offset)
    }

    /// Makes everything written since the last flush visible to the device.
    pub fn flush<D: GpuDevice + ?Sized>(&mut self, device: &mut D) {
        let length = self.write_cursor - self.flushed_cursor;
        if length == 0 {
            return;
        }
        device.flush_written_range(
            self.buffer,
            &self.region,
            self.rung_base() + self.flushed_cursor,
            length,
        );
        self.flushed_cursor = self.write_cursor;
    }

    /// Flushes the rest of the rung and places its fence.
    ///
    /// # Arguments
    /// * `device` - Device the fence is placed on
    /// * `epoch` - Caller tag reported back by the `begin_write` that next
    ///   acquires this rung
    pub fn end_write<D: GpuDevice + ?Sized>(&mut self, device: &mut D, epoch: u64) -> Result<()> {
        if !self.writing {
            return Err(StreamingError::FrameState("end_write without begin_write"));
        }
        self.flush(device);
        self.fences[self.current_rung].place(device);
        self.rung_epochs[self.current_rung] = Some(epoch);
        self.writing = false;
        Ok(())
    }

    /// Spins until every rung's fence is raised, bounded by the fence timeout.
    ///
    /// Used at shutdown: once it returns `Ok`, the GPU no longer reads any
    /// resource retired before the last `end_write`.
    pub fn wait_idle<D: GpuDevice + ?Sized>(&self, device: &mut D) -> Result<()> {
        let start = Instant::now();
        for (rung, fence) in self.fences.iter().enumerate() {
            while !fence.raised(device) {
                let waited = start.elapsed();
                if waited >= self.fence_timeout {
                    return Err(StreamingError::FenceTimeout { rung, waited });
                }
                std::hint::spin_loop();
            }
        }
        Ok(())
    }

    /// Writable bytes of the current rung, starting at the write cursor.
    ///
    /// Data placed here directly must be committed with [`Self::commit`].
    pub fn window_mut(&mut self) -> &mut [u8] {
        let start = (self.rung_base() + self.write_cursor) as usize;
        let end = (self.rung_base() + self.rung_size) as usize;
        &mut self.region.as_mut_slice()[start..end]
    }

    /// Advances the write cursor over `length` bytes filled through [`Self::window_mut`].
    pub fn commit(&mut self, length: u64) -> Result<u64> {
        let requested = length.next_multiple_of(WRITE_ALIGNMENT);
        let available = self.remaining();
        if requested > available {
            return Err(StreamingError::StagingExhausted {
                requested,
                available,
            });
        }
        let offset = self.rung_base() + self.write_cursor;
        self.write_cursor += requested;
        Ok(offset)
    }

    /// Bytes still free in the current rung.
    pub fn remaining(&self) -> u64 {
        self.rung_size - self.write_cursor
    }

    /// Bytes written into the current rung.
    pub fn written(&self) -> u64 {
        self.write_cursor
    }

    /// Buffer backing all rungs.
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Number of rungs.
    pub fn rung_count(&self) -> usize {
        self.fences.len()
    }

    /// Size of one rung in bytes.
    pub fn rung_size(&self) -> u64 {
        self.rung_size
    }

    /// Rung most recently returned by `begin_write`.
    pub fn current_rung(&self) -> usize {
        self.current_rung
    }

    /// Whether a rung is currently open for writing.
    pub fn is_writing(&self) -> bool {
        self.writing
    }

    fn rung_base(&self) -> u64 {
        self.current_rung as u64 * self.rung_size
    }
}

impl Drop for FencedRingBuffer {
    fn drop(&mut self) {
        self.retire_to
            .get_mut()
            .retire_or_leak(RetiredResource::Buffer(self.buffer));
    }
}
