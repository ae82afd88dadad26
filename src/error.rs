//! Error types for the streaming engine.
//!
//! Every fallible operation in the crate returns [`Result`]. A cache miss and a
//! stale rebuild result are ordinary control flow and never show up here.

use std::time::Duration;

use thiserror::Error;

use crate::engine_state::gpu::BufferHandle;

/// Main error type for the streaming engine
#[derive(Debug, Error)]
pub enum StreamingError {
    /// The block allocator does not have enough free blocks for a request.
    #[error("allocation exhausted: requested {requested_blocks} blocks, {free_blocks} free")]
    AllocationExhausted {
        /// Number of blocks the request needed.
        requested_blocks: usize,
        /// Number of blocks free at the time of the request.
        free_blocks: usize,
    },

    /// A rung's fence was not raised within the configured wait.
    #[error("fence on rung {rung} not raised after {waited:?}")]
    FenceTimeout {
        /// Rung whose fence was being waited on.
        rung: usize,
        /// How long the writer spun before giving up.
        waited: Duration,
    },

    /// The current staging rung cannot hold the bytes of an upload.
    #[error("staging rung exhausted: requested {requested} bytes, {available} available")]
    StagingExhausted {
        /// Bytes requested, after alignment.
        requested: u64,
        /// Bytes left in the current rung.
        available: u64,
    },

    /// The deferred-deletion ring has no room for another retirement.
    #[error("deferred deletion queue full (capacity {capacity})")]
    DeletionQueueFull {
        /// Capacity of the ring.
        capacity: usize,
    },

    /// A chunk's mesh can never fit one staging rung or the whole index pool.
    #[error(
        "chunk upload of {bytes} bytes in {blocks} blocks exceeds a {rung_size}-byte rung \
         or the {block_capacity}-block index pool"
    )]
    UploadTooLarge {
        /// Staging bytes the upload needs.
        bytes: u64,
        /// Size of one staging rung.
        rung_size: u64,
        /// Index blocks the upload needs.
        blocks: usize,
        /// Blocks in the whole index pool.
        block_capacity: usize,
    },

    /// Every id of the material table is taken.
    #[error("material table full ({capacity} entries)")]
    MaterialTableFull {
        /// Entries in the table, `AIR` included.
        capacity: usize,
    },

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The device could not provide a buffer.
    #[error("device could not allocate {size} bytes for '{label}': {reason}")]
    DeviceAllocation {
        /// Debug label of the buffer.
        label: String,
        /// Requested size in bytes.
        size: u64,
        /// Device-specific reason.
        reason: String,
    },

    /// No adapter or device could be obtained.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A submitted copy names a buffer the device does not know.
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferHandle),

    /// A frame operation was called out of order.
    #[error("frame state: {0}")]
    FrameState(&'static str),

    /// The configuration document could not be parsed.
    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),

    /// The configuration file could not be read.
    #[error("config read error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StreamingError>;

impl StreamingError {
    /// Whether the error is a per-frame capacity limit that clears by itself
    /// once older frames complete and their resources are released.
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(
            self,
            StreamingError::AllocationExhausted { .. }
                | StreamingError::StagingExhausted { .. }
                | StreamingError::DeletionQueueFull { .. }
        )
    }

    /// Whether the error only affects the request that raised it, so the
    /// frame can go on. Capacity limits also clear by themselves later; an
    /// oversized upload stays undrawable until its chunk is rebuilt smaller.
    pub fn is_recoverable(&self) -> bool {
        self.is_capacity_exhausted() || matches!(self, StreamingError::UploadTooLarge { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_errors_are_recoverable() {
        let exhausted = StreamingError::AllocationExhausted {
            requested_blocks: 3,
            free_blocks: 1,
        };
        assert!(exhausted.is_capacity_exhausted());
        assert_eq!(
            exhausted.to_string(),
            "allocation exhausted: requested 3 blocks, 1 free"
        );

        let timeout = StreamingError::FenceTimeout {
            rung: 2,
            waited: Duration::from_millis(5),
        };
        assert!(!timeout.is_capacity_exhausted());
        assert!(!timeout.is_recoverable());

        let oversized = StreamingError::UploadTooLarge {
            bytes: 5108,
            rung_size: 4096,
            blocks: 72,
            block_capacity: 256,
        };
        assert!(!oversized.is_capacity_exhausted());
        assert!(oversized.is_recoverable());
    }
}
