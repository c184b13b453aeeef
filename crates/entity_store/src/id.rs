//! Entity id generation.
//!
//! Ids come from an [`EntityIdGen`] owned by each entity set. Two generators
//! are provided:
//!
//! - [`FlakeIdGen`]: time-ordered 53-bit ids (safe as JSON numbers).
//! - [`SequentialIdGen`]: 1, 2, 3 … for deterministic tests and embedding.
//!
//! ## Flake53 layout
//!
//! ```text
//! | 41 bits: ms since epoch | 8 bits: worker id | 4 bits: sequence |
//! ```

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::entity::EntityId;

/// Milliseconds the timestamp is shifted left by.
const TIMESTAMP_SHIFT: u32 = 12;
const WORKER_SHIFT: u32 = 4;
const WORKER_MASK: u64 = 0xff;
const SEQUENCE_MASK: u64 = 0xf;

/// Source of fresh entity ids. Ids are never `0`.
pub trait EntityIdGen: Send + Sync {
    fn next_id(&self) -> EntityId;
}

/// The parts packed into a flake53 id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlakeParts {
    /// Unix time in milliseconds.
    pub timestamp: i64,
    pub worker_id: u8,
    pub sequence: u8,
    /// Unix time in milliseconds the timestamp is measured from.
    pub epoch: i64,
}

#[must_use]
pub fn build_flake53(parts: FlakeParts) -> EntityId {
    let elapsed = (parts.timestamp - parts.epoch).max(0) as u64;
    (elapsed << TIMESTAMP_SHIFT)
        | ((u64::from(parts.worker_id) & WORKER_MASK) << WORKER_SHIFT)
        | (u64::from(parts.sequence) & SEQUENCE_MASK)
}

#[must_use]
pub fn parse_flake53(id: EntityId, epoch: i64) -> FlakeParts {
    FlakeParts {
        timestamp: (id >> TIMESTAMP_SHIFT) as i64 + epoch,
        worker_id: ((id >> WORKER_SHIFT) & WORKER_MASK) as u8,
        sequence: (id & SEQUENCE_MASK) as u8,
        epoch,
    }
}

#[derive(Debug, Default)]
struct FlakeState {
    last_timestamp: i64,
    sequence: u8,
}

/// Time-ordered id generator.
///
/// Ids from one generator are strictly increasing. When the 4-bit sequence
/// runs out inside one millisecond the generator moves on to the next
/// millisecond rather than repeating an id.
#[derive(Debug)]
pub struct FlakeIdGen {
    epoch: i64,
    worker_id: u8,
    state: Mutex<FlakeState>,
}

impl FlakeIdGen {
    #[must_use]
    pub fn new(epoch: i64, worker_id: u8) -> Self {
        Self {
            epoch,
            worker_id,
            state: Mutex::new(FlakeState::default()),
        }
    }

    #[must_use]
    pub const fn epoch(&self) -> i64 {
        self.epoch
    }

    #[must_use]
    pub const fn worker_id(&self) -> u8 {
        self.worker_id
    }

    fn next_at(&self, now: i64) -> EntityId {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut timestamp = now.max(state.last_timestamp);
        if timestamp == state.last_timestamp {
            if u64::from(state.sequence) >= SEQUENCE_MASK {
                timestamp += 1;
                state.sequence = 0;
            } else {
                state.sequence += 1;
            }
        } else {
            state.sequence = 0;
        }
        state.last_timestamp = timestamp;
        build_flake53(FlakeParts {
            timestamp,
            worker_id: self.worker_id,
            sequence: state.sequence,
            epoch: self.epoch,
        })
    }
}

impl EntityIdGen for FlakeIdGen {
    fn next_id(&self) -> EntityId {
        self.next_at(Utc::now().timestamp_millis())
    }
}

/// Allocates monotonically increasing ids starting at 1.
#[derive(Debug)]
pub struct SequentialIdGen {
    next: AtomicU64,
}

impl SequentialIdGen {
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    #[must_use]
    pub fn starting_at(first: EntityId) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    /// Number of ids handed out so far, when started at 1.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for SequentialIdGen {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityIdGen for SequentialIdGen {
    fn next_id(&self) -> EntityId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flake53_known_vector() {
        let parts = FlakeParts {
            timestamp: 1_555_608_701_611,
            worker_id: 14,
            sequence: 10,
            epoch: 1_413_370_800_000,
        };
        let id = build_flake53(parts);
        assert_eq!(id, 582_606_444_998_890);
        assert_eq!(parse_flake53(id, parts.epoch), parts);
    }

    #[test]
    fn test_flake_ids_fit_in_53_bits() {
        let id = FlakeIdGen::new(1_609_459_200_000, 255).next_id();
        assert!(id < (1u64 << 53));
        assert_eq!(parse_flake53(id, 1_609_459_200_000).worker_id, 255);
    }

    #[test]
    fn test_flake_sequence_overflow_stays_increasing() {
        let generator = FlakeIdGen::new(0, 1);
        let mut last = 0;
        // more ids than the sequence can hold inside a single millisecond
        for _ in 0..40 {
            let id = generator.next_at(1_000);
            assert!(id > last, "{id} <= {last}");
            last = id;
        }
        // a clock that steps backwards does not produce smaller ids
        assert!(generator.next_at(500) > last);
    }

    #[test]
    fn test_sequential_produces_unique_ids() {
        let generator = SequentialIdGen::new();
        assert_eq!(generator.next_id(), 1);
        assert_eq!(generator.next_id(), 2);
        assert_eq!(generator.next_id(), 3);
        assert_eq!(generator.count(), 3);
        assert_eq!(SequentialIdGen::starting_at(0).next_id(), 1);
    }
}
