//! Entity set configuration.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::warn;

use crate::id::{EntityIdGen, FlakeIdGen};

/// Default id epoch: 2021-01-01T00:00:00Z in Unix milliseconds.
pub const DEFAULT_ID_EPOCH_MS: i64 = 1_609_459_200_000;

/// Default worker id packed into generated entity ids.
pub const DEFAULT_WORKER_ID: u8 = 0;

/// The environment variable used to override the worker id.
pub const WORKER_ID_ENV: &str = "ENTITY_WORKER_ID";

/// The environment variable used to override the id epoch (Unix ms).
pub const ID_EPOCH_ENV: &str = "ENTITY_ID_EPOCH";

/// Configuration for an entity set.
#[derive(Clone)]
pub struct EntitySetConfig {
    /// Worker id packed into flake ids (0–255).
    pub worker_id: u8,
    /// Epoch flake timestamps are measured from.
    pub epoch_ms: i64,
    /// Replaces the flake generator entirely when set.
    pub id_gen: Option<Arc<dyn EntityIdGen>>,
}

impl EntitySetConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            worker_id: DEFAULT_WORKER_ID,
            epoch_ms: DEFAULT_ID_EPOCH_MS,
            id_gen: None,
        }
    }

    /// Reads [`WORKER_ID_ENV`] and [`ID_EPOCH_ENV`], falling back to the
    /// defaults for missing or unparsable values.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            worker_id: env_or(WORKER_ID_ENV, DEFAULT_WORKER_ID),
            epoch_ms: env_or(ID_EPOCH_ENV, DEFAULT_ID_EPOCH_MS),
            id_gen: None,
        }
    }

    #[must_use]
    pub fn with_worker_id(mut self, worker_id: u8) -> Self {
        self.worker_id = worker_id;
        self
    }

    #[must_use]
    pub fn with_epoch(mut self, epoch_ms: i64) -> Self {
        self.epoch_ms = epoch_ms;
        self
    }

    #[must_use]
    pub fn with_id_gen(mut self, id_gen: Arc<dyn EntityIdGen>) -> Self {
        self.id_gen = Some(id_gen);
        self
    }

    /// The configured generator, or a flake generator built from the
    /// worker id and epoch.
    #[must_use]
    pub fn build_id_gen(&self) -> Arc<dyn EntityIdGen> {
        match &self.id_gen {
            Some(id_gen) => Arc::clone(id_gen),
            None => Arc::new(FlakeIdGen::new(self.epoch_ms, self.worker_id)),
        }
    }
}

fn env_or<T: FromStr + Copy + fmt::Display>(name: &str, default: T) -> T {
    let Ok(raw) = std::env::var(name) else {
        return default;
    };
    raw.trim().parse().unwrap_or_else(|_| {
        warn!(var = name, value = %raw, default = %default, "ignoring unparsable env value");
        default
    })
}

impl Default for EntitySetConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EntitySetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySetConfig")
            .field("worker_id", &self.worker_id)
            .field("epoch_ms", &self.epoch_ms)
            .field("id_gen", &self.id_gen.as_ref().map(|_| ".."))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::SequentialIdGen;

    #[test]
    fn test_defaults() {
        let config = EntitySetConfig::new();
        assert_eq!(config.worker_id, DEFAULT_WORKER_ID);
        assert_eq!(config.epoch_ms, DEFAULT_ID_EPOCH_MS);
        assert!(config.build_id_gen().next_id() > 0);
    }

    #[test]
    fn test_custom_id_gen_is_shared() {
        let id_gen = Arc::new(SequentialIdGen::new());
        let config = EntitySetConfig::new().with_id_gen(id_gen.clone());
        assert_eq!(config.build_id_gen().next_id(), 1);
        assert_eq!(config.build_id_gen().next_id(), 2);
        assert_eq!(id_gen.count(), 2);
    }

    #[test]
    fn test_builder() {
        let config = EntitySetConfig::new().with_worker_id(9).with_epoch(0);
        assert_eq!(config.worker_id, 9);
        assert_eq!(config.epoch_ms, 0);
        assert!(format!("{config:?}").contains("worker_id: 9"));
    }
}
