use crate::{QueueError, QueueResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use transport::{MAX_CAPACITY, MAX_SLOT_SIZE};

/// Geometry and timing of one queue instance, fixed at creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Slots per ring. Any value in `1..=MAX_CAPACITY`.
    pub capacity: u32,
    /// Largest task or result payload in bytes.
    pub slot_size: u32,
    /// Upper bound between peer-liveness checks while blocked.
    pub liveness_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            slot_size: 4096,
            liveness_interval: Duration::from_millis(50),
        }
    }
}

impl QueueConfig {
    /// Shorthand for a config with the default liveness interval.
    pub fn new(capacity: u32, slot_size: u32) -> Self {
        Self {
            capacity,
            slot_size,
            ..Self::default()
        }
    }

    /// Rejects geometry the ring cannot represent.
    pub fn validate(&self) -> QueueResult<()> {
        if self.capacity == 0 {
            return Err(QueueError::InvalidConfig("capacity must be at least 1"));
        }
        if self.capacity > MAX_CAPACITY {
            return Err(QueueError::InvalidConfig("capacity exceeds MAX_CAPACITY"));
        }
        if self.slot_size == 0 {
            return Err(QueueError::InvalidConfig("slot_size must be at least 1"));
        }
        if self.slot_size > MAX_SLOT_SIZE {
            return Err(QueueError::InvalidConfig("slot_size exceeds MAX_SLOT_SIZE"));
        }
        if self.liveness_interval.is_zero() {
            return Err(QueueError::InvalidConfig("liveness_interval must be non-zero"));
        }
        if u32::try_from(self.liveness_interval.as_micros()).is_err() {
            return Err(QueueError::InvalidConfig("liveness_interval is too long"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::ErrorKind;

    #[test]
    fn default_config_is_valid() {
        let config = QueueConfig::default();
        assert_eq!(config.capacity, 64);
        assert_eq!(config.slot_size, 4096);
        config.validate().expect("default validates");
    }

    #[test]
    fn degenerate_geometry_is_rejected() {
        for config in [
            QueueConfig::new(0, 64),
            QueueConfig::new(MAX_CAPACITY + 1, 64),
            QueueConfig::new(4, 0),
            QueueConfig {
                liveness_interval: Duration::ZERO,
                ..QueueConfig::default()
            },
        ] {
            let err = config.validate().expect_err("invalid");
            assert_eq!(err.kind(), ErrorKind::IncompatibleLayout, "{config:?}");
        }
        QueueConfig::new(1, 1).validate().expect("capacity one is allowed");
        QueueConfig::new(3, 64).validate().expect("non power of two is allowed");
    }
}
