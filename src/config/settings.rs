use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing and size limits applied by the response readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadSettings {
    /// Granularity of the wait loops.
    #[serde(with = "millis")]
    pub tick: Duration,
    /// Timeout used when draining stale input (`flush_buffer`).
    #[serde(with = "millis")]
    pub flush_timeout: Duration,
    /// Largest response captured by a single read; excess bytes stay queued.
    /// Zero is rejected when the settings are deserialized.
    pub max_frame_bytes: NonZeroUsize,
    /// Upper bound on a silence-delimited frame, counted from its first byte.
    #[serde(with = "millis_opt")]
    pub max_frame_duration: Option<Duration>,
}

pub const DEFAULT_TICK: Duration = Duration::from_millis(10);
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_millis(50);
pub const DEFAULT_MAX_FRAME_BYTES: NonZeroUsize = match NonZeroUsize::new(4096) {
    Some(bytes) => bytes,
    None => unreachable!(),
};
pub const DEFAULT_MAX_FRAME_DURATION: Duration = Duration::from_secs(10);

impl Default for ReadSettings {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_frame_duration: Some(DEFAULT_MAX_FRAME_DURATION),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
    }
}
