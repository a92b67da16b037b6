//! Prober configuration.

use std::time::Duration;

use uuid::Uuid;

/// A fresh random run id.
///
/// Values written by a run embed it, so a value left behind by an earlier
/// run against the same keys never reads back as this run's write.
pub fn generate_run_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Settings for one probe run.
#[derive(Clone, Debug)]
pub struct ProberConfig {
    /// Prefix of every key the prober writes.
    pub key_prefix: String,
    /// Sorted set receiving one member per cycle. Defaults to `<prefix>:zset`.
    pub zset_key: Option<String>,
    /// Hash receiving one field per cycle. Defaults to `<prefix>:hash`.
    pub hash_key: Option<String>,
    /// Total run time before the prober stops itself.
    pub duration: Duration,
    /// Time between cycle starts.
    pub interval_between_cycles: Duration,
    /// Pause between a write and its read-back.
    pub read_after_write_delay: Duration,
    /// Reads in flight during final verification.
    pub verify_concurrency: usize,
    /// Embedded in every value written. Fresh for each default config.
    pub run_id: String,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            key_prefix: "reshard-probe".to_string(),
            zset_key: None,
            hash_key: None,
            duration: Duration::from_secs(60),
            interval_between_cycles: Duration::from_secs(1),
            read_after_write_delay: Duration::from_millis(50),
            verify_concurrency: 16,
            run_id: generate_run_id(),
        }
    }
}

impl ProberConfig {
    pub fn new(key_prefix: impl Into<String>) -> Self {
        Self {
            key_prefix: key_prefix.into(),
            ..Default::default()
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval_between_cycles = interval;
        self
    }

    pub fn with_read_after_write_delay(mut self, delay: Duration) -> Self {
        self.read_after_write_delay = delay;
        self
    }

    pub fn with_zset_key(mut self, key: impl Into<String>) -> Self {
        self.zset_key = Some(key.into());
        self
    }

    pub fn with_hash_key(mut self, key: impl Into<String>) -> Self {
        self.hash_key = Some(key.into());
        self
    }

    pub fn with_verify_concurrency(mut self, concurrency: usize) -> Self {
        self.verify_concurrency = concurrency.max(1);
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn zset_key(&self) -> String {
        self.zset_key
            .clone()
            .unwrap_or_else(|| format!("{}:zset", self.key_prefix))
    }

    pub fn hash_key(&self) -> String {
        self.hash_key
            .clone()
            .unwrap_or_else(|| format!("{}:hash", self.key_prefix))
    }

    /// Standalone key written in `cycle`.
    pub fn cycle_key(&self, cycle: u64) -> String {
        format!("{}:key:{}", self.key_prefix, cycle)
    }

    /// Value stored under the cycle key and hash field for `cycle`.
    pub fn cycle_value(&self, cycle: u64) -> String {
        format!("{}:{}", self.run_id, cycle)
    }

    /// Sorted set member added in `cycle`. Its score is the cycle number.
    pub fn zset_member(&self, cycle: u64) -> String {
        self.cycle_value(cycle)
    }
}
