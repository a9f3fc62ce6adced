use crate::error::ProfilerError;
use serde::{Deserialize, Serialize};

/// Mean number of bytes between two samples unless configured otherwise.
pub const DEFAULT_SAMPLING_INTERVAL: usize = 128 * 1024;

/// Frames belonging to the allocator bridge and the profiler itself.
pub const DEFAULT_SKIP_FRAMES: usize = 4;

pub const DEFAULT_MAX_STACK_DEPTH: usize = 64;

const ENV_INTERVAL: &str = "SAMPLING_HEAP_PROFILER_INTERVAL";
const ENV_DETERMINISTIC: &str = "SAMPLING_HEAP_PROFILER_DETERMINISTIC";
const ENV_SKIP_FRAMES: &str = "SAMPLING_HEAP_PROFILER_SKIP_FRAMES";
const ENV_MAX_DEPTH: &str = "SAMPLING_HEAP_PROFILER_MAX_DEPTH";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    /// Mean of the exponential distribution the sampling thresholds are drawn from.
    pub sampling_interval: usize,
    /// Use `sampling_interval` verbatim for every threshold. Only meant for tests.
    pub deterministic: bool,
    /// Leading frames dropped from every captured stack.
    pub skip_frames: usize,
    /// Upper bound on the number of frames kept per sample.
    pub max_stack_depth: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            deterministic: false,
            skip_frames: DEFAULT_SKIP_FRAMES,
            max_stack_depth: DEFAULT_MAX_STACK_DEPTH,
        }
    }
}

impl ProfilerConfig {
    /// Build a configuration from `SAMPLING_HEAP_PROFILER_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ProfilerError::InvalidConfig`] if a variable is set but cannot
    /// be parsed, or if the interval or stack depth is zero.
    pub fn from_env() -> Result<Self, ProfilerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ProfilerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_INTERVAL) {
            config.sampling_interval = parse_positive(ENV_INTERVAL, &value)?;
        }
        if let Some(value) = lookup(ENV_DETERMINISTIC) {
            config.deterministic = parse_flag(ENV_DETERMINISTIC, &value)?;
        }
        if let Some(value) = lookup(ENV_SKIP_FRAMES) {
            config.skip_frames = value
                .trim()
                .parse::<usize>()
                .map_err(|e| invalid(ENV_SKIP_FRAMES, &value, e))?;
        }
        if let Some(value) = lookup(ENV_MAX_DEPTH) {
            config.max_stack_depth = parse_positive(ENV_MAX_DEPTH, &value)?;
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_sampling_interval(mut self, interval: usize) -> Self {
        self.sampling_interval = interval;
        self
    }

    #[must_use]
    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    #[must_use]
    pub fn with_max_stack_depth(mut self, depth: usize) -> Self {
        self.max_stack_depth = depth;
        self
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize, ProfilerError> {
    let parsed = value.trim().parse::<usize>().map_err(|e| invalid(key, value, e))?;
    if parsed == 0 {
        return Err(invalid(key, value, "must be greater than zero"));
    }
    Ok(parsed)
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ProfilerError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean flag")),
    }
}

fn invalid(key: &str, value: &str, reason: impl ToString) -> ProfilerError {
    ProfilerError::InvalidConfig {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let config = ProfilerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ProfilerConfig::default());
        assert_eq!(config.sampling_interval, 128 * 1024);
        assert!(!config.deterministic);
    }

    #[test]
    fn reads_every_variable() {
        let config = ProfilerConfig::from_lookup(lookup(&[
            ("SAMPLING_HEAP_PROFILER_INTERVAL", "4096"),
            ("SAMPLING_HEAP_PROFILER_DETERMINISTIC", "true"),
            ("SAMPLING_HEAP_PROFILER_SKIP_FRAMES", "0"),
            ("SAMPLING_HEAP_PROFILER_MAX_DEPTH", " 16 "),
        ]))
        .unwrap();

        assert_eq!(config.sampling_interval, 4096);
        assert!(config.deterministic);
        assert_eq!(config.skip_frames, 0);
        assert_eq!(config.max_stack_depth, 16);
    }

    #[test]
    fn rejects_zero_interval() {
        let err = ProfilerConfig::from_lookup(lookup(&[("SAMPLING_HEAP_PROFILER_INTERVAL", "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ProfilerError::InvalidConfig { ref key, .. } if key == "SAMPLING_HEAP_PROFILER_INTERVAL"
        ));
    }

    #[test]
    fn rejects_garbage() {
        assert!(
            ProfilerConfig::from_lookup(lookup(&[("SAMPLING_HEAP_PROFILER_DETERMINISTIC", "maybe")]))
                .is_err()
        );
        assert!(
            ProfilerConfig::from_lookup(lookup(&[("SAMPLING_HEAP_PROFILER_MAX_DEPTH", "-3")]))
                .is_err()
        );
    }

    #[test]
    fn deserializes_partial_json() {
        let config: ProfilerConfig =
            serde_json::from_str(r#"{"sampling_interval": 1000, "deterministic": true}"#).unwrap();
        assert_eq!(config.sampling_interval, 1000);
        assert!(config.deterministic);
        assert_eq!(config.max_stack_depth, DEFAULT_MAX_STACK_DEPTH);
    }
}
