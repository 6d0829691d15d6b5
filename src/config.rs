// SPDX-License-Identifier: Apache-2.0

//! Configuration for a Keep and its switchless workers
//!
//! ```
//! use switchless::config::Config;
//!
//! let config: Config = r#"
//! [switchless]
//! workers = 4
//! "#
//! .parse()
//! .unwrap();
//!
//! assert_eq!(config.switchless.workers, 4);
//! assert_eq!(config.keep.bindings, 8);
//! ```

use crate::arena::{DEFAULT_CAPACITY, MAX_CAPACITY};
use crate::Error;

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration file template
pub const CONFIG_TEMPLATE: &str = r#"## Configuration for a Keep with switchless host calls

## Per-thread scratch arenas
[arena]
## Capacity of newly created arenas in bytes
# capacity = 1048576
## Largest capacity that may ever be configured
# max-capacity = 1073741824

## Switchless worker pool
[switchless]
## Number of worker threads, clamped to the number of Keep bindings
# workers = 2
## Sleep between empty polls in microseconds, 0 busy-waits
# poll-interval = 0

## The simulated Keep
[keep]
## Number of threads that may cross into the host concurrently
# bindings = 8
## Size of the protected region in bytes
# protected-size = 1048576
## Extra latency of a conventional crossing in nanoseconds
# crossing-cost = 0
"#;

const fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

const fn default_max_capacity() -> usize {
    MAX_CAPACITY
}

const fn default_workers() -> usize {
    2
}

const fn default_bindings() -> usize {
    8
}

const fn default_protected_size() -> usize {
    1 << 20
}

/// The complete configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Arena settings
    #[serde(default)]
    pub arena: ArenaConfig,

    /// Worker pool settings
    #[serde(default)]
    pub switchless: SwitchlessConfig,

    /// Keep settings
    #[serde(default)]
    pub keep: KeepConfig,
}

/// The `[arena]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ArenaConfig {
    /// Capacity of newly created arenas in bytes
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Ceiling for the arena capacity in bytes
    #[serde(default = "default_max_capacity")]
    pub max_capacity: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            max_capacity: default_max_capacity(),
        }
    }
}

/// The `[switchless]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SwitchlessConfig {
    /// Number of worker threads
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Sleep between empty polls in microseconds
    #[serde(default)]
    pub poll_interval: u64,
}

impl SwitchlessConfig {
    /// The poll interval as a [`Duration`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval)
    }
}

impl Default for SwitchlessConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval: 0,
        }
    }
}

/// The `[keep]` section
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct KeepConfig {
    /// Number of threads that may cross into the host concurrently
    #[serde(default = "default_bindings")]
    pub bindings: usize,

    /// Size of the protected region in bytes
    #[serde(default = "default_protected_size")]
    pub protected_size: usize,

    /// Extra latency of a conventional crossing in nanoseconds
    #[serde(default)]
    pub crossing_cost: u64,
}

impl KeepConfig {
    /// The crossing cost as a [`Duration`]
    pub fn crossing_cost(&self) -> Duration {
        Duration::from_nanos(self.crossing_cost)
    }
}

impl Default for KeepConfig {
    fn default() -> Self {
        Self {
            bindings: default_bindings(),
            protected_size: default_protected_size(),
            crossing_cost: 0,
        }
    }
}

impl Config {
    /// Checks the values for consistency.
    pub fn validate(&self) -> Result<(), Error> {
        if self.arena.max_capacity > MAX_CAPACITY {
            return Err(Error::Config(format!(
                "arena max-capacity must not exceed {MAX_CAPACITY} bytes"
            )));
        }
        if self.arena.capacity > self.arena.max_capacity {
            return Err(Error::Config(
                "arena capacity must not exceed max-capacity".into(),
            ));
        }
        if self.keep.bindings == 0 {
            return Err(Error::Config("keep bindings must not be zero".into()));
        }
        if self.keep.protected_size == 0 {
            return Err(Error::Config("keep protected-size must not be zero".into()));
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = Error;

    /// Parses and validates a TOML configuration.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}
