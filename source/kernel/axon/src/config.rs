// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot-time kernel configuration.

use crate::types::MAX_SLOTS;
use core::fmt;

/// Sizing of the simulated machine. Validated once at boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of processors; each owns one idle context.
    pub cpus: usize,
    /// Size of the context table, idle contexts included.
    pub max_contexts: usize,
    /// Capacity of the physical frame pool.
    pub phys_frames: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { cpus: 1, max_contexts: 64, phys_frames: 4096 }
    }
}

/// Reasons a [`KernelConfig`] is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// At least one processor is required.
    NoCpus,
    /// The table must hold every idle context plus at least one user context.
    TooFewContexts,
    /// The id encoding cannot address this many slots.
    TooManyContexts,
    /// The frame pool is empty.
    NoFrames,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoCpus => write!(f, "at least one cpu is required"),
            Self::TooFewContexts => write!(f, "context table smaller than cpus + 1"),
            Self::TooManyContexts => write!(f, "context table larger than {MAX_SLOTS} slots"),
            Self::NoFrames => write!(f, "frame pool must not be empty"),
        }
    }
}

impl core::error::Error for ConfigError {}

impl KernelConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpus == 0 {
            return Err(ConfigError::NoCpus);
        }
        if self.max_contexts <= self.cpus {
            return Err(ConfigError::TooFewContexts);
        }
        if self.max_contexts > MAX_SLOTS {
            return Err(ConfigError::TooManyContexts);
        }
        if self.phys_frames == 0 {
            return Err(ConfigError::NoFrames);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        KernelConfig::default().validate().expect("default config");
    }

    #[test]
    fn rejects_degenerate_sizes() {
        let base = KernelConfig::default();
        assert_eq!(KernelConfig { cpus: 0, ..base }.validate(), Err(ConfigError::NoCpus));
        assert_eq!(
            KernelConfig { cpus: 4, max_contexts: 4, ..base }.validate(),
            Err(ConfigError::TooFewContexts)
        );
        assert_eq!(
            KernelConfig { max_contexts: MAX_SLOTS + 1, ..base }.validate(),
            Err(ConfigError::TooManyContexts)
        );
        assert_eq!(KernelConfig { phys_frames: 0, ..base }.validate(), Err(ConfigError::NoFrames));
    }
}
