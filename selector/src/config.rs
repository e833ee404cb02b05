use std::str::FromStr;

use tracing::warn;

/// Tuning knobs for a selection tree.
///
/// None of these change *what* gets selected, only how much work a single
/// selection may do before it changes strategy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectorConfig {
    /// Number of excluded (cooldown or caller-excluded) probes tolerated by the
    /// probabilistic strategy before a leaf falls back to a full compacting scan.
    ///
    /// Also the leaf size below which the full scan is used straight away, and
    /// the number of excluded children a sector probes before sweeping all of them.
    pub exclusion_limit: usize,

    /// Size of one storage block in a leaf. A leaf's first block doubles up to
    /// this size; past it, further blocks of exactly this size are appended.
    pub block_size: usize,

    /// Smallest capacity a leaf allocates and never shrinks below.
    pub min_block_size: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            exclusion_limit: 10,
            block_size: 1024,
            min_block_size: 32,
        }
    }
}

impl SelectorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            exclusion_limit: env_or("SELECTOR_EXCLUSION_LIMIT", defaults.exclusion_limit),
            block_size: env_or("SELECTOR_BLOCK_SIZE", defaults.block_size),
            min_block_size: env_or("SELECTOR_MIN_BLOCK_SIZE", defaults.min_block_size),
        }
        .normalized()
    }

    /// Clamp values that would make the tree misbehave.
    ///
    /// - `exclusion_limit` is at least 1
    /// - `block_size` is at least 1
    /// - `min_block_size` lies in `1..=block_size`
    pub fn normalized(mut self) -> Self {
        self.exclusion_limit = self.exclusion_limit.max(1);
        self.block_size = self.block_size.max(1);
        self.min_block_size = self.min_block_size.clamp(1, self.block_size);
        self
    }
}

fn env_or<T: FromStr + Copy + std::fmt::Display>(name: &'static str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!(var = name, value = %raw, default = %default, "unparsable value; using default");
                default
            }
        },
        Err(_) => default,
    }
}
