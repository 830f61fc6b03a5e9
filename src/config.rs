use log::debug;
use snafu::OptionExt;

use crate::error::{ConfigSnafu, Result};

/// Thresholds for splitting a big reduce into two passes.
///
/// These were tuned by hand for GPUs with a few thousand threads in flight.
/// Treat them as knobs, not as constants with a derivation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReduceSplit {
    /// Split only when input size / output size is at least this.
    pub min_work: i64,
    /// Candidate divisors are scored by `gcd(gcd_base, dim) / stride`.
    pub gcd_base: i64,
    /// Smallest divisor worth splitting by.
    pub min_divisor: i64,
    /// Best score must beat this, or the reduce is left alone.
    pub min_heuristic: f64,
}

impl Default for ReduceSplit {
    fn default() -> Self {
        ReduceSplit {
            min_work: 32768,
            gcd_base: 256,
            min_divisor: 16,
            min_heuristic: 0.1,
        }
    }
}

/// Which graph rewrites run while lazy buffers are built.
///
/// Every rule can be toggled individually. `from_opt_level` sets them in
/// the usual groups.
#[allow(clippy::struct_excessive_bools)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RewriteConfig {
    pub remove_movement_nops: bool,
    pub merge_elementwise_into_reduce: bool,
    pub shuffle_movement_ops: bool,
    pub merge_elementwise_ops: bool,
    pub merge_one_reduce_into_elementwise: bool,
    pub shuffle_pad_ops: bool,
    pub push_permutes: bool,
    pub push_contiguous: bool,
    /// Deduplicate structurally equal unrealized buffers.
    pub lazycache: bool,
    /// `None` turns reduce splitting off.
    pub reduce_split: Option<ReduceSplit>,
}

impl RewriteConfig {
    pub fn from_opt_level(opt: u8) -> RewriteConfig {
        RewriteConfig {
            remove_movement_nops: opt >= 1,
            merge_elementwise_into_reduce: opt >= 1,
            shuffle_movement_ops: opt >= 1,
            merge_elementwise_ops: opt >= 1,
            merge_one_reduce_into_elementwise: opt >= 2,
            shuffle_pad_ops: opt >= 2,
            push_permutes: opt >= 3,
            push_contiguous: opt >= 3,
            lazycache: true,
            reduce_split: Some(ReduceSplit::default()),
        }
    }

    /// Read `OPT` and `LAZYCACHE` from the environment, defaulting to `OPT=2`
    /// and caching on.
    ///
    /// # Errors
    ///
    /// `Config` if a variable is set but isn't a small non-negative integer.
    pub fn from_env() -> Result<RewriteConfig> {
        let opt = read_level("OPT")?.unwrap_or(2);
        let mut config = RewriteConfig::from_opt_level(opt);
        if let Some(lazycache) = read_level("LAZYCACHE")? {
            config.lazycache = lazycache != 0;
        }
        debug!("rewrite config from env: OPT={opt} {config:?}");
        Ok(config)
    }

    #[must_use]
    pub fn with_lazycache(mut self, lazycache: bool) -> RewriteConfig {
        self.lazycache = lazycache;
        self
    }

    #[must_use]
    pub fn with_reduce_split(mut self, reduce_split: Option<ReduceSplit>) -> RewriteConfig {
        self.reduce_split = reduce_split;
        self
    }
}

impl Default for RewriteConfig {
    fn default() -> Self {
        RewriteConfig::from_opt_level(2)
    }
}

fn read_level(key: &str) -> Result<Option<u8>> {
    match std::env::var(key) {
        Ok(value) => {
            let level = value.trim().parse::<u8>().ok().context(ConfigSnafu {
                key,
                value: value.clone(),
            })?;
            Ok(Some(level))
        }
        Err(_) => Ok(None),
    }
}
