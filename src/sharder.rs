//! Deterministic bucketing of units into shards.

/// Number of shards used for rule pass percentages.
pub const RULE_SHARDS: u64 = 10_000;
/// Number of shards used by the `user_bucket` condition.
pub const USER_BUCKET_SHARDS: u64 = 1_000;

/// Maps an input to one of `total_shards` buckets.
pub trait Sharder {
    /// Shard of `input`, in `0..total_shards`.
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64;
}

/// The default (and only) sharder. A pure function of its input, so assignments are stable across
/// processes and restarts.
pub struct Md5Sharder;

impl Sharder for Md5Sharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64 {
        let hash = md5::compute(input);
        let value = u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]]);
        (value as u64) % total_shards
    }
}

/// Return `true` if the unit falls within `pass_percentage` (0-100) of the rule's traffic.
pub(crate) fn passes_percentage(
    sharder: &impl Sharder,
    spec_salt: &str,
    rule_salt: &str,
    unit_id: &str,
    pass_percentage: f64,
) -> bool {
    if pass_percentage >= 100.0 {
        return true;
    }
    if pass_percentage <= 0.0 {
        return false;
    }
    let shard = sharder.get_shard(format!("{spec_salt}.{rule_salt}.{unit_id}"), RULE_SHARDS);
    (shard as f64) < pass_percentage * 100.0
}

#[cfg(test)]
pub struct DeterministicSharder(pub std::collections::HashMap<String, u64>);

#[cfg(test)]
impl Sharder for DeterministicSharder {
    fn get_shard(&self, input: impl AsRef<[u8]>, total_shards: u64) -> u64 {
        let input = String::from_utf8_lossy(input.as_ref());
        self.0.get(input.as_ref()).copied().unwrap_or(0) % total_shards
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{passes_percentage, DeterministicSharder, Md5Sharder, Sharder};

    #[test]
    fn test_md5_sharder() {
        assert_eq!(Md5Sharder.get_shard("test-input", 10_000), 5619);
        assert_eq!(Md5Sharder.get_shard("alice", 10_000), 3170);
        assert_eq!(Md5Sharder.get_shard("bob", 10_000), 7420);
        assert_eq!(Md5Sharder.get_shard("charlie", 10_000), 7497);
    }

    #[test]
    fn shard_is_stable_across_calls() {
        let first = Md5Sharder.get_shard("salt.rule.user-1", 10_000);
        for _ in 0..100 {
            assert_eq!(Md5Sharder.get_shard("salt.rule.user-1", 10_000), first);
        }
    }

    #[test]
    fn percentage_bounds_short_circuit() {
        let sharder = DeterministicSharder(HashMap::from([("s.r.u".to_owned(), 9_999)]));
        assert!(passes_percentage(&sharder, "s", "r", "u", 100.0));
        assert!(!passes_percentage(&sharder, "s", "r", "u", 0.0));
    }

    #[test]
    fn percentage_compares_against_shard() {
        let sharder = DeterministicSharder(HashMap::from([("s.r.u".to_owned(), 4_999)]));
        assert!(passes_percentage(&sharder, "s", "r", "u", 50.0));
        assert!(!passes_percentage(&sharder, "s", "r", "u", 49.0));
    }
}
