//! Desired-concurrency distribution across targets.
//!
//! [`distribute`] is a pure function of the [`Config`] and the ordered target
//! set. The manager calls it on every membership or lifecycle change and
//! applies the whole result, so repeated or interleaved calls always converge
//! on the last computed state.

use crate::Config;

/// Computes the desired number of workers for each target.
///
/// Targets are visited in the order given. With `match_global_cap` set, the
/// first `global_cap % targets.len()` targets receive one extra worker, so a
/// stable input order keeps the remainder on the same targets across
/// recomputations.
///
/// Every target receives at least one worker, even if that pushes the total
/// above `global_cap`.
pub fn distribute<'a, T>(config: &Config, targets: &'a [T]) -> Vec<(&'a T, usize)> {
    if targets.is_empty() {
        return Vec::new();
    }

    if !config.match_global_cap {
        let per_target = config.parallelism.max(1);
        return targets.iter().map(|t| (t, per_target)).collect();
    }

    let base = config.global_cap / targets.len();
    let remainder = config.global_cap % targets.len();

    targets
        .iter()
        .enumerate()
        .map(|(i, t)| {
            let share = if i < remainder { base + 1 } else { base };
            (t, share.max(1))
        })
        .collect()
}
