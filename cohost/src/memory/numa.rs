//! NUMA-balanced reservation planning.
//!
//! Given what each node actually supplied, decide how much every node keeps
//! so that the per-node totals stay within a fractional spread of their mean.
//! Planning is pure arithmetic on whole runs; the registry applies the plan
//! by releasing runs above each node's target.
//!
//! Two compensating rounds are applied:
//!
//! 1. The deficit of the under-mean nodes is spread over the over-mean
//!    nodes as compensation, rounded up to whole runs, so they may keep
//!    `mean + compensation`.
//! 2. Whatever remains above `mean + compensation` is released.
//!
//! A distribution that still violates the limit after round 2 is rejected.
//! No third round is attempted, so a single starved node among many rich
//! ones fails even when a lower common cap would have satisfied the limit.

use cohost_shared::errors::{CohostError, CohostResult};

/// Per-node targets, in bytes, for a balanced reservation.
///
/// `reserved[i]` is what node `i` supplied, `align` the run size every
/// target is rounded down to and `variance` the allowed fractional spread.
pub fn plan_balanced(reserved: &[u64], align: u64, variance: f64) -> CohostResult<Vec<u64>> {
    if reserved.is_empty() {
        return Err(CohostError::Validation("balanced reservation needs at least one node".into()));
    }
    if align == 0 {
        return Err(CohostError::Validation("run size must be nonzero".into()));
    }
    if !(variance >= 0.0) {
        return Err(CohostError::Validation(format!("invalid variance limit {}", variance)));
    }

    let runs: Vec<u64> = reserved.iter().map(|r| r / align).collect();
    if let Some(node) = runs.iter().position(|&r| r == 0) {
        return Err(CohostError::ResourceExhausted(format!(
            "node index {} supplied no memory",
            node
        )));
    }

    let k = runs.len() as u64;
    let total: u64 = runs.iter().sum();
    let mean = total / k;
    let deficit: u64 = runs.iter().filter(|&&r| r < mean).map(|r| mean - r).sum();
    let surplus: u64 = runs.iter().filter(|&&r| r > mean).map(|r| r - mean).sum();
    if deficit > surplus {
        return Err(CohostError::ResourceExhausted(format!(
            "deficit of {} runs exceeds surplus of {}",
            deficit, surplus
        )));
    }

    // Round 1
    let over = runs.iter().filter(|&&r| r > mean).count() as u64;
    let compensation = if over == 0 { 0 } else { deficit.div_ceil(over) };
    let level = mean + compensation;

    // Round 2
    let plan: Vec<u64> = runs.iter().map(|&r| r.min(level)).collect();

    if !within_variance(&plan, variance) {
        return Err(CohostError::ResourceExhausted(format!(
            "cannot balance {:?} runs within variance {} (level {})",
            runs, variance, level
        )));
    }
    tracing::debug!(mean, deficit, compensation, ?plan, "balanced plan");

    Ok(plan.into_iter().map(|r| r * align).collect())
}

/// True if both `max - mean` and `mean - min` are at most `variance * mean`.
pub fn within_variance(totals: &[u64], variance: f64) -> bool {
    if totals.is_empty() {
        return true;
    }
    let mean = totals.iter().sum::<u64>() as f64 / totals.len() as f64;
    let max = totals.iter().copied().max().unwrap_or(0) as f64;
    let min = totals.iter().copied().min().unwrap_or(0) as f64;
    let limit = variance * mean + 1e-9;
    max - mean <= limit && mean - min <= limit
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohost_shared::ErrorKind;

    const RUN: u64 = 4 << 20;

    fn bytes(runs: &[u64]) -> Vec<u64> {
        runs.iter().map(|r| r * RUN).collect()
    }

    #[test]
    fn test_over_mean_nodes_keep_compensation() {
        // mean 96, deficit 6 over two nodes: each keeps 96 + 3.
        let plan = plan_balanced(&bytes(&[100, 100, 90]), RUN, 0.1).unwrap();
        assert_eq!(plan, bytes(&[99, 99, 90]));
        assert!(within_variance(&plan, 0.1));
    }

    #[test]
    fn test_uneven_rich_nodes_are_levelled() {
        // mean 20, deficit 10, compensation 5: level 25.
        let plan = plan_balanced(&bytes(&[10, 22, 30]), RUN, 0.5).unwrap();
        assert_eq!(plan, bytes(&[10, 22, 25]));
    }

    #[test]
    fn test_compensation_rounds_up_to_whole_runs() {
        // mean 18, deficit 15 over two nodes: compensation 8, level 26.
        let plan = plan_balanced(&bytes(&[8, 13, 20, 31]), RUN, 0.6).unwrap();
        assert_eq!(plan, bytes(&[8, 13, 20, 26]));
    }

    #[test]
    fn test_skewed_pair_fails() {
        let err = plan_balanced(&bytes(&[100, 400]), RUN, 0.2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_single_starved_node_fails() {
        let err = plan_balanced(&bytes(&[10, 18, 18, 18, 18]), RUN, 0.3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        // A common cap of 14 runs would have been within the limit.
        assert!(within_variance(&[10, 14, 14, 14, 14], 0.3));
    }

    #[test]
    fn test_empty_node_fails() {
        let err = plan_balanced(&bytes(&[8, 0]), RUN, 0.5).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
    }

    #[test]
    fn test_partial_runs_are_ignored() {
        let plan = plan_balanced(&[RUN + 5, RUN], RUN, 0.0).unwrap();
        assert_eq!(plan, vec![RUN, RUN]);
    }

    #[test]
    fn test_invalid_arguments() {
        assert_eq!(plan_balanced(&[], RUN, 0.1).unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(plan_balanced(&[RUN], 0, 0.1).unwrap_err().kind(), ErrorKind::Validation);
        assert_eq!(
            plan_balanced(&[RUN], RUN, f64::NAN).unwrap_err().kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn test_unbounded_variance() {
        // mean 25, deficit 24: level 49.
        let plan = plan_balanced(&bytes(&[1, 50]), RUN, 1.0).unwrap();
        assert_eq!(plan, bytes(&[1, 49]));
    }
}
