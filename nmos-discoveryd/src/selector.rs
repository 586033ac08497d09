//! Priority/weight selection over discovered service records.

use std::collections::HashSet;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use crate::service::ServiceRecord;

/// Exclusion applied to a record that fails an acceptance test.
pub const DEFAULT_PENALTY: Duration = Duration::from_secs(60);

pub struct Selector<R = StdRng> {
    rng: R,
    penalty: Duration,
}

impl Selector<StdRng> {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }
}

impl Default for Selector<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Rng> Selector<R> {
    pub fn with_rng(rng: R) -> Self {
        Self {
            rng,
            penalty: DEFAULT_PENALTY,
        }
    }

    pub fn with_penalty(mut self, penalty: Duration) -> Self {
        self.penalty = penalty;
        self
    }

    pub fn select<'a>(&mut self, records: &'a [ServiceRecord]) -> Option<&'a ServiceRecord> {
        self.select_at(records, Utc::now())
    }

    pub fn select_at<'a>(
        &mut self,
        records: &'a [ServiceRecord],
        now: DateTime<Utc>,
    ) -> Option<&'a ServiceRecord> {
        self.pick(records, now, &HashSet::new())
            .map(|idx| &records[idx])
    }

    /// Select a record that passes `accept`, returning the test's output.
    ///
    /// Each record that fails is ignored for the penalty window and the
    /// selection restarts among the remaining records.
    pub async fn select_with<T, E, F, Fut>(
        &mut self,
        records: &mut [ServiceRecord],
        mut accept: F,
    ) -> Option<T>
    where
        F: FnMut(ServiceRecord) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut tried = HashSet::new();

        loop {
            let idx = self.pick(records, Utc::now(), &tried)?;
            tried.insert(idx);

            match accept(records[idx].clone()).await {
                Ok(value) => return Some(value),
                Err(e) => {
                    tracing::warn!("Rejected service {}: {}", records[idx].name, e);
                    records[idx].ignore(e.to_string(), self.penalty);
                }
            }
        }
    }

    /// Index of the chosen record, or None when nothing is viable.
    fn pick(
        &mut self,
        records: &[ServiceRecord],
        now: DateTime<Utc>,
        excluded: &HashSet<usize>,
    ) -> Option<usize> {
        let viable: Vec<usize> = (0..records.len())
            .filter(|i| !excluded.contains(i) && !records[*i].is_ignored_at(now))
            .collect();

        let priority = viable.iter().map(|&i| records[i].priority).min()?;

        let mut tier: Vec<usize> = viable
            .into_iter()
            .filter(|&i| records[i].priority == priority)
            .collect();
        tier.sort_by_key(|&i| records[i].weight);

        let total: u64 = tier.iter().map(|&i| u64::from(records[i].weight)).sum();
        if total == 0 {
            return Some(tier[self.rng.gen_range(0..tier.len())]);
        }

        let target = self.rng.gen_range(0..total);
        let mut cumulative = 0u64;
        for &i in &tier {
            cumulative += u64::from(records[i].weight);
            if target < cumulative {
                return Some(i);
            }
        }

        tier.last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn record(name: &str, priority: u16, weight: u32) -> ServiceRecord {
        ServiceRecord::new(name, "127.0.0.1", 80)
            .with_priority(priority)
            .with_weight(weight)
    }

    fn frequencies(selector: &mut Selector, records: &[ServiceRecord], rounds: usize) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..rounds {
            let chosen = selector.select(records).unwrap();
            *counts.entry(chosen.name.clone()).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn test_empty_selects_nothing() {
        let mut selector = Selector::seeded(1);
        assert!(selector.select(&[]).is_none());
    }

    #[test]
    fn test_weighted_fairness() {
        let mut selector = Selector::seeded(7);
        let records = vec![record("a", 10, 10), record("b", 10, 30), record("c", 10, 60)];

        let rounds = 20_000;
        let counts = frequencies(&mut selector, &records, rounds);

        for (name, share) in [("a", 0.1), ("b", 0.3), ("c", 0.6)] {
            let observed = counts.get(name).copied().unwrap_or(0) as f64 / rounds as f64;
            assert!(
                (observed - share).abs() < 0.03,
                "{} chosen {:.3}, expected {:.3}",
                name,
                observed,
                share
            );
        }
    }

    #[test]
    fn test_priority_dominance() {
        let mut selector = Selector::seeded(3);
        let records = vec![record("low", 0, 1), record("high-1", 10, 1000), record("high-2", 20, 1000)];

        for _ in 0..1000 {
            assert_eq!(selector.select(&records).unwrap().name, "low");
        }
    }

    #[test]
    fn test_zero_weight_only_wins_as_sole_survivor() {
        let mut selector = Selector::seeded(5);
        let records = vec![record("zero", 0, 0), record("some", 0, 5)];
        for _ in 0..1000 {
            assert_eq!(selector.select(&records).unwrap().name, "some");
        }

        let alone = vec![record("zero", 0, 0)];
        assert_eq!(selector.select(&alone).unwrap().name, "zero");
    }

    #[test]
    fn test_ignored_records_are_skipped_until_window_passes() {
        let mut selector = Selector::seeded(9);
        let now = Utc::now();
        let mut records = vec![record("a", 0, 1), record("b", 0, 1)];
        records[0].ignore_at("down", Duration::from_secs(30), now);

        for _ in 0..200 {
            assert_eq!(selector.select_at(&records, now).unwrap().name, "b");
        }

        let later = now + chrono::Duration::seconds(31);
        let counts: HashSet<String> = (0..200)
            .map(|_| selector.select_at(&records, later).unwrap().name.clone())
            .collect();
        assert!(counts.contains("a"));
    }

    #[test]
    fn test_ignored_lower_priority_falls_through_to_next_tier() {
        let mut selector = Selector::seeded(11);
        let now = Utc::now();
        let mut records = vec![record("primary", 0, 1), record("backup", 10, 1)];
        records[0].ignore_at("down", Duration::from_secs(30), now);
        assert_eq!(selector.select_at(&records, now).unwrap().name, "backup");
    }

    #[tokio::test]
    async fn test_acceptance_retry_converges() {
        let mut selector = Selector::seeded(13);
        let mut records = vec![record("bad-1", 0, 10), record("good", 0, 10), record("bad-2", 0, 10)];

        let chosen = selector
            .select_with(&mut records, |r| async move {
                if r.name == "good" {
                    Ok(r.name)
                } else {
                    Err(format!("{} rejected", r.name))
                }
            })
            .await;

        assert_eq!(chosen.as_deref(), Some("good"));
        // Whether the failures were tried depends on the draw; any failure
        // that was tried must now be ignored, and the winner must not be.
        assert!(!records[1].is_ignored());

        let mut all_bad = vec![record("bad-1", 0, 10), record("bad-2", 0, 10)];
        let none: Option<()> = selector
            .select_with(&mut all_bad, |_| async { Err::<(), _>("nope") })
            .await;
        assert!(none.is_none());
        assert!(all_bad.iter().all(ServiceRecord::is_ignored));
    }

    #[tokio::test]
    async fn test_acceptance_failures_end_up_ignored() {
        // Only the good record can pass, so any draw order ends with both
        // failures penalised once "good" is excluded from the candidates.
        let mut selector = Selector::seeded(17);
        let mut records = vec![record("bad-1", 0, 10), record("bad-2", 0, 10), record("good", 10, 10)];

        let chosen = selector
            .select_with(&mut records, |r| async move {
                if r.name == "good" { Ok(()) } else { Err("rejected") }
            })
            .await;

        assert!(chosen.is_some());
        assert!(records[0].is_ignored());
        assert!(records[1].is_ignored());
        assert!(!records[2].is_ignored());
    }

    #[tokio::test]
    async fn test_zero_penalty_still_terminates() {
        let mut selector = Selector::seeded(19).with_penalty(Duration::ZERO);
        let mut records = vec![record("a", 0, 1), record("b", 0, 1)];
        let mut attempts = 0;
        let result: Option<()> = selector
            .select_with(&mut records, |_| {
                attempts += 1;
                async { Err::<(), _>("no") }
            })
            .await;
        assert!(result.is_none());
        assert_eq!(attempts, 2);
    }
}
