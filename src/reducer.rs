//! Online Variance Reducer
//!
//! Streaming mean / standard deviation over a sequence of values, usable as an
//! application-level group-by reduction or as a SQLite user-defined aggregate.
//!
//! The recurrence is Welford's, with the sample denominator taken as `k - 2`
//! where `k` is the number of values consumed. The deviation is only defined
//! once three values have been consumed.

use rusqlite::functions::{Aggregate, Context, FunctionFlags};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Minimum number of consumed values for the deviation to be defined.
pub const MIN_SAMPLE_SIZE: u64 = 3;

/// A step/finalize accumulator. One instance per group key.
pub trait StreamingReducer: Default {
    type Input;
    type Output;

    fn step(&mut self, value: Self::Input);

    /// `None` when the statistic is undefined for the values seen so far.
    fn finalize(&self) -> Option<Self::Output>;
}

/// Running Welford state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OnlineVariance {
    mean: f64,
    sum_sq: f64,
    /// 1-based index of the next value; starts at 1.
    k: u64,
}

impl Default for OnlineVariance {
    fn default() -> Self {
        Self {
            mean: 0.0,
            sum_sq: 0.0,
            k: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VarianceSummary {
    pub mean: f64,
    pub stdev: f64,
    pub sample_size: u64,
}

impl OnlineVariance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        let delta = value - self.mean;
        self.mean += delta / self.k as f64;
        self.sum_sq += delta * (value - self.mean);
        self.k += 1;
    }

    pub fn consumed(&self) -> u64 {
        self.k - 1
    }

    pub fn mean(&self) -> Option<f64> {
        if self.consumed() == 0 {
            None
        } else {
            Some(self.mean)
        }
    }

    pub fn sum_of_squares(&self) -> f64 {
        self.sum_sq
    }

    pub fn stdev(&self) -> Option<f64> {
        let n = self.consumed();
        if n < MIN_SAMPLE_SIZE {
            return None;
        }
        Some((self.sum_sq / (n - 2) as f64).sqrt())
    }

    pub fn summary(&self) -> Option<VarianceSummary> {
        Some(VarianceSummary {
            mean: self.mean()?,
            stdev: self.stdev()?,
            sample_size: self.consumed(),
        })
    }
}

impl StreamingReducer for OnlineVariance {
    type Input = Option<f64>;
    type Output = f64;

    /// Absent values are skipped and do not count toward the sample size.
    fn step(&mut self, value: Option<f64>) {
        if let Some(v) = value {
            self.push(v);
        }
    }

    fn finalize(&self) -> Option<f64> {
        self.stdev()
    }
}

/// Single-pass group-by: one independent reducer per key.
pub fn reduce_groups<K, R, I>(items: I) -> BTreeMap<K, R>
where
    K: Ord,
    R: StreamingReducer,
    I: IntoIterator<Item = (K, R::Input)>,
{
    let mut groups: BTreeMap<K, R> = BTreeMap::new();
    for (key, value) in items {
        groups.entry(key).or_default().step(value);
    }
    groups
}

/// SQL aggregate `stdev(x)` backed by [`OnlineVariance`].
pub struct StdevAggregate;

impl Aggregate<OnlineVariance, Option<f64>> for StdevAggregate {
    fn init(&self, _ctx: &mut Context<'_>) -> rusqlite::Result<OnlineVariance> {
        Ok(OnlineVariance::new())
    }

    fn step(&self, ctx: &mut Context<'_>, acc: &mut OnlineVariance) -> rusqlite::Result<()> {
        // Text and blobs are treated like NULL.
        let value = match ctx.get_raw(0) {
            ValueRef::Integer(i) => Some(i as f64),
            ValueRef::Real(f) => Some(f),
            _ => None,
        };
        StreamingReducer::step(acc, value);
        Ok(())
    }

    fn finalize(
        &self,
        _ctx: &mut Context<'_>,
        acc: Option<OnlineVariance>,
    ) -> rusqlite::Result<Option<f64>> {
        Ok(acc.and_then(|a| a.stdev()))
    }
}

/// Register `stdev(x)` on a connection.
pub fn register_sql_aggregates(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_aggregate_function(
        "stdev",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        StdevAggregate,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(values: &[f64]) -> OnlineVariance {
        let mut acc = OnlineVariance::new();
        for v in values {
            acc.push(*v);
        }
        acc
    }

    #[test]
    fn test_three_values_use_k_minus_two() {
        let acc = feed(&[10.0, 20.0, 30.0]);
        assert_eq!(acc.mean(), Some(20.0));
        // Squared deviations: 100 + 0 + 100, divided by (3 - 2).
        assert!((acc.sum_of_squares() - 200.0).abs() < 1e-9);
        let sd = acc.stdev().unwrap();
        assert!((sd - 200.0_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_undefined_below_three_values() {
        assert_eq!(OnlineVariance::new().stdev(), None);
        assert_eq!(OnlineVariance::new().mean(), None);
        assert_eq!(feed(&[1.0]).stdev(), None);
        assert_eq!(feed(&[1.0, 5.0]).stdev(), None);
        assert!(feed(&[1.0, 5.0]).summary().is_none());
    }

    #[test]
    fn test_nulls_are_skipped() {
        let mut acc = OnlineVariance::new();
        for v in [Some(10.0), None, Some(20.0), None, Some(30.0)] {
            StreamingReducer::step(&mut acc, v);
        }
        assert_eq!(acc.consumed(), 3);
        assert_eq!(acc, feed(&[10.0, 20.0, 30.0]));
    }

    #[test]
    fn test_order_tolerant() {
        let a = feed(&[10.0, 12.0, 11.0, 50.0]).summary().unwrap();
        let b = feed(&[50.0, 11.0, 10.0, 12.0]).summary().unwrap();
        assert!((a.mean - 20.75).abs() < 1e-9);
        assert!((a.mean - b.mean).abs() < 1e-9);
        assert!((a.stdev - b.stdev).abs() < 1e-9);
        assert_eq!(a.sample_size, 4);
    }

    #[test]
    fn test_reduce_groups() {
        let rows = vec![
            (1_i64, Some(10.0)),
            (2, Some(1.0)),
            (1, Some(20.0)),
            (1, None),
            (1, Some(30.0)),
        ];
        let groups: BTreeMap<i64, OnlineVariance> = reduce_groups(rows);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[&1].consumed(), 3);
        assert!(groups[&1].finalize().is_some());
        assert!(groups[&2].finalize().is_none());
    }

    #[test]
    fn test_sql_aggregate_matches_reducer() {
        let conn = Connection::open_in_memory().unwrap();
        register_sql_aggregates(&conn).unwrap();
        conn.execute_batch(
            "CREATE TABLE v (g INTEGER, x REAL);
             INSERT INTO v VALUES (1, 10), (1, 20), (1, NULL), (1, 30), (2, 5), (2, 6);",
        )
        .unwrap();

        let sd: Option<f64> = conn
            .query_row("SELECT stdev(x) FROM v WHERE g = 1", [], |r| r.get(0))
            .unwrap();
        assert!((sd.unwrap() - 200.0_f64.sqrt()).abs() < 1e-9);

        let small: Option<f64> = conn
            .query_row("SELECT stdev(x) FROM v WHERE g = 2", [], |r| r.get(0))
            .unwrap();
        assert_eq!(small, None);

        let empty: Option<f64> = conn
            .query_row("SELECT stdev(x) FROM v WHERE g = 3", [], |r| r.get(0))
            .unwrap();
        assert_eq!(empty, None);
    }
}
