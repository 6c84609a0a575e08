//! Metrics collectors
//!
//! One collector per column, chosen by the column's type. A collector sees
//! every value of one scan (NULLs included) and is finalized once.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::values::{Type, Value};

/// Distinct strings tracked before the count is reported as a lower bound
const MAX_TRACKED_DISTINCT: usize = 10_000;

/// Summary of the values of one column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnMetrics {
    Boolean {
        entries: u64,
        nulls: u64,
        trues: u64,
    },
    Numeric {
        entries: u64,
        nulls: u64,
        min: Option<f64>,
        max: Option<f64>,
        mean: Option<f64>,
        variance: Option<f64>,
    },
    String {
        entries: u64,
        nulls: u64,
        min_length: Option<usize>,
        max_length: Option<usize>,
        distinct: u64,
    },
    Vector {
        entries: u64,
        nulls: u64,
        dimension: usize,
        min: Vec<f64>,
        max: Vec<f64>,
        mean: Vec<f64>,
    },
}

impl ColumnMetrics {
    /// Values seen, NULLs included
    pub fn entries(&self) -> u64 {
        match self {
            ColumnMetrics::Boolean { entries, .. }
            | ColumnMetrics::Numeric { entries, .. }
            | ColumnMetrics::String { entries, .. }
            | ColumnMetrics::Vector { entries, .. } => *entries,
        }
    }

    pub fn nulls(&self) -> u64 {
        match self {
            ColumnMetrics::Boolean { nulls, .. }
            | ColumnMetrics::Numeric { nulls, .. }
            | ColumnMetrics::String { nulls, .. }
            | ColumnMetrics::Vector { nulls, .. } => *nulls,
        }
    }
}

/// Accumulates the values of one column
pub trait MetricsCollector: Send {
    fn receive(&mut self, value: Option<&Value>);

    fn finalize(self: Box<Self>) -> ColumnMetrics;
}

/// A collector suited to values of `ty`
pub fn collector_for(ty: Type) -> Box<dyn MetricsCollector> {
    match ty {
        Type::Boolean => Box::new(BooleanCollector::default()),
        Type::Int | Type::Long | Type::Float | Type::Double => Box::new(NumericCollector::default()),
        Type::String => Box::new(StringCollector::default()),
        _ => Box::new(VectorCollector::new(ty.dimension().unwrap_or(0))),
    }
}

#[derive(Debug, Default)]
pub struct BooleanCollector {
    entries: u64,
    nulls: u64,
    trues: u64,
}

impl MetricsCollector for BooleanCollector {
    fn receive(&mut self, value: Option<&Value>) {
        self.entries += 1;
        match value {
            Some(Value::Boolean(true)) => self.trues += 1,
            Some(_) => {}
            None => self.nulls += 1,
        }
    }

    fn finalize(self: Box<Self>) -> ColumnMetrics {
        ColumnMetrics::Boolean {
            entries: self.entries,
            nulls: self.nulls,
            trues: self.trues,
        }
    }
}

/// Min, max, mean and population variance (Welford)
#[derive(Debug, Default)]
pub struct NumericCollector {
    entries: u64,
    nulls: u64,
    count: u64,
    min: Option<f64>,
    max: Option<f64>,
    mean: f64,
    m2: f64,
}

impl MetricsCollector for NumericCollector {
    fn receive(&mut self, value: Option<&Value>) {
        self.entries += 1;
        let Some(x) = value.and_then(Value::as_f64) else {
            if value.is_none() {
                self.nulls += 1;
            }
            return;
        };
        self.min = Some(self.min.map_or(x, |m| m.min(x)));
        self.max = Some(self.max.map_or(x, |m| m.max(x)));
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn finalize(self: Box<Self>) -> ColumnMetrics {
        let (mean, variance) = if self.count == 0 {
            (None, None)
        } else {
            (Some(self.mean), Some(self.m2 / self.count as f64))
        };
        ColumnMetrics::Numeric {
            entries: self.entries,
            nulls: self.nulls,
            min: self.min,
            max: self.max,
            mean,
            variance,
        }
    }
}

#[derive(Debug, Default)]
pub struct StringCollector {
    entries: u64,
    nulls: u64,
    min_length: Option<usize>,
    max_length: Option<usize>,
    distinct: HashSet<String>,
    overflowed: u64,
}

impl MetricsCollector for StringCollector {
    fn receive(&mut self, value: Option<&Value>) {
        self.entries += 1;
        let Some(Value::String(s)) = value else {
            if value.is_none() {
                self.nulls += 1;
            }
            return;
        };
        let len = s.chars().count();
        self.min_length = Some(self.min_length.map_or(len, |m| m.min(len)));
        self.max_length = Some(self.max_length.map_or(len, |m| m.max(len)));
        if self.distinct.len() < MAX_TRACKED_DISTINCT {
            self.distinct.insert(s.clone());
        } else if !self.distinct.contains(s) {
            self.overflowed += 1;
        }
    }

    fn finalize(self: Box<Self>) -> ColumnMetrics {
        ColumnMetrics::String {
            entries: self.entries,
            nulls: self.nulls,
            min_length: self.min_length,
            max_length: self.max_length,
            distinct: self.distinct.len() as u64 + self.overflowed.min(1),
        }
    }
}

/// Component-wise min, max and mean
#[derive(Debug)]
pub struct VectorCollector {
    entries: u64,
    nulls: u64,
    count: u64,
    dimension: usize,
    min: Vec<f64>,
    max: Vec<f64>,
    sum: Vec<f64>,
}

impl VectorCollector {
    pub fn new(dimension: usize) -> Self {
        Self {
            entries: 0,
            nulls: 0,
            count: 0,
            dimension,
            min: vec![f64::INFINITY; dimension],
            max: vec![f64::NEG_INFINITY; dimension],
            sum: vec![0.0; dimension],
        }
    }
}

impl MetricsCollector for VectorCollector {
    fn receive(&mut self, value: Option<&Value>) {
        self.entries += 1;
        let Some(vector) = value.and_then(Value::as_f64_vector) else {
            if value.is_none() {
                self.nulls += 1;
            }
            return;
        };
        if vector.len() != self.dimension {
            return;
        }
        self.count += 1;
        for (i, x) in vector.into_iter().enumerate() {
            self.min[i] = self.min[i].min(x);
            self.max[i] = self.max[i].max(x);
            self.sum[i] += x;
        }
    }

    fn finalize(self: Box<Self>) -> ColumnMetrics {
        let (min, max, mean) = if self.count == 0 {
            (Vec::new(), Vec::new(), Vec::new())
        } else {
            let n = self.count as f64;
            let mean = self.sum.iter().map(|s| s / n).collect();
            (self.min, self.max, mean)
        };
        ColumnMetrics::Vector {
            entries: self.entries,
            nulls: self.nulls,
            dimension: self.dimension,
            min,
            max,
            mean,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(ty: Type, values: &[Option<Value>]) -> ColumnMetrics {
        let mut collector = collector_for(ty);
        for v in values {
            collector.receive(v.as_ref());
        }
        collector.finalize()
    }

    #[test]
    fn test_numeric_metrics() {
        let metrics = collect(
            Type::Int,
            &[Some(Value::Int(2)), None, Some(Value::Int(4)), Some(Value::Int(6))],
        );
        match metrics {
            ColumnMetrics::Numeric {
                entries,
                nulls,
                min,
                max,
                mean,
                variance,
            } => {
                assert_eq!(entries, 4);
                assert_eq!(nulls, 1);
                assert_eq!(min, Some(2.0));
                assert_eq!(max, Some(6.0));
                assert_eq!(mean, Some(4.0));
                let variance = variance.unwrap();
                assert!((variance - 8.0 / 3.0).abs() < 1e-9);
            }
            other => panic!("unexpected metrics {:?}", other),
        }
    }

    #[test]
    fn test_string_metrics() {
        let metrics = collect(
            Type::String,
            &[
                Some(Value::String("ab".into())),
                Some(Value::String("abcd".into())),
                Some(Value::String("ab".into())),
            ],
        );
        assert_eq!(
            metrics,
            ColumnMetrics::String {
                entries: 3,
                nulls: 0,
                min_length: Some(2),
                max_length: Some(4),
                distinct: 2,
            }
        );
    }

    #[test]
    fn test_vector_metrics() {
        let metrics = collect(
            Type::FloatVector(2),
            &[
                Some(Value::FloatVector(vec![1.0, 4.0])),
                Some(Value::FloatVector(vec![3.0, 0.0])),
            ],
        );
        match metrics {
            ColumnMetrics::Vector { min, max, mean, .. } => {
                assert_eq!(min, vec![1.0, 0.0]);
                assert_eq!(max, vec![3.0, 4.0]);
                assert_eq!(mean, vec![2.0, 2.0]);
            }
            other => panic!("unexpected metrics {:?}", other),
        }
    }

    #[test]
    fn test_empty_boolean_column() {
        let metrics = collect(Type::Boolean, &[]);
        assert_eq!(metrics.entries(), 0);
        assert_eq!(metrics.nulls(), 0);
    }
}
