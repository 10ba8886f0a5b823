//! Minimal stream operators.
//!
//! The modification machinery doesn't care what operators compute; these are
//! the small ones the engine ships for wiring and for tests.

use weir::DataType;

use crate::chain::{Collector, StreamOperator};
use crate::payload::StreamRecord;

/// Forwards every record unchanged.
#[derive(Debug, Default)]
pub struct Identity;

impl StreamOperator for Identity {
    fn on_record(&mut self, record: StreamRecord, out: &mut dyn Collector) {
        out.collect(record);
    }
}

/// Per-column filter condition; a column without one matches any value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterCondition {
    Equals(DataType),
    NotEquals(DataType),
}

impl FilterCondition {
    fn matches(&self, value: &DataType) -> bool {
        match *self {
            FilterCondition::Equals(ref want) => value == want,
            FilterCondition::NotEquals(ref want) => value != want,
        }
    }
}

/// Filters incoming records according to per-column conditions.
#[derive(Debug, Clone)]
pub struct Filter {
    conditions: Vec<Option<FilterCondition>>,
}

impl Filter {
    /// Construct a new filter operator. The `conditions` vector must have as
    /// many elements as the records have columns; columns set to `None` match
    /// any value.
    pub fn new(conditions: &[Option<FilterCondition>]) -> Filter {
        Filter {
            conditions: Vec::from(conditions),
        }
    }
}

impl StreamOperator for Filter {
    fn on_record(&mut self, record: StreamRecord, out: &mut dyn Collector) {
        debug_assert_eq!(record.row.len(), self.conditions.len());
        let keep = record
            .row
            .iter()
            .zip(self.conditions.iter())
            .all(|(value, condition)| match *condition {
                Some(ref c) => c.matches(value),
                None => true,
            });
        if keep {
            out.collect(record);
        }
    }
}

/// Keeps only the named columns, in order.
#[derive(Debug, Clone)]
pub struct Project {
    columns: Vec<usize>,
}

impl Project {
    pub fn new(columns: &[usize]) -> Project {
        Project {
            columns: Vec::from(columns),
        }
    }
}

impl StreamOperator for Project {
    fn on_record(&mut self, record: StreamRecord, out: &mut dyn Collector) {
        let row = self
            .columns
            .iter()
            .map(|&c| record.row[c].clone())
            .collect();
        out.collect(StreamRecord {
            row,
            timestamp: record.timestamp,
        });
    }
}
