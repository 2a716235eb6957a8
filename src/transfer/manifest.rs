//! Collection of per-part acknowledgments into an ordered manifest.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{PartResult, TransferError};

/// Accumulates [PartResult]s from concurrently finishing workers and yields
/// them sorted by part number. Completion order never leaks into the
/// manifest.
#[derive(Debug, Default)]
pub struct ManifestCollector {
    parts: Mutex<BTreeMap<i32, PartResult>>,
}

impl ManifestCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one verified part. A second result for the same part number is
    /// rejected: the planner never issues duplicates, so one arriving here
    /// means the dispatch machinery is broken.
    pub fn put(&self, result: PartResult) -> Result<(), TransferError> {
        let mut parts = self.parts.lock().unwrap_or_else(|e| e.into_inner());
        let number = result.number;
        if parts.insert(number, result).is_some() {
            return Err(TransferError::DuplicatePart(number));
        }
        Ok(())
    }

    /// Number of parts collected so far.
    pub fn len(&self) -> usize {
        self.parts.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consume the collector, yielding all results in part-number order.
    pub fn drain_sorted(self) -> Vec<PartResult> {
        self.parts
            .into_inner()
            .unwrap_or_else(|e| e.into_inner())
            .into_values()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(number: i32) -> PartResult {
        PartResult {
            number,
            e_tag: format!("\"etag-{number}\""),
        }
    }

    #[test]
    fn drains_in_part_number_order() {
        let collector = ManifestCollector::new();
        for number in [3, 1, 4, 2] {
            collector.put(result(number)).unwrap();
        }
        assert_eq!(collector.len(), 4);

        let numbers: Vec<_> = collector
            .drain_sorted()
            .into_iter()
            .map(|part| part.number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
    }

    #[test]
    fn rejects_duplicate_part_number() {
        let collector = ManifestCollector::new();
        collector.put(result(7)).unwrap();
        assert!(matches!(
            collector.put(result(7)),
            Err(TransferError::DuplicatePart(7))
        ));
    }

    #[test]
    fn empty_collector_drains_empty() {
        let collector = ManifestCollector::new();
        assert!(collector.is_empty());
        assert!(collector.drain_sorted().is_empty());
    }
}
