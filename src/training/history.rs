use chrono::{
    DateTime,
    Utc,
};

use crate::core::{
    RoundMetrics,
    RoundOutcome,
    RoundRecord,
};

/// Append-only record of completed rounds since the last reset.
///
/// Record `i` (0-based) always carries `round == i + 1`; the next round number is
/// derived from the length, so there is no separate counter to drift.
#[derive(Debug, Default, Clone)]
pub struct TrainingHistoryStore {
    records: Vec<RoundRecord>,
}

impl TrainingHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn current_round(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn next_round(&self) -> u32 {
        self.current_round() + 1
    }

    pub fn last(&self) -> Option<&RoundRecord> {
        self.records.last()
    }

    pub fn records(&self) -> &[RoundRecord] {
        &self.records
    }

    pub fn snapshot(&self) -> Vec<RoundRecord> {
        self.records.clone()
    }

    /// Number the outcome as the next round and append it.
    pub fn append(&mut self, outcome: &RoundOutcome, completed_at: DateTime<Utc>) -> &RoundRecord {
        let improvement = self
            .records
            .last()
            .map(|previous| outcome.metrics - previous.metrics)
            .unwrap_or_default();

        let record = RoundRecord {
            round: self.next_round(),
            metrics: outcome.metrics,
            improvement,
            participating_hospitals: outcome.participating_hospitals,
            samples_trained: outcome.samples_trained,
            duration_seconds: outcome.duration_seconds,
            completed_at,
        };

        self.records.push(record);
        &self.records[self.records.len() - 1]
    }

    /// Replace the contents with externally sourced records.
    ///
    /// Rejected unless rounds run 1..=n without gaps; improvements are recomputed.
    pub fn replace(&mut self, records: Vec<RoundRecord>) -> Result<(), String> {
        for (index, record) in records.iter().enumerate() {
            let expected = index as u32 + 1;
            if record.round != expected {
                return Err(format!(
                    "history is not gapless: expected round {expected}, found {}",
                    record.round
                ));
            }
        }

        let mut previous: Option<RoundMetrics> = None;
        self.records = records
            .into_iter()
            .map(|mut record| {
                record.improvement =
                    previous.map(|prev| record.metrics - prev).unwrap_or_default();
                previous = Some(record.metrics);
                record
            })
            .collect();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn total_samples(&self) -> u64 {
        self.records.iter().map(|record| record.samples_trained).sum()
    }
}
