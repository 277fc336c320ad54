use std::{
    fmt,
    ops::Sub,
};

use chrono::{
    DateTime,
    Utc,
};
use serde::{
    Deserialize,
    Serialize,
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HospitalId(String);

impl HospitalId {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for HospitalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HospitalId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientId(String);

impl PatientId {
    pub fn new<S: Into<String>>(value: S) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PatientId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Summary metrics reported by the remote aggregator for one round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundMetrics {
    pub accuracy: f64,
    #[serde(alias = "f1")]
    pub f1_score: f64,
    pub loss: f64,
}

impl RoundMetrics {
    pub fn new(accuracy: f64, f1_score: f64, loss: f64) -> Self {
        Self { accuracy, f1_score, loss }
    }
}

impl Sub for RoundMetrics {
    type Output = RoundMetrics;

    fn sub(self, rhs: RoundMetrics) -> RoundMetrics {
        RoundMetrics {
            accuracy: self.accuracy - rhs.accuracy,
            f1_score: self.f1_score - rhs.f1_score,
            loss: self.loss - rhs.loss,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundRecord {
    pub round: u32,
    pub metrics: RoundMetrics,
    pub improvement: RoundMetrics, // Delta against the previous record, zero for round 1
    pub participating_hospitals: u32,
    pub samples_trained: u64,
    pub duration_seconds: f64,
    pub completed_at: DateTime<Utc>,
}

/// Result of one remote round execution, before it is numbered locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundOutcome {
    pub round: u32,
    pub metrics: RoundMetrics,
    pub participating_hospitals: u32,
    pub samples_trained: u64,
    #[serde(alias = "training_time_seconds")]
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HospitalSummary {
    #[serde(alias = "node_id")]
    pub hospital_id: HospitalId,
    #[serde(alias = "hospital_name")]
    pub name: String,
    #[serde(default)]
    pub district: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentMetrics {
    pub round: u32,
    #[serde(flatten)]
    pub metrics: RoundMetrics,
    pub total_samples_trained: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpDelivery {
    pub delivered_to: String,
    pub code_ttl_seconds: u64,
}

/// Reference to the ledger transaction that recorded a consent change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    #[serde(alias = "transaction_hash")]
    pub transaction_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentStatus {
    pub has_consent: bool,
    #[serde(default, alias = "transaction_hash")]
    pub transaction_ref: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_subtract_fieldwise() {
        let delta = RoundMetrics::new(0.97, 0.9, 0.2) - RoundMetrics::new(0.6, 0.5, 0.5);
        assert!((delta.accuracy - 0.37).abs() < 1e-9);
        assert!((delta.f1_score - 0.4).abs() < 1e-9);
        assert!((delta.loss + 0.3).abs() < 1e-9);
    }

    #[test]
    fn round_outcome_accepts_backend_field_names() {
        let json = r#"{
            "round": 4,
            "metrics": { "accuracy": 0.81, "f1_score": 0.79, "loss": 0.31 },
            "participating_hospitals": 3,
            "samples_trained": 3600,
            "training_time_seconds": 22.5
        }"#;
        let outcome: RoundOutcome = serde_json::from_str(json).unwrap();
        assert_eq!(outcome.round, 4);
        assert_eq!(outcome.metrics.f1_score, 0.79);
        assert_eq!(outcome.duration_seconds, 22.5);
    }

    #[test]
    fn blank_ids_are_detected() {
        assert!(PatientId::new("  ").is_blank());
        assert!(!HospitalId::new("H1").is_blank());
    }
}
