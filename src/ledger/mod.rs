//! Remote ledger / FL service boundary.
//!
//! Both controllers talk to the backend exclusively through
//! [`RemoteLedgerClient`]; [`api::HttpLedgerClient`] is the production binding
//! and [`fake::FakeLedgerClient`] an in-memory stand-in.

pub mod api;
pub mod fake;

use std::collections::BTreeSet;

use async_trait::async_trait;
use thiserror::Error;

pub use api::HttpLedgerClient;
pub use fake::FakeLedgerClient;

use crate::core::{
    ConsentStatus,
    CurrentMetrics,
    HospitalId,
    HospitalSummary,
    LedgerReceipt,
    OtpDelivery,
    PatientId,
    RoundOutcome,
    RoundRecord,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("ledger rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid verification code: {0}")]
    InvalidCode(String),

    #[error("verification code expired: {0}")]
    CodeExpired(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for LedgerError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            LedgerError::Malformed(error.to_string())
        } else {
            LedgerError::Transport(error.to_string())
        }
    }
}

#[async_trait]
pub trait RemoteLedgerClient: Send + Sync {
    async fn list_verified_hospitals(&self) -> Result<Vec<HospitalSummary>, LedgerError>;

    async fn execute_round(
        &self,
        hospital_ids: &BTreeSet<HospitalId>,
    ) -> Result<RoundOutcome, LedgerError>;

    async fn fetch_current_metrics(&self) -> Result<CurrentMetrics, LedgerError>;

    async fn fetch_history(&self) -> Result<Vec<RoundRecord>, LedgerError>;

    async fn reset_training(&self) -> Result<(), LedgerError>;

    async fn request_otp(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
    ) -> Result<OtpDelivery, LedgerError>;

    async fn verify_otp_and_grant(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
        code: &str,
    ) -> Result<LedgerReceipt, LedgerError>;

    async fn revoke_consent(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
    ) -> Result<LedgerReceipt, LedgerError>;

    async fn check_consent(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
    ) -> Result<ConsentStatus, LedgerError>;
}
