use std::{
    collections::BTreeSet,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{
    DateTime,
    NaiveDateTime,
    Utc,
};
use reqwest::{
    Client,
    Response,
};
use serde::{
    de::DeserializeOwned,
    Deserialize,
    Serialize,
};

use super::{
    LedgerError,
    RemoteLedgerClient,
};
use crate::{
    core::{
        ConsentStatus,
        ConsoleError,
        CurrentMetrics,
        HospitalId,
        HospitalSummary,
        LedgerReceipt,
        OtpDelivery,
        PatientId,
        RoundMetrics,
        RoundOutcome,
        RoundRecord,
    },
    settings::ConsoleSettings,
};

const DEFAULT_OTP_TTL_SECS: u64 = 300;

#[derive(Debug, Serialize)]
struct RoundRequest<'a> {
    hospital_ids: Vec<&'a str>,
}

#[derive(Debug, Serialize)]
struct ConsentRequest<'a> {
    patient_id: &'a str,
    hospital_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    otp: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct OtpResponse {
    #[serde(default)]
    delivered_to: String,
    #[serde(default = "default_otp_ttl")]
    code_ttl_seconds: u64,
}

fn default_otp_ttl() -> u64 {
    DEFAULT_OTP_TTL_SECS
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    round: u32,
    #[serde(default)]
    timestamp: Option<String>,
    metrics: RoundMetrics,
    participating_hospitals: u32,
    samples_trained: u64,
    #[serde(alias = "training_time_seconds")]
    duration_seconds: f64,
}

// FastAPI error body
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

/// HTTP binding of [`RemoteLedgerClient`] against the console backend.
pub struct HttpLedgerClient {
    client: Client,
    base_url: String,
}

impl HttpLedgerClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ConsoleError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConsoleError::Custom(format!("HTTP client build failed: {e}")))?;

        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    pub fn from_settings(settings: &ConsoleSettings) -> Result<Self, ConsoleError> {
        Self::new(&settings.api_base_url, settings.request_timeout())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, LedgerError> {
        let response = self.client.get(self.url(path)).send().await?;
        read_json(response).await
    }

    async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, LedgerError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        read_json(response).await
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, LedgerError> {
    let status = response.status();
    if !status.is_success() {
        let message = error_detail(response).await;
        return Err(LedgerError::Rejected { status: status.as_u16(), message });
    }
    Ok(response.json::<T>().await?)
}

async fn error_detail(response: Response) -> String {
    let status = response.status();
    match response.text().await {
        Ok(text) => match serde_json::from_str::<ErrorBody>(&text) {
            Ok(ErrorBody { detail: serde_json::Value::String(detail) }) => detail,
            Ok(ErrorBody { detail }) => detail.to_string(),
            Err(_) if !text.trim().is_empty() => text,
            Err(_) => format!("HTTP error {status}"),
        },
        Err(e) => format!("HTTP error {status}: {e}"),
    }
}

/// Decide what a rejected verification means for the consent session.
fn classify_verification_failure(status: u16, message: String) -> LedgerError {
    if !matches!(status, 400 | 401 | 403) {
        return LedgerError::Rejected { status, message };
    }

    if message.to_lowercase().contains("expired") {
        LedgerError::CodeExpired(message)
    } else {
        LedgerError::InvalidCode(message)
    }
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    // Python isoformat() without an offset
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok().map(|naive| naive.and_utc())
}

/// Number the wire history and recompute improvements the same way the local store does.
fn records_from_history(entries: Vec<HistoryEntry>) -> Vec<RoundRecord> {
    let mut records: Vec<RoundRecord> = Vec::with_capacity(entries.len());
    for entry in entries {
        let improvement = records
            .last()
            .map(|previous| entry.metrics - previous.metrics)
            .unwrap_or_default();

        records.push(RoundRecord {
            round: entry.round,
            metrics: entry.metrics,
            improvement,
            participating_hospitals: entry.participating_hospitals,
            samples_trained: entry.samples_trained,
            duration_seconds: entry.duration_seconds,
            completed_at: parse_timestamp(entry.timestamp.as_deref()).unwrap_or_else(Utc::now),
        });
    }
    records
}

#[async_trait]
impl RemoteLedgerClient for HttpLedgerClient {
    async fn list_verified_hospitals(&self) -> Result<Vec<HospitalSummary>, LedgerError> {
        self.get_json("/api/fl/hospitals").await
    }

    async fn execute_round(
        &self,
        hospital_ids: &BTreeSet<HospitalId>,
    ) -> Result<RoundOutcome, LedgerError> {
        let body = RoundRequest { hospital_ids: hospital_ids.iter().map(|id| id.as_str()).collect() };
        self.post_json("/api/fl/round", &body).await
    }

    async fn fetch_current_metrics(&self) -> Result<CurrentMetrics, LedgerError> {
        self.get_json("/api/fl/metrics").await
    }

    async fn fetch_history(&self) -> Result<Vec<RoundRecord>, LedgerError> {
        let entries: Vec<HistoryEntry> = self.get_json("/api/fl/history").await?;
        Ok(records_from_history(entries))
    }

    async fn reset_training(&self) -> Result<(), LedgerError> {
        let _: serde_json::Value = self.post_json("/api/fl/reset", &serde_json::json!({})).await?;
        Ok(())
    }

    async fn request_otp(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
    ) -> Result<OtpDelivery, LedgerError> {
        let body = ConsentRequest {
            patient_id: patient_id.as_str(),
            hospital_id: hospital_id.as_str(),
            otp: None,
        };
        let response: OtpResponse =
            self.post_json("/blockchain/consent/request-otp", &body).await?;

        Ok(OtpDelivery {
            delivered_to: response.delivered_to,
            code_ttl_seconds: response.code_ttl_seconds,
        })
    }

    async fn verify_otp_and_grant(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
        code: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        let body = ConsentRequest {
            patient_id: patient_id.as_str(),
            hospital_id: hospital_id.as_str(),
            otp: Some(code),
        };

        match self.post_json("/blockchain/consent/grant", &body).await {
            Err(LedgerError::Rejected { status, message }) => {
                Err(classify_verification_failure(status, message))
            }
            other => other,
        }
    }

    async fn revoke_consent(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
    ) -> Result<LedgerReceipt, LedgerError> {
        let body = ConsentRequest {
            patient_id: patient_id.as_str(),
            hospital_id: hospital_id.as_str(),
            otp: None,
        };
        self.post_json("/blockchain/consent/revoke", &body).await
    }

    async fn check_consent(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
    ) -> Result<ConsentStatus, LedgerError> {
        let path = format!("/blockchain/consent/check/{}/{}", patient_id, hospital_id);
        self.get_json(&path).await
    }
}
