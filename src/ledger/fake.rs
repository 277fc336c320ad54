use std::{
    collections::{
        BTreeSet,
        HashMap,
        VecDeque,
    },
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};

use async_trait::async_trait;
use chrono::{
    Duration,
    Utc,
};
use rand::Rng;
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::{
    LedgerError,
    RemoteLedgerClient,
};
use crate::core::{
    ConsentStatus,
    ManualClock,
    CurrentMetrics,
    HospitalId,
    HospitalSummary,
    LedgerReceipt,
    OtpDelivery,
    PatientId,
    RoundMetrics,
    RoundOutcome,
    RoundRecord,
};

const SAMPLES_PER_HOSPITAL: u64 = 1_000;
const FAKE_OTP_TTL_SECS: u64 = 300;

type Pair = (PatientId, HospitalId);

#[derive(Default)]
struct FakeState {
    hospitals: Vec<HospitalSummary>,
    scripted_rounds: VecDeque<Result<RoundMetrics, LedgerError>>,
    fallback_metrics: RoundMetrics,
    executed_rounds: u32,
    total_samples: u64,
    last_metrics: RoundMetrics,
    history: Vec<RoundRecord>,
    round_calls: Vec<BTreeSet<HospitalId>>,
    reset_failure: Option<LedgerError>,
    otp_failure: Option<LedgerError>,
    verify_failure: Option<LedgerError>,
    codes: HashMap<Pair, String>,
    scripted_codes: VecDeque<String>,
    otp_ttl_secs: u64,
    otp_latency: Option<(Arc<ManualClock>, Duration)>,
    otp_requests: u32,
    verifications: u32,
    grants: HashMap<Pair, String>,
}

/// In-memory ledger used by tests and the offline demo.
///
/// Rounds return scripted metrics in order, then repeat the fallback. Codes are
/// random six-digit strings that can be read back with [`FakeLedgerClient::issued_code`],
/// mirroring the backend's demo mode that prints the OTP instead of mailing it.
pub struct FakeLedgerClient {
    state: Mutex<FakeState>,
    round_gate: Option<Arc<Semaphore>>,
    verify_gate: Option<Arc<Semaphore>>,
}

impl Default for FakeLedgerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLedgerClient {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                fallback_metrics: RoundMetrics::new(0.5, 0.48, 0.6),
                otp_ttl_secs: FAKE_OTP_TTL_SECS,
                ..FakeState::default()
            }),
            round_gate: None,
            verify_gate: None,
        }
    }

    /// Hold every round call until a permit is added to the returned semaphore.
    pub fn with_round_gate(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.round_gate = Some(gate.clone());
        (self, gate)
    }

    /// Hold every verification until a permit is added to the returned semaphore.
    pub fn with_verification_gate(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.verify_gate = Some(gate.clone());
        (self, gate)
    }

    /// Move `clock` forward by `latency` while each OTP request is being served.
    pub fn with_otp_latency(self, clock: Arc<ManualClock>, latency: Duration) -> Self {
        self.lock().otp_latency = Some((clock, latency));
        self
    }

    pub fn with_hospitals(self, hospitals: Vec<HospitalSummary>) -> Self {
        self.lock().hospitals = hospitals;
        self
    }

    pub fn with_accuracies(self, accuracies: &[f64]) -> Self {
        {
            let mut state = self.lock();
            for &accuracy in accuracies {
                state.scripted_rounds.push_back(Ok(RoundMetrics::new(
                    accuracy,
                    accuracy * 0.95,
                    1.0 - accuracy,
                )));
            }
        }
        self
    }

    pub fn push_round(&self, result: Result<RoundMetrics, LedgerError>) {
        self.lock().scripted_rounds.push_back(result);
    }

    /// Codes handed out by the next OTP requests, in order, before falling back to random ones.
    pub fn script_codes(&self, codes: &[&str]) {
        self.lock().scripted_codes.extend(codes.iter().map(|code| code.to_string()));
    }

    pub fn set_otp_ttl_secs(&self, ttl_secs: u64) {
        self.lock().otp_ttl_secs = ttl_secs;
    }

    pub fn set_fallback_metrics(&self, metrics: RoundMetrics) {
        self.lock().fallback_metrics = metrics;
    }

    pub fn fail_next_reset(&self, error: LedgerError) {
        self.lock().reset_failure = Some(error);
    }

    pub fn fail_next_otp_request(&self, error: LedgerError) {
        self.lock().otp_failure = Some(error);
    }

    pub fn fail_next_verification(&self, error: LedgerError) {
        self.lock().verify_failure = Some(error);
    }

    pub fn round_calls(&self) -> Vec<BTreeSet<HospitalId>> {
        self.lock().round_calls.clone()
    }

    pub fn round_call_count(&self) -> usize {
        self.lock().round_calls.len()
    }

    pub fn otp_request_count(&self) -> u32 {
        self.lock().otp_requests
    }

    pub fn verification_count(&self) -> u32 {
        self.lock().verifications
    }

    pub fn issued_code(&self, patient_id: &PatientId, hospital_id: &HospitalId) -> Option<String> {
        self.lock().codes.get(&(patient_id.clone(), hospital_id.clone())).cloned()
    }

    pub fn has_grant(&self, patient_id: &PatientId, hospital_id: &HospitalId) -> bool {
        self.lock().grants.contains_key(&(patient_id.clone(), hospital_id.clone()))
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn transaction_ref() -> String {
    format!("0x{}", Uuid::new_v4().simple())
}

#[async_trait]
impl RemoteLedgerClient for FakeLedgerClient {
    async fn list_verified_hospitals(&self) -> Result<Vec<HospitalSummary>, LedgerError> {
        Ok(self.lock().hospitals.clone())
    }

    async fn execute_round(
        &self,
        hospital_ids: &BTreeSet<HospitalId>,
    ) -> Result<RoundOutcome, LedgerError> {
        self.lock().round_calls.push(hospital_ids.clone());

        if let Some(gate) = &self.round_gate {
            gate.acquire()
                .await
                .map_err(|e| LedgerError::Transport(format!("round gate closed: {e}")))?
                .forget();
        }

        let mut state = self.lock();
        let scripted = state.scripted_rounds.pop_front();
        let metrics = match scripted {
            Some(result) => result?,
            None => state.fallback_metrics,
        };

        let participating_hospitals = hospital_ids.len() as u32;
        let samples_trained = participating_hospitals as u64 * SAMPLES_PER_HOSPITAL;
        state.executed_rounds += 1;
        state.total_samples += samples_trained;
        let improvement = state
            .history
            .last()
            .map(|previous| metrics - previous.metrics)
            .unwrap_or_default();
        let outcome = RoundOutcome {
            round: state.executed_rounds,
            metrics,
            participating_hospitals,
            samples_trained,
            duration_seconds: 0.0,
        };
        state.last_metrics = metrics;
        state.history.push(RoundRecord {
            round: outcome.round,
            metrics,
            improvement,
            participating_hospitals,
            samples_trained,
            duration_seconds: outcome.duration_seconds,
            completed_at: Utc::now(),
        });

        Ok(outcome)
    }

    async fn fetch_current_metrics(&self) -> Result<CurrentMetrics, LedgerError> {
        let state = self.lock();
        Ok(CurrentMetrics {
            round: state.executed_rounds,
            metrics: state.last_metrics,
            total_samples_trained: state.total_samples,
        })
    }

    async fn fetch_history(&self) -> Result<Vec<RoundRecord>, LedgerError> {
        Ok(self.lock().history.clone())
    }

    async fn reset_training(&self) -> Result<(), LedgerError> {
        let mut state = self.lock();
        if let Some(error) = state.reset_failure.take() {
            return Err(error);
        }
        state.executed_rounds = 0;
        state.total_samples = 0;
        state.last_metrics = RoundMetrics::default();
        state.history.clear();
        Ok(())
    }

    async fn request_otp(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
    ) -> Result<OtpDelivery, LedgerError> {
        let mut state = self.lock();
        state.otp_requests += 1;
        if let Some(error) = state.otp_failure.take() {
            return Err(error);
        }

        if let Some((clock, latency)) = &state.otp_latency {
            clock.advance(*latency);
        }

        let code = match state.scripted_codes.pop_front() {
            Some(code) => code,
            None => format!("{:06}", rand::rng().random_range(0..1_000_000u32)),
        };
        state.codes.insert((patient_id.clone(), hospital_id.clone()), code);

        Ok(OtpDelivery {
            delivered_to: format!("patient-{}@example.org", patient_id),
            code_ttl_seconds: state.otp_ttl_secs,
        })
    }

    async fn verify_otp_and_grant(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
        code: &str,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.lock().verifications += 1;

        if let Some(gate) = &self.verify_gate {
            gate.acquire()
                .await
                .map_err(|e| LedgerError::Transport(format!("verification gate closed: {e}")))?
                .forget();
        }

        let mut state = self.lock();
        if let Some(error) = state.verify_failure.take() {
            return Err(error);
        }

        let pair = (patient_id.clone(), hospital_id.clone());
        let matched = state.codes.get(&pair).map(|expected| expected == code);
        match matched {
            Some(true) => {
                state.codes.remove(&pair);
                let transaction_ref = transaction_ref();
                state.grants.insert(pair, transaction_ref.clone());
                Ok(LedgerReceipt { transaction_ref })
            }
            Some(false) => Err(LedgerError::InvalidCode("Invalid OTP".to_string())),
            None => Err(LedgerError::InvalidCode(
                "No OTP found. Please request a new OTP.".to_string(),
            )),
        }
    }

    async fn revoke_consent(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
    ) -> Result<LedgerReceipt, LedgerError> {
        let mut state = self.lock();
        let pair = (patient_id.clone(), hospital_id.clone());
        state.codes.remove(&pair);
        state.grants.remove(&pair);
        Ok(LedgerReceipt { transaction_ref: transaction_ref() })
    }

    async fn check_consent(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
    ) -> Result<ConsentStatus, LedgerError> {
        let state = self.lock();
        let grant = state.grants.get(&(patient_id.clone(), hospital_id.clone()));
        Ok(ConsentStatus {
            has_consent: grant.is_some(),
            transaction_ref: grant.cloned().unwrap_or_default(),
        })
    }
}
