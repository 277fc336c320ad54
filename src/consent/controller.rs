use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
    },
};

use chrono::Duration;
use tracing::{
    debug,
    info,
    warn,
};
use uuid::Uuid;

use super::session::{
    ConsentSession,
    ConsentSnapshot,
};
use crate::{
    activity::{
        ActivityEvent,
        ActivitySink,
    },
    core::{
        Clock,
        ConsentError,
        ConsentStatus,
        ErrorKind,
        HospitalId,
        LedgerReceipt,
        PatientId,
    },
    ledger::{
        LedgerError,
        RemoteLedgerClient,
    },
    settings::ConsoleSettings,
};

type Pair = (PatientId, HospitalId);

/// Limits applied to every OTP session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsentPolicy {
    pub otp_ttl: Duration,
    pub max_attempts: u32,
    pub code_length: usize,
}

const DEFAULT_OTP_TTL_SECS: i64 = 300;
const MAX_OTP_TTL_SECS: i64 = 24 * 60 * 60;

impl Default for ConsentPolicy {
    fn default() -> Self {
        Self { otp_ttl: Duration::seconds(DEFAULT_OTP_TTL_SECS), max_attempts: 5, code_length: 6 }
    }
}

/// Convert a wire or config TTL, rejecting zero and values past one day.
fn ttl_from_secs(secs: u64) -> Option<Duration> {
    i64::try_from(secs)
        .ok()
        .filter(|secs| (1..=MAX_OTP_TTL_SECS).contains(secs))
        .and_then(Duration::try_seconds)
}

impl ConsentPolicy {
    pub fn from_settings(settings: &ConsoleSettings) -> Self {
        let otp_ttl = ttl_from_secs(settings.otp_ttl_secs).unwrap_or_else(|| {
            warn!(otp_ttl_secs = settings.otp_ttl_secs, "OTP TTL out of range, using default");
            Duration::seconds(DEFAULT_OTP_TTL_SECS)
        });
        Self {
            otp_ttl,
            max_attempts: settings.otp_max_attempts.max(1),
            code_length: settings.otp_code_length,
        }
    }

    fn is_well_formed(&self, code: &str) -> bool {
        code.len() == self.code_length && code.bytes().all(|b| b.is_ascii_digit())
    }

    /// The shorter of the local window and the one the remote reported. A remote
    /// value that is zero or too large to represent leaves the local window.
    fn effective_ttl(&self, remote_ttl_secs: u64) -> Duration {
        match ttl_from_secs(remote_ttl_secs) {
            Some(remote) => self.otp_ttl.min(remote),
            None => self.otp_ttl,
        }
    }
}

fn validate_pair(patient_id: &PatientId, hospital_id: &HospitalId) -> Result<(), ConsentError> {
    if patient_id.is_blank() {
        return Err(ConsentError::invalid_argument("patient id must not be empty"));
    }
    if hospital_id.is_blank() {
        return Err(ConsentError::invalid_argument("hospital id must not be empty"));
    }
    Ok(())
}

/// OTP-gated consent handshakes, one independent session per (patient, hospital).
///
/// Expiry is evaluated against the injected [`Clock`] whenever a session is
/// touched, and eagerly by [`ConsentController::sweep_expired`].
pub struct ConsentController {
    client: Arc<dyn RemoteLedgerClient>,
    sink: Arc<dyn ActivitySink>,
    clock: Arc<dyn Clock>,
    policy: ConsentPolicy,
    sessions: Mutex<HashMap<Pair, ConsentSession>>,
}

impl ConsentController {
    pub fn new(
        client: Arc<dyn RemoteLedgerClient>,
        sink: Arc<dyn ActivitySink>,
        clock: Arc<dyn Clock>,
        policy: ConsentPolicy,
    ) -> Self {
        Self { client, sink, clock, policy, sessions: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Pair, ConsentSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn policy(&self) -> ConsentPolicy {
        self.policy
    }

    pub fn has_session(&self, patient_id: &PatientId, hospital_id: &HospitalId) -> bool {
        self.lock().contains_key(&(patient_id.clone(), hospital_id.clone()))
    }

    /// Ask the remote to mint and deliver a fresh code. Any outstanding code for
    /// the pair is discarded first.
    pub async fn request_otp(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
    ) -> Result<ConsentSnapshot, ConsentError> {
        validate_pair(patient_id, hospital_id)?;
        let pair = (patient_id.clone(), hospital_id.clone());

        if let Some(previous) = self.lock().remove(&pair) {
            debug!(%patient_id, %hospital_id, session = %previous.session_id, "Replacing outstanding OTP");
        }

        // The remote starts its window when it mints the code, before the reply arrives.
        let issued_at = self.clock.now();
        let delivery = match self.client.request_otp(patient_id, hospital_id).await {
            Ok(delivery) => delivery,
            Err(e) => {
                let error = ConsentError::remote(e.to_string());
                warn!(%patient_id, %hospital_id, %error, "OTP request failed");
                self.sink.emit(ActivityEvent::error("OTP request failed", &error.message));
                return Err(error);
            }
        };

        let ttl = self.policy.effective_ttl(delivery.code_ttl_seconds);
        let session = ConsentSession::issue(
            patient_id.clone(),
            hospital_id.clone(),
            issued_at,
            ttl,
            self.policy.max_attempts,
        );
        let snapshot = ConsentSnapshot::of(&session, self.clock.now());
        self.lock().insert(pair, session);

        info!(%patient_id, %hospital_id, ttl_secs = ttl.num_seconds(), "OTP issued");
        self.sink.emit(ActivityEvent::success(
            "OTP sent",
            format!(
                "code for patient {patient_id} / hospital {hospital_id} sent to {}, valid for {} seconds",
                delivery.delivered_to,
                ttl.num_seconds()
            ),
        ));
        Ok(snapshot)
    }

    /// Verify `code` and, if the remote accepts it, record the grant on the ledger.
    pub async fn verify_and_grant(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
        code: &str,
    ) -> Result<LedgerReceipt, ConsentError> {
        validate_pair(patient_id, hospital_id)?;
        let code = code.trim();
        if !self.policy.is_well_formed(code) {
            return Err(ConsentError::invalid_argument(format!(
                "OTP must be exactly {} digits",
                self.policy.code_length
            )));
        }

        let pair = (patient_id.clone(), hospital_id.clone());
        let session_id = self.begin_verification(&pair)?;

        let result = self.client.verify_otp_and_grant(patient_id, hospital_id, code).await;

        let mut sessions = self.lock();
        let current = sessions.get_mut(&pair).filter(|session| session.session_id == session_id);
        let Some(session) = current else {
            drop(sessions);
            debug!(%patient_id, %hospital_id, %session_id, "Verification finished for a replaced session");
            return match result {
                Ok(receipt) => {
                    self.emit_granted(patient_id, hospital_id, &receipt);
                    Ok(receipt)
                }
                Err(e) => Err(stale_error(&e)),
            };
        };

        match result {
            Ok(receipt) => {
                sessions.remove(&pair);
                drop(sessions);
                self.emit_granted(patient_id, hospital_id, &receipt);
                Ok(receipt)
            }
            Err(LedgerError::InvalidCode(_)) => {
                let error = session.record_rejection();
                if error.kind == ErrorKind::AttemptsExhausted {
                    sessions.remove(&pair);
                }
                drop(sessions);
                warn!(%patient_id, %hospital_id, attempts_remaining = ?error.attempts_remaining, "OTP rejected");
                self.sink.emit(ActivityEvent::error("OTP verification failed", &error.message));
                Err(error)
            }
            Err(LedgerError::CodeExpired(_)) => {
                sessions.remove(&pair);
                drop(sessions);
                self.sink.emit(ActivityEvent::error(
                    "OTP expired",
                    format!("code for patient {patient_id} / hospital {hospital_id} expired"),
                ));
                Err(ConsentError::expired("OTP has expired. Please request a new OTP."))
            }
            Err(e) => {
                session.abort_verification();
                drop(sessions);
                let error = ConsentError::remote(e.to_string());
                warn!(%patient_id, %hospital_id, %error, "Consent grant failed");
                self.sink.emit(ActivityEvent::error("Consent grant failed", &error.message));
                Err(error)
            }
        }
    }

    fn begin_verification(&self, pair: &Pair) -> Result<Uuid, ConsentError> {
        let now = self.clock.now();
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(pair) else {
            return Err(ConsentError::invalid_state(
                "No OTP found. Please request a new OTP.",
            ));
        };

        match session.begin_verification(now) {
            Ok(()) => Ok(session.session_id),
            Err(error) if error.kind == ErrorKind::Expired => {
                sessions.remove(pair);
                drop(sessions);
                self.emit_expired(&pair.0, &pair.1);
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    /// Drop any outstanding code for the pair. Calling it with nothing pending is a no-op.
    pub fn cancel(&self, patient_id: &PatientId, hospital_id: &HospitalId) {
        let removed = self.lock().remove(&(patient_id.clone(), hospital_id.clone()));
        if removed.is_some() {
            info!(%patient_id, %hospital_id, "OTP cancelled");
            self.sink.emit(ActivityEvent::info(
                "OTP cancelled",
                format!("patient {patient_id} / hospital {hospital_id}"),
            ));
        }
    }

    /// Revoke on the ledger. No OTP is needed; any outstanding session is cancelled.
    pub async fn revoke_consent(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
    ) -> Result<LedgerReceipt, ConsentError> {
        validate_pair(patient_id, hospital_id)?;
        self.cancel(patient_id, hospital_id);

        match self.client.revoke_consent(patient_id, hospital_id).await {
            Ok(receipt) => {
                info!(%patient_id, %hospital_id, tx = %receipt.transaction_ref, "Consent revoked");
                self.sink.emit(ActivityEvent::success(
                    "Consent revoked",
                    format!(
                        "patient {patient_id} revoked hospital {hospital_id} (tx {})",
                        receipt.transaction_ref
                    ),
                ));
                Ok(receipt)
            }
            Err(e) => {
                let error = ConsentError::remote(e.to_string());
                warn!(%patient_id, %hospital_id, %error, "Consent revoke failed");
                self.sink.emit(ActivityEvent::error("Consent revoke failed", &error.message));
                Err(error)
            }
        }
    }

    pub async fn check_consent(
        &self,
        patient_id: &PatientId,
        hospital_id: &HospitalId,
    ) -> Result<ConsentStatus, ConsentError> {
        validate_pair(patient_id, hospital_id)?;
        self.client
            .check_consent(patient_id, hospital_id)
            .await
            .map_err(|e| ConsentError::remote(e.to_string()))
    }

    /// Current view of the pair. An elapsed session is expired on the spot.
    pub fn snapshot(&self, patient_id: &PatientId, hospital_id: &HospitalId) -> ConsentSnapshot {
        let now = self.clock.now();
        let pair = (patient_id.clone(), hospital_id.clone());
        let mut sessions = self.lock();

        match sessions.get(&pair) {
            Some(session) if !session.is_expired(now) => ConsentSnapshot::of(session, now),
            Some(_) => {
                sessions.remove(&pair);
                drop(sessions);
                self.emit_expired(patient_id, hospital_id);
                ConsentSnapshot::idle(pair.0, pair.1)
            }
            None => ConsentSnapshot::idle(pair.0, pair.1),
        }
    }

    /// Expire every session whose window has elapsed and return the affected pairs.
    pub fn sweep_expired(&self) -> Vec<(PatientId, HospitalId)> {
        let now = self.clock.now();
        let expired: Vec<Pair> = {
            let mut sessions = self.lock();
            let expired: Vec<Pair> = sessions
                .iter()
                .filter(|(_, session)| session.is_expired(now))
                .map(|(pair, _)| pair.clone())
                .collect();
            for pair in &expired {
                sessions.remove(pair);
            }
            expired
        };

        for (patient_id, hospital_id) in &expired {
            self.emit_expired(patient_id, hospital_id);
        }
        expired
    }

    fn emit_granted(&self, patient_id: &PatientId, hospital_id: &HospitalId, receipt: &LedgerReceipt) {
        info!(%patient_id, %hospital_id, tx = %receipt.transaction_ref, "Consent granted");
        self.sink.emit(ActivityEvent::success(
            "Consent granted",
            format!(
                "patient {patient_id} granted hospital {hospital_id} (tx {})",
                receipt.transaction_ref
            ),
        ));
    }

    fn emit_expired(&self, patient_id: &PatientId, hospital_id: &HospitalId) {
        info!(%patient_id, %hospital_id, "OTP expired");
        self.sink.emit(ActivityEvent::error(
            "OTP expired",
            format!("code for patient {patient_id} / hospital {hospital_id} expired"),
        ));
    }
}

/// Map a remote result that arrived after its session was replaced. No attempt
/// bookkeeping applies any more.
fn stale_error(error: &LedgerError) -> ConsentError {
    match error {
        LedgerError::InvalidCode(message) => {
            ConsentError::new(ErrorKind::VerificationFailed, message.clone())
        }
        LedgerError::CodeExpired(message) => ConsentError::expired(message.clone()),
        other => ConsentError::remote(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        activity::ActivityLog,
        consent::ConsentPhase,
        core::ManualClock,
        ledger::FakeLedgerClient,
    };

    struct Fixture {
        controller: Arc<ConsentController>,
        fake: Arc<FakeLedgerClient>,
        clock: Arc<ManualClock>,
        log: ActivityLog,
        patient: PatientId,
        hospital: HospitalId,
    }

    fn fixture() -> Fixture {
        fixture_with(FakeLedgerClient::new(), Arc::new(ManualClock::new(Utc::now())))
    }

    fn fixture_with(fake: FakeLedgerClient, clock: Arc<ManualClock>) -> Fixture {
        let fake = Arc::new(fake);
        let log = ActivityLog::new();
        let controller = Arc::new(ConsentController::new(
            fake.clone(),
            Arc::new(log.clone()),
            clock.clone(),
            ConsentPolicy::default(),
        ));
        Fixture {
            controller,
            fake,
            clock,
            log,
            patient: PatientId::new("P-1001"),
            hospital: HospitalId::new("H1"),
        }
    }

    impl Fixture {
        fn issued_code(&self) -> String {
            self.fake.issued_code(&self.patient, &self.hospital).unwrap()
        }

        fn wrong_code(&self) -> String {
            let code: u32 = self.issued_code().parse().unwrap();
            format!("{:06}", (code + 1) % 1_000_000)
        }
    }

    #[tokio::test]
    async fn request_then_grant() {
        let f = fixture();

        let snapshot = f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();
        assert_eq!(snapshot.phase, ConsentPhase::OtpRequested);
        assert_eq!(snapshot.attempts_remaining, 5);
        assert_eq!(snapshot.time_remaining_secs, 300);

        let receipt =
            f.controller.verify_and_grant(&f.patient, &f.hospital, &f.issued_code()).await.unwrap();

        assert!(receipt.transaction_ref.starts_with("0x"));
        assert!(f.fake.has_grant(&f.patient, &f.hospital));
        assert_eq!(f.controller.snapshot(&f.patient, &f.hospital).phase, ConsentPhase::Idle);
        assert!(f.log.actions().contains(&"Consent granted".to_string()));

        let status = f.controller.check_consent(&f.patient, &f.hospital).await.unwrap();
        assert!(status.has_consent);
    }

    #[tokio::test]
    async fn correct_code_after_expiry_is_rejected() {
        let f = fixture();
        f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();
        let code = f.issued_code();

        f.clock.advance(Duration::seconds(301));
        let err = f.controller.verify_and_grant(&f.patient, &f.hospital, &code).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Expired);
        assert!(!f.fake.has_grant(&f.patient, &f.hospital));
        assert!(!f.controller.has_session(&f.patient, &f.hospital));
        assert!(f.log.actions().contains(&"OTP expired".to_string()));
    }

    #[tokio::test]
    async fn replaced_code_never_grants() {
        let f = fixture();
        f.fake.script_codes(&["111111", "222222"]);
        f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();
        f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();
        assert_eq!(f.issued_code(), "222222");

        let err =
            f.controller.verify_and_grant(&f.patient, &f.hospital, "111111").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::VerificationFailed);
        assert_eq!(err.attempts_remaining, Some(4));
        assert!(!f.fake.has_grant(&f.patient, &f.hospital));

        f.controller.verify_and_grant(&f.patient, &f.hospital, "222222").await.unwrap();
        assert!(f.fake.has_grant(&f.patient, &f.hospital));
        assert_eq!(f.fake.otp_request_count(), 2);
    }

    #[tokio::test]
    async fn wrong_codes_exhaust_the_session() {
        let f = fixture();
        f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();
        let wrong = f.wrong_code();

        for remaining in (1..5).rev() {
            let err =
                f.controller.verify_and_grant(&f.patient, &f.hospital, &wrong).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::VerificationFailed);
            assert_eq!(err.attempts_remaining, Some(remaining));
            let snapshot = f.controller.snapshot(&f.patient, &f.hospital);
            assert_eq!(snapshot.phase, ConsentPhase::OtpRequested);
            assert_eq!(snapshot.attempts_remaining, remaining);
        }

        let err = f.controller.verify_and_grant(&f.patient, &f.hospital, &wrong).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AttemptsExhausted);
        assert_eq!(f.controller.snapshot(&f.patient, &f.hospital).phase, ConsentPhase::Idle);

        let err = f
            .controller
            .verify_and_grant(&f.patient, &f.hospital, &f.issued_code())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn malformed_codes_do_not_consume_attempts() {
        let f = fixture();
        f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();

        for code in ["", "12345", "1234567", "12a456", "１２３４５６"] {
            let err = f.controller.verify_and_grant(&f.patient, &f.hospital, code).await.unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidArgument, "code {code:?}");
        }

        assert_eq!(f.controller.snapshot(&f.patient, &f.hospital).attempts_remaining, 5);
    }

    #[tokio::test]
    async fn empty_ids_are_rejected_before_any_call() {
        let f = fixture();
        let blank = PatientId::new("");

        let err = f.controller.request_otp(&blank, &f.hospital).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        let err = f.controller.revoke_consent(&f.patient, &HospitalId::new(" ")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert_eq!(f.fake.otp_request_count(), 0);
    }

    #[tokio::test]
    async fn transport_failure_keeps_attempts() {
        let f = fixture();
        f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();
        f.fake.fail_next_verification(LedgerError::Transport("connection reset".into()));

        let err = f
            .controller
            .verify_and_grant(&f.patient, &f.hospital, &f.issued_code())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::RemoteFailure);
        let snapshot = f.controller.snapshot(&f.patient, &f.hospital);
        assert_eq!(snapshot.phase, ConsentPhase::OtpRequested);
        assert_eq!(snapshot.attempts_remaining, 5);

        f.controller.verify_and_grant(&f.patient, &f.hospital, &f.issued_code()).await.unwrap();
    }

    #[tokio::test]
    async fn remote_expiry_verdict_ends_the_session() {
        let f = fixture();
        f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();
        f.fake.fail_next_verification(LedgerError::CodeExpired("OTP has expired".into()));

        let err = f
            .controller
            .verify_and_grant(&f.patient, &f.hospital, &f.issued_code())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Expired);
        assert!(!f.controller.has_session(&f.patient, &f.hospital));
    }

    #[tokio::test]
    async fn failed_request_leaves_pair_idle() {
        let f = fixture();
        f.fake.fail_next_otp_request(LedgerError::Rejected {
            status: 500,
            message: "mail server down".into(),
        });

        let err = f.controller.request_otp(&f.patient, &f.hospital).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::RemoteFailure);
        assert_eq!(f.controller.snapshot(&f.patient, &f.hospital).phase, ConsentPhase::Idle);
    }

    #[tokio::test]
    async fn cancel_and_revoke_are_idempotent() {
        let f = fixture();
        f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();

        f.controller.cancel(&f.patient, &f.hospital);
        f.controller.cancel(&f.patient, &f.hospital);
        assert_eq!(f.controller.snapshot(&f.patient, &f.hospital).phase, ConsentPhase::Idle);
        let cancelled = f.log.actions().iter().filter(|a| *a == "OTP cancelled").count();
        assert_eq!(cancelled, 1);

        f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();
        f.controller.verify_and_grant(&f.patient, &f.hospital, &f.issued_code()).await.unwrap();

        f.controller.revoke_consent(&f.patient, &f.hospital).await.unwrap();
        f.controller.revoke_consent(&f.patient, &f.hospital).await.unwrap();
        assert!(!f.fake.has_grant(&f.patient, &f.hospital));
        let status = f.controller.check_consent(&f.patient, &f.hospital).await.unwrap();
        assert!(!status.has_consent);
    }

    #[tokio::test]
    async fn revoke_cancels_outstanding_code() {
        let f = fixture();
        f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();
        let code = f.issued_code();

        f.controller.revoke_consent(&f.patient, &f.hospital).await.unwrap();

        assert!(!f.controller.has_session(&f.patient, &f.hospital));
        let err = f.controller.verify_and_grant(&f.patient, &f.hospital, &code).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn sessions_are_independent_per_pair() {
        let f = fixture();
        let other = HospitalId::new("H2");
        f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();
        f.clock.advance(Duration::seconds(200));
        f.controller.request_otp(&f.patient, &other).await.unwrap();
        f.clock.advance(Duration::seconds(150));

        let expired = f.controller.sweep_expired();

        assert_eq!(expired, vec![(f.patient.clone(), f.hospital.clone())]);
        let snapshot = f.controller.snapshot(&f.patient, &other);
        assert_eq!(snapshot.phase, ConsentPhase::OtpRequested);
        assert_eq!(snapshot.time_remaining_secs, 150);
    }

    #[tokio::test]
    async fn sweep_and_lazy_check_share_the_boundary() {
        let f = fixture();
        f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();

        f.clock.advance(Duration::seconds(299));
        assert!(f.controller.sweep_expired().is_empty());
        assert_eq!(f.controller.snapshot(&f.patient, &f.hospital).time_remaining_secs, 1);

        f.clock.advance(Duration::seconds(1));
        assert_eq!(f.controller.sweep_expired().len(), 1);
        assert_eq!(f.controller.snapshot(&f.patient, &f.hospital).phase, ConsentPhase::Idle);
    }

    #[tokio::test]
    async fn window_starts_when_the_code_is_requested() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let fake = FakeLedgerClient::new().with_otp_latency(clock.clone(), Duration::seconds(100));
        let f = fixture_with(fake, clock);

        let snapshot = f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();
        assert_eq!(snapshot.time_remaining_secs, 200);

        f.clock.advance(Duration::seconds(200));
        let err = f
            .controller
            .verify_and_grant(&f.patient, &f.hospital, &f.issued_code())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Expired);
    }

    #[tokio::test]
    async fn unrepresentable_remote_ttl_keeps_local_window() {
        for remote_ttl in [u64::MAX, 10_000_000_000_000_000, i64::MAX as u64 + 1] {
            let f = fixture();
            f.fake.set_otp_ttl_secs(remote_ttl);

            let snapshot = f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();
            assert_eq!(snapshot.time_remaining_secs, 300, "remote ttl {remote_ttl}");
            assert_eq!(
                f.controller.snapshot(&f.patient, &f.hospital).phase,
                ConsentPhase::OtpRequested
            );
        }
    }

    #[tokio::test]
    async fn late_grant_for_a_cancelled_session_is_still_logged() {
        let (fake, gate) = FakeLedgerClient::new().with_verification_gate();
        let f = fixture_with(fake, Arc::new(ManualClock::new(Utc::now())));
        f.controller.request_otp(&f.patient, &f.hospital).await.unwrap();

        let controller = f.controller.clone();
        let (patient, hospital, code) = (f.patient.clone(), f.hospital.clone(), f.issued_code());
        let pending = tokio::spawn(async move {
            controller.verify_and_grant(&patient, &hospital, &code).await
        });
        while f.fake.verification_count() == 0 {
            tokio::task::yield_now().await;
        }

        f.controller.cancel(&f.patient, &f.hospital);
        gate.add_permits(1);
        let receipt = pending.await.unwrap().unwrap();

        assert!(f.fake.has_grant(&f.patient, &f.hospital));
        assert!(!f.controller.has_session(&f.patient, &f.hospital));
        let granted: Vec<_> =
            f.log.entries().into_iter().filter(|e| e.action == "Consent granted").collect();
        assert_eq!(granted.len(), 1);
        assert!(granted[0].detail.contains(&receipt.transaction_ref));
    }

    #[test]
    fn shorter_remote_ttl_wins() {
        let policy = ConsentPolicy::default();
        assert_eq!(policy.effective_ttl(120), Duration::seconds(120));
        assert_eq!(policy.effective_ttl(900), Duration::seconds(300));
        assert_eq!(policy.effective_ttl(0), Duration::seconds(300));
        assert_eq!(policy.effective_ttl(u64::MAX), Duration::seconds(300));
    }

    #[test]
    fn out_of_range_settings_ttl_falls_back_to_default() {
        for otp_ttl_secs in [0, u64::MAX, 10_000_000_000_000_000] {
            let settings = ConsoleSettings { otp_ttl_secs, ..Default::default() };
            assert_eq!(ConsentPolicy::from_settings(&settings).otp_ttl, Duration::seconds(300));
        }
    }

    #[test]
    fn policy_follows_settings() {
        let settings = ConsoleSettings { otp_ttl_secs: 60, otp_max_attempts: 3, ..Default::default() };
        let policy = ConsentPolicy::from_settings(&settings);
        assert_eq!(policy.otp_ttl, Duration::seconds(60));
        assert_eq!(policy.max_attempts, 3);
        assert!(policy.is_well_formed("000123"));
        assert!(!policy.is_well_formed("00012"));
    }
}
