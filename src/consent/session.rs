use chrono::{
    DateTime,
    Duration,
    Utc,
};
use serde::Serialize;
use uuid::Uuid;

use crate::core::{
    ConsentError,
    HospitalId,
    PatientId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConsentPhase {
    Idle,
    OtpRequested,
    Verifying,
    Granted,
    Revoked,
    Expired,
}

/// One OTP handshake for a (patient, hospital) pair.
///
/// Sessions only exist while a code is outstanding. Granted, revoked, expired and
/// exhausted sessions are dropped by the controller, which is how the pair falls
/// back to `Idle`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentSession {
    pub session_id: Uuid,
    pub patient_id: PatientId,
    pub hospital_id: HospitalId,
    pub phase: ConsentPhase,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts_remaining: u32,
}

impl ConsentSession {
    pub fn issue(
        patient_id: PatientId,
        hospital_id: HospitalId,
        now: DateTime<Utc>,
        ttl: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            patient_id,
            hospital_id,
            phase: ConsentPhase::OtpRequested,
            issued_at: now,
            expires_at: now + ttl,
            attempts_remaining: max_attempts,
        }
    }

    /// The single expiry predicate used by both lazy checks and the countdown.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn time_remaining(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }

    /// `OtpRequested -> Verifying`.
    pub fn begin_verification(&mut self, now: DateTime<Utc>) -> Result<(), ConsentError> {
        if self.is_expired(now) {
            return Err(ConsentError::expired("OTP has expired. Please request a new OTP."));
        }
        match self.phase {
            ConsentPhase::OtpRequested => {
                self.phase = ConsentPhase::Verifying;
                Ok(())
            }
            ConsentPhase::Verifying => {
                Err(ConsentError::invalid_state("a verification is already in progress"))
            }
            other => Err(ConsentError::invalid_state(format!(
                "cannot verify a code while the session is {other:?}"
            ))),
        }
    }

    /// The remote rejected the code. Consumes one attempt and returns the error to
    /// surface; `AttemptsExhausted` means the session must be discarded.
    pub fn record_rejection(&mut self) -> ConsentError {
        self.attempts_remaining = self.attempts_remaining.saturating_sub(1);
        self.phase = ConsentPhase::OtpRequested;
        if self.attempts_remaining == 0 {
            ConsentError::attempts_exhausted()
        } else {
            ConsentError::verification_failed(self.attempts_remaining)
        }
    }

    /// Verification ended without a verdict on the code.
    pub fn abort_verification(&mut self) {
        if self.phase == ConsentPhase::Verifying {
            self.phase = ConsentPhase::OtpRequested;
        }
    }
}

/// What the consent panel renders for a pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentSnapshot {
    pub patient_id: PatientId,
    pub hospital_id: HospitalId,
    pub phase: ConsentPhase,
    pub attempts_remaining: u32,
    pub time_remaining_secs: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ConsentSnapshot {
    pub fn idle(patient_id: PatientId, hospital_id: HospitalId) -> Self {
        Self {
            patient_id,
            hospital_id,
            phase: ConsentPhase::Idle,
            attempts_remaining: 0,
            time_remaining_secs: 0,
            expires_at: None,
        }
    }

    pub fn of(session: &ConsentSession, now: DateTime<Utc>) -> Self {
        Self {
            patient_id: session.patient_id.clone(),
            hospital_id: session.hospital_id.clone(),
            phase: session.phase,
            attempts_remaining: session.attempts_remaining,
            time_remaining_secs: session.time_remaining(now).num_seconds(),
            expires_at: Some(session.expires_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;

    fn session(now: DateTime<Utc>) -> ConsentSession {
        ConsentSession::issue(
            PatientId::new("P1"),
            HospitalId::new("H1"),
            now,
            Duration::seconds(300),
            5,
        )
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let t0 = Utc::now();
        let session = session(t0);

        assert!(!session.is_expired(t0 + Duration::seconds(299)));
        assert!(session.is_expired(t0 + Duration::seconds(300)));
        assert_eq!(session.time_remaining(t0 + Duration::seconds(120)).num_seconds(), 180);
        assert_eq!(session.time_remaining(t0 + Duration::seconds(400)), Duration::zero());
    }

    #[test]
    fn verification_after_expiry_is_rejected() {
        let t0 = Utc::now();
        let mut session = session(t0);

        let err = session.begin_verification(t0 + Duration::seconds(301)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Expired);
        assert_eq!(session.phase, ConsentPhase::OtpRequested);
    }

    #[test]
    fn only_one_verification_at_a_time() {
        let t0 = Utc::now();
        let mut session = session(t0);

        session.begin_verification(t0).unwrap();
        assert_eq!(session.phase, ConsentPhase::Verifying);
        let err = session.begin_verification(t0).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);

        session.abort_verification();
        assert_eq!(session.phase, ConsentPhase::OtpRequested);
        assert_eq!(session.attempts_remaining, 5);
    }

    #[test]
    fn rejections_count_down_to_exhaustion() {
        let t0 = Utc::now();
        let mut session = session(t0);

        for expected in (1..5).rev() {
            session.begin_verification(t0).unwrap();
            let err = session.record_rejection();
            assert_eq!(err.kind, ErrorKind::VerificationFailed);
            assert_eq!(err.attempts_remaining, Some(expected));
        }

        session.begin_verification(t0).unwrap();
        let err = session.record_rejection();
        assert_eq!(err.kind, ErrorKind::AttemptsExhausted);
        assert_eq!(session.attempts_remaining, 0);
    }

    #[test]
    fn snapshot_reports_remaining_time() {
        let t0 = Utc::now();
        let session = session(t0);

        let snapshot = ConsentSnapshot::of(&session, t0 + Duration::seconds(60));
        assert_eq!(snapshot.phase, ConsentPhase::OtpRequested);
        assert_eq!(snapshot.time_remaining_secs, 240);
        assert_eq!(snapshot.expires_at, Some(t0 + Duration::seconds(300)));

        let idle = ConsentSnapshot::idle(PatientId::new("P1"), HospitalId::new("H1"));
        assert_eq!(idle.phase, ConsentPhase::Idle);
        assert_eq!(idle.expires_at, None);
    }
}
