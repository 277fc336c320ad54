use std::{
    sync::Arc,
    time::Duration,
};

use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::ConsentController;
use crate::core::tasks::{
    CancelToken,
    CancellableTask,
    TaskHandle,
};

pub type CountdownHandle = TaskHandle<()>;

/// Expire elapsed sessions on every tick until cancelled.
///
/// Remaining time is always derived from stored timestamps, so a late or
/// skipped tick only delays the sweep and never changes the outcome.
pub fn spawn_countdown(controller: Arc<ConsentController>, tick: Duration) -> CountdownHandle {
    let token = CancelToken::new();
    let run_token = token.clone();
    let tick = tick.max(Duration::from_millis(1));

    let join_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if run_token.is_cancelled() {
                break;
            }
            let expired = controller.sweep_expired();
            if !expired.is_empty() {
                debug!(count = expired.len(), "Countdown expired OTP sessions");
            }
        }
        debug!("OTP countdown stopped");
    });

    TaskHandle::new(CancellableTask::OtpCountdown, token, join_handle)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        activity::ActivityLog,
        consent::ConsentPolicy,
        core::{
            HospitalId,
            ManualClock,
            PatientId,
        },
        ledger::FakeLedgerClient,
    };

    #[tokio::test]
    async fn countdown_expires_sessions_and_stops_on_cancel() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let log = ActivityLog::new();
        let controller = Arc::new(ConsentController::new(
            Arc::new(FakeLedgerClient::new()),
            Arc::new(log.clone()),
            clock.clone(),
            ConsentPolicy::default(),
        ));
        let patient = PatientId::new("P1");
        let hospital = HospitalId::new("H1");
        controller.request_otp(&patient, &hospital).await.unwrap();

        let handle = spawn_countdown(controller.clone(), Duration::from_millis(5));
        assert_eq!(handle.kind(), CancellableTask::OtpCountdown);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(controller.has_session(&patient, &hospital));

        clock.advance(chrono::Duration::seconds(300));
        for _ in 0..200 {
            if !controller.has_session(&patient, &hospital) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!controller.has_session(&patient, &hospital));
        assert!(log.actions().contains(&"OTP expired".to_string()));

        handle.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle.join()).await.unwrap().unwrap();
    }
}
