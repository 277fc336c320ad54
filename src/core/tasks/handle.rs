use std::sync::{
    atomic::{
        AtomicBool,
        Ordering,
    },
    Arc,
};

use tokio::task::{
    JoinError,
    JoinHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancellableTask {
    AutoTraining,
    OtpCountdown,
}

/// Cancellation flag shared between a running loop and whoever may stop it.
/// Each run gets its own token, so cancelling an old run never leaks into a new one.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

#[derive(Debug)]
pub struct TaskHandle<T> {
    kind: CancellableTask,
    cancel_token: CancelToken,
    join_handle: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    pub fn new(kind: CancellableTask, cancel_token: CancelToken, join_handle: JoinHandle<T>) -> Self {
        Self { kind, cancel_token, join_handle }
    }

    pub fn kind(&self) -> CancellableTask {
        self.kind
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    pub async fn join(self) -> Result<T, JoinError> {
        self.join_handle.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag_but_new_tokens_do_not() {
        let token = CancelToken::new();
        let clone = token.clone();
        let fresh = CancelToken::new();

        clone.cancel();

        assert!(token.is_cancelled());
        assert!(token.same_as(&clone));
        assert!(!fresh.is_cancelled());
        assert!(!fresh.same_as(&token));
    }

    #[tokio::test]
    async fn handle_reports_completion() {
        let token = CancelToken::new();
        let handle =
            TaskHandle::new(CancellableTask::OtpCountdown, token, tokio::spawn(async { 7 }));
        assert_eq!(handle.kind(), CancellableTask::OtpCountdown);
        assert_eq!(handle.join().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn handle_debug_names_its_task() {
        let handle = TaskHandle::new(
            CancellableTask::AutoTraining,
            CancelToken::new(),
            tokio::spawn(async { Ok::<u32, String>(1) }),
        );
        let rendered = format!("{handle:?}");
        assert!(rendered.contains("AutoTraining"));
        assert_eq!(handle.join().await.unwrap(), Ok(1));
    }
}
