//! Message handler trait.

use async_trait::async_trait;
use courier_core::MessagePayload;

/// Application callback for delivered messages.
///
/// Handlers must be idempotent: delivery is at-least-once, so a payload
/// already applied may arrive again after a crash or a reclaim.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &MessagePayload) -> anyhow::Result<()>;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(&MessagePayload) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, payload: &MessagePayload) -> anyhow::Result<()> {
        self(payload)
    }
}

/// Handler that records everything it sees, with injectable failures.
/// Used by the tests in this crate; exported because embedders' tests
/// want the same thing.
#[derive(Default)]
pub struct RecordingHandler {
    seen: std::sync::Mutex<Vec<MessagePayload>>,
    fail_times: std::sync::atomic::AtomicU32,
    fail_always: std::sync::atomic::AtomicBool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` deliveries before succeeding.
    pub fn fail_times(&self, n: u32) {
        self.fail_times.store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Fail every delivery until cleared.
    pub fn fail_always(&self, fail: bool) {
        self.fail_always
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn seen(&self) -> Vec<MessagePayload> {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn seen_count(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, payload: &MessagePayload) -> anyhow::Result<()> {
        use std::sync::atomic::Ordering;

        if self.fail_always.load(Ordering::SeqCst) {
            anyhow::bail!("handler rejected {}", payload.id);
        }
        let remaining = self.fail_times.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_times.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("handler rejected {} (injected)", payload.id);
        }

        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload.clone());
        Ok(())
    }
}
