use std::time::Duration;
use tokio::time::Instant;

/// A one-shot scheduled task handle.
///
/// Owned by the state machine that arms it; an unarmed deadline never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    pub fn arm(&mut self, after: Duration) {
        self.0 = Some(Instant::now() + after);
    }

    /// Arm only if not already armed.
    pub fn arm_if_idle(&mut self, after: Duration) {
        if self.0.is_none() {
            self.arm(after);
        }
    }

    pub fn cancel(&mut self) {
        self.0 = None;
    }

    pub fn is_armed(&self) -> bool {
        self.0.is_some()
    }

    /// Completes when the deadline passes; pends forever when unarmed.
    pub async fn expired(self) {
        match self.0 {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}
