//! Per-connection idle reclamation. Each connection carries a monitor whose
//! budget is reset by any read or write; when it runs out the connection is
//! closed unconditionally. Deliberately coarse: the point is bounding the
//! resources abandoned connections can hold, not half-open detection.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone)]
pub struct IdleMonitor {
    epoch: Instant,
    last_activity_ms: Arc<AtomicU64>,
    threshold: Duration,
}

impl IdleMonitor {
    pub fn new(threshold: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            last_activity_ms: Arc::new(AtomicU64::new(0)),
            threshold,
        }
    }

    /// Record traffic in either direction.
    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    /// Resolves once the quiet period reaches the threshold. Intended to sit
    /// in the owning task's `select!`; never resolves while traffic keeps
    /// the budget refreshed.
    pub async fn expired(&self) {
        loop {
            let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
            let idle = self.epoch.elapsed().saturating_sub(last);
            if idle >= self.threshold {
                return;
            }
            tokio::time::sleep(self.threshold - idle).await;
        }
    }
}
