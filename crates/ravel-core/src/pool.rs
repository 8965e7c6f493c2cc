//! Worker-pool seam.
//!
//! Queues never spawn onto the runtime directly; they go through this
//! trait, so embedders can route work onto their own executors. The
//! default implementation dispatches onto Tokio and records the QoS hint
//! on the task's tracing span. Tokio has no scheduling classes, so the
//! hint is carried for observability and for pools that do.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::Instrument;

use crate::domain::QosClass;

/// The shape of work a pool accepts.
pub type PoolJob = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A dispatcher of closures under a quality-of-service hint.
pub trait WorkerPool: Send + Sync {
    fn spawn(&self, qos: QosClass, job: PoolJob);
}

/// The default pool: `tokio::spawn` with the QoS hint on the span.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioPool;

impl WorkerPool for TokioPool {
    fn spawn(&self, qos: QosClass, job: PoolJob) {
        let span = tracing::debug_span!("pool_job", qos = qos.label());
        tokio::spawn(job.instrument(span));
    }
}

/// The pool queues use when none is supplied.
pub fn default_pool() -> Arc<dyn WorkerPool> {
    Arc::new(TokioPool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn tokio_pool_runs_the_job() {
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&ran);

        TokioPool.spawn(
            QosClass::Utility,
            Box::pin(async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for _ in 0..50 {
            if ran.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never ran");
    }
}
