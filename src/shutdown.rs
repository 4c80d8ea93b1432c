use std::{sync::Arc, time::Duration};

use tokio::time;
use tracing::{debug, info};

use crate::{engine::EngineClient, registry::JobRegistry};

/// Tears the process down once no work is active and a quiet period has
/// elapsed, to bound serverless compute cost. The stop is deliberately
/// abrupt: in-flight uploads at that instant are abandoned, an accepted
/// loss mode traded for not paying for idle GPUs.
#[derive(Clone)]
pub struct IdleMonitor {
    registry: JobRegistry,
    engine: EngineClient,
    check_interval: Duration,
    idle_after: Duration,
    terminate: Arc<dyn Fn() + Send + Sync>,
}

impl IdleMonitor {
    pub fn new(
        registry: JobRegistry,
        engine: EngineClient,
        check_interval: Duration,
        idle_after: Duration,
    ) -> Self {
        Self {
            registry,
            engine,
            check_interval,
            idle_after,
            terminate: Arc::new(|| std::process::exit(0)),
        }
    }

    /// Swap the teardown action; the production default exits the process.
    pub fn with_terminate(mut self, terminate: Arc<dyn Fn() + Send + Sync>) -> Self {
        self.terminate = terminate;
        self
    }

    pub fn spawn(self) {
        tokio::spawn(async move {
            self.run().await;
        });
    }

    async fn run(self) {
        let mut interval = time::interval(self.check_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        info!(
            idle_after_s = self.idle_after.as_secs(),
            "Idle-shutdown monitor started"
        );
        loop {
            interval.tick().await;
            if self.should_terminate().await {
                info!("No active jobs, idle threshold passed, engine queue empty: terminating");
                (self.terminate)();
                return;
            }
        }
    }

    /// The teardown gate. All three conditions must agree on the same
    /// check; any of them flipping busy resets the gate because the next
    /// check recomputes from live state.
    pub async fn should_terminate(&self) -> bool {
        let active = self.registry.active_count();
        if active > 0 {
            debug!(active, "Idle check: jobs still active");
            return false;
        }
        let idle = self.registry.idle_duration();
        if idle < self.idle_after {
            debug!(idle_s = idle.as_secs_f64(), "Idle check: quiet period not elapsed");
            return false;
        }
        // Independent probe against the engine guards against registry and
        // engine state diverging.
        if !self.engine.queue_is_empty().await {
            debug!("Idle check: engine queue not empty");
            return false;
        }
        true
    }
}
