//! Broker availability signal.
//!
//! One shared flag, refreshed by a background probe. Readers on the request
//! path never wait on the broker; a reading may be one interval old.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::queue::BrokerProbe;

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct BrokerMonitor {
    available: AtomicBool,
    probe_timeout: Duration,
}

impl BrokerMonitor {
    pub fn new(initially_available: bool) -> Self {
        Self {
            available: AtomicBool::new(initially_available),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Runs one liveness check and publishes the result.
    pub async fn probe(&self, probe: &dyn BrokerProbe) -> bool {
        let up = match tokio::time::timeout(self.probe_timeout, probe.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!("Broker probe failed: {e}");
                false
            }
            Err(_) => false,
        };

        let was = self.available.swap(up, Ordering::AcqRel);
        if was != up {
            if up {
                info!("Message broker reachable; queued dispatch enabled");
            } else {
                warn!("Message broker unreachable; falling back to inline processing");
            }
        }
        up
    }

    /// Probes every `interval` until `shutdown` flips to true.
    pub fn spawn(
        self: Arc<Self>,
        probe: Arc<dyn BrokerProbe>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.probe(probe.as_ref()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Broker monitor stopped");
        })
    }
}
