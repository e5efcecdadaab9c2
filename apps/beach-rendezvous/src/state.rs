use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use metrics::gauge;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::{
    sync::watch,
    time::{sleep, Instant},
};

use crate::{config::RelayConfig, registry::IdentityRegistry};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared handle passed to every connection task and HTTP handler.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<RelayStateInner>,
}

struct RelayStateInner {
    config: RelayConfig,
    registry: IdentityRegistry,
    metrics: PrometheusHandle,
    active_connections: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

impl RelayState {
    pub fn new(config: RelayConfig, metrics: PrometheusHandle) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(RelayStateInner {
                config,
                registry: IdentityRegistry::new(),
                metrics,
                active_connections: AtomicUsize::new(0),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.inner.registry
    }

    pub fn active_connections(&self) -> usize {
        self.inner.active_connections.load(Ordering::Relaxed)
    }

    /// Count a connection as active until the returned guard is dropped.
    pub(crate) fn track_connection(&self) -> ActiveConnection {
        let active = self.inner.active_connections.fetch_add(1, Ordering::Relaxed) + 1;
        gauge!("rendezvous_connections_active", active as f64);
        ActiveConnection {
            state: self.clone(),
        }
    }

    /// Wait until no connection is active or `grace` has elapsed.
    /// Returns whether every connection finished in time.
    pub async fn wait_for_drain(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            if self.active_connections() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(DRAIN_POLL_INTERVAL.min(deadline - Instant::now())).await;
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Ask every open connection to close with a normal-closure frame.
    pub fn begin_shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    pub fn render_metrics(&self) -> String {
        self.inner.metrics.render()
    }
}

/// Keeps one connection in the active count; released on drop, including
/// during unwinding.
pub(crate) struct ActiveConnection {
    state: RelayState,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        let active = self
            .state
            .inner
            .active_connections
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);
        gauge!("rendezvous_connections_active", active as f64);
    }
}
