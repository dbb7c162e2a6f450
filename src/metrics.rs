//! Prometheus metrics for resolver sessions.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use prometheus::{IntGauge, IntGaugeVec, Opts, Registry};

use crate::error::Result;

static GLOBAL: OnceLock<ResolverMetrics> = OnceLock::new();

/// Gauges shared by all resolver sessions, labelled by target.
#[derive(Clone, Debug)]
pub struct ResolverMetrics {
    /// Unix time (seconds) of the last successful address list push.
    pub last_update: IntGaugeVec,

    /// Number of addresses in the most recently computed list.
    pub endpoints: IntGaugeVec,
}

impl ResolverMetrics {
    /// Creates unregistered gauges.
    ///
    /// # Errors
    ///
    /// Fails if the gauge definitions are rejected by `prometheus`.
    pub fn new() -> Result<Self> {
        Ok(Self {
            last_update: IntGaugeVec::new(
                Opts::new(
                    "kuberesolver_client_last_update",
                    "Unix timestamp of the last successful address list update",
                ),
                &["target"],
            )?,
            endpoints: IntGaugeVec::new(
                Opts::new(
                    "kuberesolver_endpoints_total",
                    "Number of resolved endpoints",
                ),
                &["target"],
            )?,
        })
    }

    /// Registers the gauges with `registry`.
    ///
    /// # Errors
    ///
    /// Fails if gauges with the same names are already registered.
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.last_update.clone()))?;
        registry.register(Box::new(self.endpoints.clone()))?;
        Ok(())
    }

    /// Returns the process-wide gauges, registering them with the default
    /// registry on first use.
    ///
    /// # Errors
    ///
    /// Fails if the gauges cannot be created or registered.
    pub fn global() -> Result<&'static Self> {
        if let Some(metrics) = GLOBAL.get() {
            return Ok(metrics);
        }

        let metrics = Self::new()?;
        if GLOBAL.set(metrics).is_ok()
            && let Some(metrics) = GLOBAL.get()
        {
            metrics.register(prometheus::default_registry())?;
        }

        GLOBAL.get().ok_or_else(|| {
            prometheus::Error::Msg("resolver metrics not initialized".to_string()).into()
        })
    }

    pub(crate) fn session(&self, target: &str) -> SessionMetrics {
        SessionMetrics {
            last_update: self.last_update.with_label_values(&[target]),
            endpoints: self.endpoints.with_label_values(&[target]),
            family: self.clone(),
            target: target.to_string(),
        }
    }
}

/// Gauges for one resolver session.
#[derive(Clone, Debug)]
pub(crate) struct SessionMetrics {
    pub(crate) last_update: IntGauge,
    pub(crate) endpoints: IntGauge,
    family: ResolverMetrics,
    target: String,
}

impl SessionMetrics {
    pub(crate) fn record_update(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX));
        self.last_update.set(now);
    }

    pub(crate) fn record_endpoints(&self, count: usize) {
        self.endpoints.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    /// Drops the target's series from the shared gauges. Later writes through
    /// this session no longer show up in scrapes.
    pub(crate) fn remove(&self) {
        let labels = [self.target.as_str()];
        if let Err(e) = self.family.last_update.remove_label_values(&labels) {
            tracing::debug!("no last update series for {}: {e}", self.target);
        }
        if let Err(e) = self.family.endpoints.remove_label_values(&labels) {
            tracing::debug!("no endpoints series for {}: {e}", self.target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_gauges_are_labelled_by_target() {
        let metrics = ResolverMetrics::new().unwrap();
        let session = metrics.session("kubernetes:///a.b:80");

        session.record_endpoints(3);
        session.record_update();

        assert_eq!(
            metrics
                .endpoints
                .with_label_values(&["kubernetes:///a.b:80"])
                .get(),
            3
        );
        assert!(session.last_update.get() > 0);
    }

    #[test]
    fn removed_session_leaves_no_series() {
        let metrics = ResolverMetrics::new().unwrap();
        let session = metrics.session("kubernetes:///a.b:80");
        session.record_update();

        session.remove();
        session.record_update();

        assert!(
            metrics
                .last_update
                .remove_label_values(&["kubernetes:///a.b:80"])
                .is_err()
        );
        assert!(
            metrics
                .endpoints
                .remove_label_values(&["kubernetes:///a.b:80"])
                .is_err()
        );
    }

    #[test]
    fn register_rejects_duplicates() {
        let registry = Registry::new();
        let metrics = ResolverMetrics::new().unwrap();

        metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());
    }

    #[test]
    fn global_is_shared() {
        let a = ResolverMetrics::global().unwrap();
        let b = ResolverMetrics::global().unwrap();
        assert!(std::ptr::eq(a, b));
    }
}
