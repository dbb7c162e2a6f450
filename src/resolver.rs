//! Watch-driven resolver sessions.
//!
//! A [`KubeResolver`] owns one background task that keeps a [`ClientConn`]
//! in sync with a service's `Endpoints` object:
//!
//! 1. Lists the current `Endpoints` and pushes the computed address list
//! 2. Watches for changes and pushes the new list whenever it differs
//! 3. Re-lists on [`resolve_now`](Resolver::resolve_now) and every resync period
//! 4. Starts over with backoff when the watch ends or fails
//!
//! The task stops when the resolver is closed or dropped.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Endpoints;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::addresses::{Address, make_addresses};
use crate::config::ResolverConfig;
use crate::error::{BoxError, Error, Result};
use crate::k8s::{EndpointSource, WatchEvent};
use crate::logger::SharedLogger;
use crate::metrics::SessionMetrics;
use crate::retry::until;
use crate::target::TargetInfo;

/// The connection a resolver reports to.
#[async_trait::async_trait]
pub trait ClientConn: Send + Sync {
    /// Replaces the connection's address list with `addresses`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update could not be applied; the resolver
    /// reports it and pushes again on the next change.
    async fn update_addresses(&self, addresses: Vec<Address>) -> std::result::Result<(), BoxError>;

    /// Reports a resolution problem. The session keeps running.
    fn report_error(&self, error: &Error);
}

/// Control surface of a running resolver.
pub trait Resolver: Send + Sync {
    /// Asks for a fresh read of the endpoints. Best effort: the request is
    /// picked up the next time the session waits.
    fn resolve_now(&self);

    /// Stops the session.
    fn close(&self);
}

/// A resolver session for one target, watching Kubernetes `Endpoints`.
pub struct KubeResolver {
    target: Arc<TargetInfo>,
    cancel: CancellationToken,
    resolve_now: Arc<Notify>,
    metrics: SessionMetrics,
    task: Option<JoinHandle<()>>,
}

impl KubeResolver {
    /// Spawns the watch task. Must be called within a Tokio runtime.
    pub(crate) fn start<S>(
        target: TargetInfo,
        source: Arc<S>,
        conn: Arc<dyn ClientConn>,
        config: &ResolverConfig,
        metrics: SessionMetrics,
        logger: SharedLogger,
    ) -> Self
    where
        S: EndpointSource + 'static,
    {
        let target = Arc::new(target);
        let cancel = CancellationToken::new();
        let resolve_now = Arc::new(Notify::new());

        let mut watcher = Watcher {
            target: Arc::clone(&target),
            source,
            conn,
            cancel: cancel.clone(),
            resolve_now: Arc::clone(&resolve_now),
            resync_period: config.resync_period,
            metrics: metrics.clone(),
            logger,
            last_pushed: None,
        };

        let initial = config.initial_backoff;
        let max = config.max_backoff;
        let task = tokio::spawn(async move {
            let cancel = watcher.cancel.clone();
            let logger = Arc::clone(&watcher.logger);
            until(
                &mut watcher,
                |w| w.run().boxed(),
                initial,
                max,
                &cancel,
                logger.as_ref(),
            )
            .await;
            tracing::debug!("resolver for {} closed", watcher.target);
        });

        Self {
            target,
            cancel,
            resolve_now,
            metrics,
            task: Some(task),
        }
    }

    /// The target this resolver watches.
    #[must_use]
    pub fn target(&self) -> &TargetInfo {
        &self.target
    }

    /// Unix time (seconds) of the last successful address list push, or 0.
    #[must_use]
    pub fn last_update_unix(&self) -> i64 {
        self.metrics.last_update.get()
    }

    /// Stops the session and waits for its task to finish.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            tracing::warn!("resolver task for {} failed: {e}", self.target);
        }
    }
}

impl Resolver for KubeResolver {
    fn resolve_now(&self) {
        self.resolve_now.notify_one();
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for KubeResolver {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.metrics.remove();
    }
}

/// State owned by the watch task.
struct Watcher<S> {
    target: Arc<TargetInfo>,
    source: Arc<S>,
    conn: Arc<dyn ClientConn>,
    cancel: CancellationToken,
    resolve_now: Arc<Notify>,
    resync_period: Duration,
    metrics: SessionMetrics,
    logger: SharedLogger,
    last_pushed: Option<Vec<Address>>,
}

impl<S: EndpointSource> Watcher<S> {
    async fn run(&mut self) {
        if let Err(e) = self.watch().await {
            self.logger.log(&format!(
                "kuberesolver: watching {} ended with error: {e}, will reconnect",
                self.target
            ));
        }
    }

    /// One list-then-watch cycle. Returns when the watch ends or the session is cancelled.
    ///
    /// Every cycle starts fresh: its first list is pushed even if it matches
    /// the last list of the previous cycle.
    async fn watch(&mut self) -> Result<()> {
        self.last_pushed = None;

        let endpoints = self.fetch().await?;
        let version = endpoints
            .metadata
            .resource_version
            .clone()
            .unwrap_or_default();
        self.update(&endpoints).await;

        let mut events = match self
            .source
            .watch(&self.target.namespace, &self.target.service_name, &version)
            .await
        {
            Ok(events) => events,
            Err(e) => {
                self.conn.report_error(&e);
                return Err(e);
            }
        };

        let mut resync =
            tokio::time::interval_at(Instant::now() + self.resync_period, self.resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return Ok(()),

                () = self.resolve_now.notified() => self.resync().await,

                _ = resync.tick() => self.resync().await,

                event = events.next() => match event {
                    Some(Ok(event)) => self.apply(event).await,
                    Some(Err(e)) => {
                        tracing::warn!("endpoints watch error for {}: {e}", self.target);
                        self.conn.report_error(&e);
                    }
                    None => {
                        tracing::debug!("endpoints watch for {} ended", self.target);
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn fetch(&self) -> Result<Endpoints> {
        self.source
            .list(&self.target.namespace, &self.target.service_name)
            .await
            .inspect_err(|e| self.conn.report_error(e))
    }

    /// Re-reads the endpoints outside the watch stream.
    async fn resync(&mut self) {
        if let Ok(endpoints) = self.fetch().await {
            self.update(&endpoints).await;
        }
    }

    async fn apply(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Added(endpoints) | WatchEvent::Modified(endpoints) => {
                self.update(&endpoints).await;
            }
            WatchEvent::Deleted(_) => {
                self.conn.report_error(&Error::EndpointsDeleted {
                    namespace: self.target.namespace.clone(),
                    service: self.target.service_name.clone(),
                });
            }
            WatchEvent::Bookmark => {}
        }
    }

    /// Pushes the address list computed from `endpoints` if it differs from the
    /// last one pushed. The first list of a session is always pushed.
    async fn update(&mut self, endpoints: &Endpoints) {
        let addresses = make_addresses(endpoints, &self.target);
        self.metrics.record_endpoints(addresses.len());

        if let Some(last) = &self.last_pushed
            && same_addrs(last, &addresses)
        {
            tracing::debug!("address list for {} unchanged", self.target);
            return;
        }

        match self.conn.update_addresses(addresses.clone()).await {
            Ok(()) => {
                tracing::debug!(
                    "Kubernetes resolver: {} addresses for {}",
                    addresses.len(),
                    self.target
                );
                self.last_pushed = Some(addresses);
                self.metrics.record_update();
            }
            Err(e) => self.conn.report_error(&Error::Connection(e)),
        }
    }
}

fn same_addrs(a: &[Address], b: &[Address]) -> bool {
    a.iter().map(|x| x.addr).eq(b.iter().map(|x| x.addr))
}
