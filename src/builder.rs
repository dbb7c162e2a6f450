//! Resolver construction.

use std::sync::Arc;

use crate::config::ResolverConfig;
use crate::error::{Error, Result};
use crate::k8s::{EndpointSource, KubeEndpointSource};
use crate::logger::{SharedLogger, TracingLogger};
use crate::metrics::ResolverMetrics;
use crate::resolver::{ClientConn, KubeResolver, Resolver};
use crate::target::parse_target;

/// Scheme handled by default: `kubernetes:///service.namespace:port`.
pub const DEFAULT_SCHEME: &str = "kubernetes";

/// Factory for resolvers of one target scheme.
pub trait ResolverBuilder {
    /// The resolver type produced by [`build`](Self::build).
    type Resolver: Resolver;

    /// The URI scheme this builder handles.
    fn scheme(&self) -> &str;

    /// Parses `target` and starts a resolver reporting to `conn`.
    ///
    /// # Errors
    ///
    /// Fails on configuration errors only: a foreign scheme, an unparseable
    /// target or invalid settings. No session is started in that case.
    fn build(
        &self,
        target: &str,
        conn: Arc<dyn ClientConn>,
        options: BuildOptions,
    ) -> Result<Self::Resolver>;
}

/// Per-resolver options passed to [`ResolverBuilder::build`].
#[derive(Clone, Default)]
#[non_exhaustive]
pub struct BuildOptions {
    /// Overrides the builder's logger for this resolver.
    pub logger: Option<SharedLogger>,
}

impl BuildOptions {
    /// Sets the logger for this resolver.
    #[must_use]
    pub fn logger(mut self, logger: SharedLogger) -> Self {
        self.logger = Some(logger);
        self
    }
}

/// Builds [`KubeResolver`]s watching endpoints from an [`EndpointSource`].
///
/// # Example
///
/// ```ignore
/// use std::sync::Arc;
/// use tonic_k8s_resolver::{BuildOptions, Builder, ResolverBuilder};
///
/// let builder = Builder::in_cluster().await?;
/// let resolver = builder.build(
///     "kubernetes:///my-service.my-namespace:grpc",
///     Arc::new(my_conn),
///     BuildOptions::default(),
/// )?;
/// ```
pub struct Builder<S> {
    source: Arc<S>,
    scheme: String,
    config: ResolverConfig,
    logger: SharedLogger,
    metrics: Option<ResolverMetrics>,
}

impl Builder<KubeEndpointSource> {
    /// Creates a builder using the inferred Kubernetes client configuration.
    ///
    /// # Errors
    ///
    /// Fails if no usable Kubernetes configuration is found.
    pub async fn in_cluster() -> Result<Self> {
        Ok(Self::new(KubeEndpointSource::try_default().await?))
    }
}

impl<S> Builder<S>
where
    S: EndpointSource + 'static,
{
    /// Creates a builder for the [`DEFAULT_SCHEME`] reading from `source`.
    #[must_use]
    pub fn new(source: S) -> Self {
        Self {
            source: Arc::new(source),
            scheme: DEFAULT_SCHEME.to_string(),
            config: ResolverConfig::default(),
            logger: Arc::new(TracingLogger),
            metrics: None,
        }
    }

    /// Sets the scheme targets must use.
    #[must_use]
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Sets the timing configuration.
    #[must_use]
    pub fn config(mut self, config: ResolverConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the default logger of built resolvers.
    #[must_use]
    pub fn logger(mut self, logger: SharedLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Records metrics into `metrics` instead of the process-wide gauges.
    #[must_use]
    pub fn metrics(mut self, metrics: ResolverMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

impl<S> ResolverBuilder for Builder<S>
where
    S: EndpointSource + 'static,
{
    type Resolver = KubeResolver;

    fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Must be called within a Tokio runtime; the watch runs as a spawned task.
    ///
    /// A target without a scheme is taken as addressed to this builder.
    fn build(
        &self,
        target: &str,
        conn: Arc<dyn ClientConn>,
        options: BuildOptions,
    ) -> Result<KubeResolver> {
        let info = parse_target(target)?;

        if !info.scheme.is_empty() && info.scheme != self.scheme {
            return Err(Error::SchemeMismatch {
                expected: self.scheme.clone(),
                found: info.scheme,
            });
        }

        self.config.validate()?;

        let metrics = match &self.metrics {
            Some(metrics) => metrics.session(target),
            None => ResolverMetrics::global()?.session(target),
        };

        tracing::debug!("building resolver for {info}");

        Ok(KubeResolver::start(
            info,
            Arc::clone(&self.source),
            conn,
            &self.config,
            metrics,
            options.logger.unwrap_or_else(|| Arc::clone(&self.logger)),
        ))
    }
}
