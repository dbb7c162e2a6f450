//! Error types.

use thiserror::Error;

/// Boxed error returned by downstream connections.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias for resolver operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by resolver operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The target has no path or authority to resolve.
    #[error("empty target")]
    EmptyTarget,

    /// The target could not be parsed as a URL.
    #[error("invalid target {target:?}: {source}")]
    InvalidTarget {
        /// The offending target.
        target: String,
        /// The underlying URL parse failure.
        source: url::ParseError,
    },

    /// The target parsed, but no service name could be extracted from it.
    #[error("target {target:?} must specify a service")]
    MissingService {
        /// The offending target.
        target: String,
    },

    /// A numeric port that does not fit a TCP port number.
    #[error("invalid port {port:?} in target {target:?}")]
    InvalidPort {
        /// The offending target.
        target: String,
        /// The port as written in the target.
        port: String,
    },

    /// The target was addressed to a different resolver scheme.
    #[error("target scheme {found:?} does not match resolver scheme {expected:?}")]
    SchemeMismatch {
        /// The scheme this builder handles.
        expected: String,
        /// The scheme found in the target.
        found: String,
    },

    /// Invalid resolver configuration values.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A Kubernetes API call failed.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    /// The endpoints watch reported a failure status.
    #[error("endpoints watch failed: {0}")]
    Watch(String),

    /// The watched endpoints object was deleted.
    #[error("endpoints {namespace}/{service} were deleted")]
    EndpointsDeleted {
        /// Namespace of the deleted object.
        namespace: String,
        /// Service name of the deleted object.
        service: String,
    },

    /// The downstream connection rejected an address list update.
    #[error("failed to update connection: {0}")]
    Connection(#[source] BoxError),

    /// The tonic balance channel receiver is gone.
    #[error("balance channel closed")]
    ChannelClosed,

    /// Metrics could not be created or registered.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    /// Returns `true` for errors caused by how the resolver was configured.
    ///
    /// These are surfaced synchronously by [`build`](crate::ResolverBuilder::build)
    /// and never retried.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::EmptyTarget
                | Self::InvalidTarget { .. }
                | Self::MissingService { .. }
                | Self::InvalidPort { .. }
                | Self::SchemeMismatch { .. }
                | Self::InvalidConfig(_)
                | Self::Metrics(_)
        )
    }
}
