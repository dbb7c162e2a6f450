//! Resolver target parsing.
//!
//! A target names a Kubernetes service and, optionally, its namespace and port:
//!
//! ```text
//! [scheme://][namespace/]service[.namespace][:port]
//! ```
//!
//! Fully qualified in-cluster names such as `service.namespace.svc.cluster.local`
//! are accepted; only the service and namespace labels are kept.

use std::fmt;

use url::Url;

use crate::error::{Error, Result};

/// Base used to resolve targets written without a scheme.
const RELATIVE_BASE: &str = "resolver:///";

/// Port specification for the gRPC service.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Port {
    /// A numeric port number.
    Number(u16),
    /// A named port (matched against the endpoint port names).
    Name(String),
}

impl From<u16> for Port {
    fn from(port: u16) -> Self {
        Self::Number(port)
    }
}

impl From<&str> for Port {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for Port {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

/// A parsed resolver target.
///
/// `port` selects how endpoint ports are chosen: `None` picks the first port
/// declared by each endpoint subset, [`Port::Number`] filters by number and
/// [`Port::Name`] filters by name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TargetInfo {
    /// Scheme the target was addressed through; empty when the target had none.
    pub scheme: String,
    /// The Kubernetes service name.
    pub service_name: String,
    /// The service namespace; empty means the client's default namespace.
    pub namespace: String,
    /// The requested port, if any.
    pub port: Option<Port>,
}

impl TargetInfo {
    /// Returns `true` when the port must be matched by name.
    #[must_use]
    pub fn resolve_by_port_name(&self) -> bool {
        matches!(self.port, Some(Port::Name(_)))
    }

    /// Returns `true` when no port was given and the first declared port is used.
    #[must_use]
    pub fn use_first_port(&self) -> bool {
        self.port.is_none()
    }

    /// Returns the `service.namespace` name used as the server name of resolved addresses.
    #[must_use]
    pub fn server_name(&self) -> String {
        if self.namespace.is_empty() {
            self.service_name.clone()
        } else {
            format!("{}.{}", self.service_name, self.namespace)
        }
    }
}

/// Renders the canonical `[scheme:]//namespace/service[:port]` form, which parses
/// back into an equal `TargetInfo`.
impl fmt::Display for TargetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme.is_empty() && self.namespace.is_empty() {
            write!(f, "/{}", self.service_name)?;
        } else if self.scheme.is_empty() {
            write!(f, "//{}/{}", self.namespace, self.service_name)?;
        } else {
            write!(f, "{}://{}/{}", self.scheme, self.namespace, self.service_name)?;
        }

        if let Some(port) = &self.port {
            write!(f, ":{port}")?;
        }

        Ok(())
    }
}

impl std::str::FromStr for TargetInfo {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_target(s)
    }
}

/// Parses a resolver target into a [`TargetInfo`].
///
/// When the target has an authority and a non-empty path, the authority is the
/// namespace and the path is the service. Otherwise the service, namespace and
/// port are split out of whichever component is present.
///
/// A port made only of digits selects numeric port matching. Such a port must
/// also fit in a `u16`: `kubernetes:///svc.ns:70000` is rejected with
/// [`Error::InvalidPort`] instead of being matched against nothing.
///
/// # Errors
///
/// Fails when the target is empty, is not a valid URL, names no service, or
/// carries a numeric port outside the TCP port range.
pub fn parse_target(target: &str) -> Result<TargetInfo> {
    let (url, scheme) = match Url::parse(target) {
        Ok(url) => {
            let scheme = url.scheme().to_string();
            (url, scheme)
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let url = Url::parse(RELATIVE_BASE)
                .and_then(|base| base.join(target))
                .map_err(|source| invalid(target, source))?;
            (url, String::new())
        }
        Err(source) => return Err(invalid(target, source)),
    };

    let host = url.host_str().unwrap_or_default();
    let endpoint = url.path().strip_prefix('/').unwrap_or(url.path());

    if host.is_empty() && endpoint.is_empty() {
        return Err(Error::EmptyTarget);
    }

    let authority;
    let (service, port, namespace) = if host.is_empty() {
        // scheme:///service.namespace:port
        split_service_port_namespace(endpoint)
    } else if url.port().is_none() && !endpoint.is_empty() {
        // scheme://namespace/service:port
        let (service, port, _) = split_service_port_namespace(endpoint);
        (service, port, host)
    } else {
        // scheme://service.namespace:port
        authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        split_service_port_namespace(&authority)
    };

    if service.is_empty() {
        return Err(Error::MissingService {
            target: target.to_string(),
        });
    }

    let port = classify_port(target, port)?;

    Ok(TargetInfo {
        scheme,
        service_name: service.to_string(),
        namespace: namespace.to_string(),
        port,
    })
}

fn invalid(target: &str, source: url::ParseError) -> Error {
    Error::InvalidTarget {
        target: target.to_string(),
        source,
    }
}

/// Splits `service[.namespace[.rest]][:port]` into its parts.
///
/// Labels past the namespace (e.g. `svc.cluster.local`) are dropped.
fn split_service_port_namespace(hpn: &str) -> (&str, &str, &str) {
    let (name, port) = hpn.rsplit_once(':').unwrap_or((hpn, ""));

    let mut labels = name.splitn(3, '.');
    let service = labels.next().unwrap_or_default();

    match labels.next() {
        Some(namespace) => (service, port, namespace),
        None => (name, port, ""),
    }
}

fn classify_port(target: &str, port: &str) -> Result<Option<Port>> {
    if port.is_empty() {
        return Ok(None);
    }

    if !port.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(Some(Port::Name(port.to_string())));
    }

    port.parse::<u16>()
        .map(|n| Some(Port::Number(n)))
        .map_err(|_| Error::InvalidPort {
            target: target.to_string(),
            port: port.to_string(),
        })
}
