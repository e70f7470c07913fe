use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid {annotation} annotation: {source}")]
    Json {
        annotation: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("port {port} in {annotation} annotation is out of range")]
    PortRange { annotation: String, port: i32 },
}

/// A transport protocol as it appears in annotations.
///
/// Values other than TCP and UDP are kept verbatim so that callers can skip
/// them instead of failing to decode the whole annotation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Protocol {
    Tcp,
    Udp,
    Other(String),
}

/// Identifies a port within a shared resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId {
    pub protocol: Protocol,
    pub port: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposedPort {
    pub protocol: Protocol,
    pub port: i32,
    pub target_port: i32,
}

/// The ports a single contributor wants exposed, deduplicated by
/// `(protocol, port)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExposedPorts(Vec<ExposedPort>);

/// One externally routable HTTP path of a contributor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CesService {
    pub name: String,
    pub port: i32,
    pub location: String,
    pub pass: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<String>,
}

/// A regex path rewrite declared by a [`CesService`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRewrite {
    pub pattern: String,
    pub rewrite: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlternativeFqdn {
    pub fqdn: String,
    pub certificate_secret_name: Option<String>,
}

/// The Service whose annotations drive a reconciliation.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Contributor {
    pub namespace: String,
    pub name: String,
}

// === impl Protocol ===

impl Protocol {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
            Self::Other(p) => p,
        }
    }

    /// Only TCP and UDP can be forwarded by an ingress backend.
    pub fn is_forwardable(&self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

impl From<String> for Protocol {
    fn from(s: String) -> Self {
        if s.eq_ignore_ascii_case("tcp") {
            Self::Tcp
        } else if s.eq_ignore_ascii_case("udp") {
            Self::Udp
        } else {
            Self::Other(s)
        }
    }
}

impl From<&str> for Protocol {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}

impl From<Protocol> for String {
    fn from(p: Protocol) -> Self {
        match p {
            Protocol::Other(p) => p,
            p => p.as_str().to_string(),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ExposedPort ===

impl ExposedPort {
    pub fn new(protocol: impl Into<Protocol>, port: i32, target_port: i32) -> Self {
        Self {
            protocol: protocol.into(),
            port,
            target_port,
        }
    }

    pub fn id(&self) -> PortId {
        PortId {
            protocol: self.protocol.clone(),
            port: self.port,
        }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

// === impl ExposedPorts ===

impl ExposedPorts {
    /// Decodes the JSON value of the annotation named `annotation`.
    pub fn parse(annotation: &str, json: &str) -> Result<Self, ParseError> {
        let ports = serde_json::from_str::<Vec<ExposedPort>>(json).map_err(|source| {
            ParseError::Json {
                annotation: annotation.to_string(),
                source,
            }
        })?;
        for p in &ports {
            if !(1..=65535).contains(&p.port) || !(1..=65535).contains(&p.target_port) {
                return Err(ParseError::PortRange {
                    annotation: annotation.to_string(),
                    port: if (1..=65535).contains(&p.port) {
                        p.target_port
                    } else {
                        p.port
                    },
                });
            }
        }
        Ok(ports.into_iter().collect())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ExposedPort> {
        self.0.iter()
    }

    pub fn with_protocol(&self, protocol: &Protocol) -> Self {
        self.iter()
            .filter(|p| p.protocol == *protocol)
            .cloned()
            .collect()
    }

    /// Splits the ports into forwardable (TCP/UDP) ports and everything else.
    pub fn partition_forwardable(&self) -> (Self, Vec<ExposedPort>) {
        let (forwardable, ignored): (Vec<_>, Vec<_>) =
            self.0.iter().cloned().partition(|p| p.protocol.is_forwardable());
        (Self(forwardable), ignored)
    }
}

/// Later ports replace earlier ports with the same identity.
impl FromIterator<ExposedPort> for ExposedPorts {
    fn from_iter<T: IntoIterator<Item = ExposedPort>>(iter: T) -> Self {
        let mut ports: Vec<ExposedPort> = Vec::new();
        for port in iter {
            match ports.iter_mut().find(|p| p.id() == port.id()) {
                Some(existing) => *existing = port,
                None => ports.push(port),
            }
        }
        Self(ports)
    }
}

impl<'a> IntoIterator for &'a ExposedPorts {
    type Item = &'a ExposedPort;
    type IntoIter = std::slice::Iter<'a, ExposedPort>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// === impl CesService ===

impl CesService {
    pub fn parse_list(annotation: &str, json: &str) -> Result<Vec<Self>, ParseError> {
        serde_json::from_str(json).map_err(|source| ParseError::Json {
            annotation: annotation.to_string(),
            source,
        })
    }

    /// A rewrite-target is only needed when the public path differs from
    /// the internal one.
    pub fn needs_rewrite_target(&self) -> bool {
        self.pass != self.location
    }

    pub fn service_rewrite(&self) -> Result<Option<ServiceRewrite>, ParseError> {
        match self.rewrite.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(json) => serde_json::from_str(json)
                .map(Some)
                .map_err(|source| ParseError::Json {
                    annotation: format!("rewrite of ces-service {}", self.name),
                    source,
                }),
        }
    }
}

// === impl ServiceRewrite ===

impl ServiceRewrite {
    /// Renders the rewrite as an nginx `rewrite` directive.
    pub fn nginx_directive(&self) -> String {
        format!(
            "rewrite ^/{}(/|$)(.*) {}/$2 break;",
            self.pattern, self.rewrite
        )
    }

    /// Returns the equivalent `(regex, replacement)` pair for path rewriting
    /// middlewares.
    pub fn path_regex(&self) -> (String, String) {
        (
            format!("^/{}(/|$)(.*)", self.pattern),
            format!("{}/${{2}}", self.rewrite),
        )
    }
}

// === impl AlternativeFqdn ===

impl AlternativeFqdn {
    /// Parses a comma separated list of `fqdn[:certificateSecretName]`.
    pub fn parse_list(value: &str) -> Vec<Self> {
        value
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| match item.split_once(':') {
                Some((fqdn, secret)) if !secret.trim().is_empty() => Self {
                    fqdn: fqdn.trim().to_string(),
                    certificate_secret_name: Some(secret.trim().to_string()),
                },
                Some((fqdn, _)) => Self {
                    fqdn: fqdn.trim().to_string(),
                    certificate_secret_name: None,
                },
                None => Self {
                    fqdn: item.to_string(),
                    certificate_secret_name: None,
                },
            })
            .collect()
    }

    /// Groups hosts by the certificate secret that serves them.
    pub fn group_by_certificate(alternatives: &[Self]) -> BTreeMap<Option<String>, Vec<String>> {
        let mut groups = BTreeMap::<Option<String>, Vec<String>>::new();
        for alt in alternatives {
            let hosts = groups
                .entry(alt.certificate_secret_name.clone())
                .or_default();
            if !hosts.contains(&alt.fqdn) {
                hosts.push(alt.fqdn.clone());
            }
        }
        groups
    }
}

// === impl Contributor ===

impl Contributor {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// The forwarding target string for one of the contributor's ports.
    pub fn forward_target(&self, target_port: i32) -> String {
        format!("{}/{}:{}", self.namespace, self.name, target_port)
    }

    /// Tests whether a forwarding target string points at this contributor.
    pub fn owns_forward_target(&self, target: &str) -> bool {
        target
            .strip_prefix(&self.namespace)
            .and_then(|rest| rest.strip_prefix('/'))
            .and_then(|rest| rest.strip_prefix(&self.name))
            .and_then(|rest| rest.strip_prefix(':'))
            .map_or(false, |port| port.parse::<u16>().is_ok())
    }
}

impl fmt::Display for Contributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
