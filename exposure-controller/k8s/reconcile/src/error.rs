use exposure_controller_core::ParseError;
use exposure_controller_k8s_api as k8s;
use thiserror::Error;

/// Errors reported by external collaborators such as the readiness oracle.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to {op} {kind} {name}: {source}")]
    Api {
        op: &'static str,
        kind: String,
        name: String,
        #[source]
        source: k8s::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("failed to encode {what}: {source}")]
    Encode {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("exposed port {port} is not a port of service {service}")]
    UndeclaredPort { service: String, port: i32 },

    #[error("failed to read maintenance mode: {0}")]
    Maintenance(#[source] BoxError),

    #[error("failed to read readiness of deployment {name}: {source}")]
    Readiness {
        name: String,
        #[source]
        source: BoxError,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn api(
        op: &'static str,
        kind: impl ToString,
        name: impl ToString,
        source: k8s::Error,
    ) -> Self {
        Self::Api {
            op,
            kind: kind.to_string(),
            name: name.to_string(),
            source,
        }
    }

    pub(crate) fn encode(what: impl ToString, source: serde_json::Error) -> Self {
        Self::Encode {
            what: what.to_string(),
            source,
        }
    }

    /// Tests whether the underlying API error is a not-found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { source, .. } if k8s::is_not_found(source))
    }

    /// Tests whether the error stems from malformed input, which fails the
    /// same way until the input changes.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Parse(_) | Self::UndeclaredPort { .. })
    }

    /// Tests whether the underlying API error is an optimistic-concurrency
    /// conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Api { source, .. } if k8s::is_conflict(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::api(
            "replace",
            "ConfigMap",
            "tcp-services",
            k8s::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "test".to_string(),
                reason: "Test".to_string(),
                code,
            }),
        )
    }

    #[test]
    fn classification() {
        assert!(api_error(409).is_conflict());
        assert!(!api_error(409).is_permanent());
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_permanent());

        let undeclared = Error::UndeclaredPort {
            service: "ldap".to_string(),
            port: 636,
        };
        assert!(undeclared.is_permanent());

        let malformed = ParseError::Json {
            annotation: "ces-exposed-ports".to_string(),
            source: serde_json::from_str::<u8>("nope").expect_err("must fail"),
        };
        assert!(Error::from(malformed).is_permanent());

        let readiness = Error::Readiness {
            name: "cas".to_string(),
            source: "unavailable".into(),
        };
        assert!(!readiness.is_permanent());
    }
}
