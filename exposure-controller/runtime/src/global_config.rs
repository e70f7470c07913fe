use crate::{core::AlternativeFqdn, k8s::ConfigMap};
use std::collections::BTreeMap;

const FQDN: &str = "fqdn";
const ALTERNATIVE_FQDNS: &str = "alternativeFQDNs";
const MAINTENANCE: &str = "maintenance";

/// The cluster-wide settings read from the global config ConfigMap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GlobalConfig {
    pub fqdn: Option<String>,
    pub alternatives: Vec<AlternativeFqdn>,
    pub maintenance: bool,
}

impl GlobalConfig {
    pub fn from_config_map(cm: &ConfigMap) -> Self {
        cm.data.as_ref().map(Self::from_data).unwrap_or_default()
    }

    pub fn from_data(data: &BTreeMap<String, String>) -> Self {
        let value = |key: &str| {
            data.get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };
        Self {
            fqdn: value(FQDN).map(str::to_string),
            alternatives: value(ALTERNATIVE_FQDNS)
                .map(AlternativeFqdn::parse_list)
                .unwrap_or_default(),
            // Any value other than `false` describes an active maintenance.
            maintenance: value(MAINTENANCE).map_or(false, |v| !v.eq_ignore_ascii_case("false")),
        }
    }

    /// The primary FQDN and its alternatives. Without a primary FQDN there is
    /// nothing to redirect to.
    pub fn redirect(&self) -> (String, Vec<AlternativeFqdn>) {
        match &self.fqdn {
            Some(fqdn) => (fqdn.clone(), self.alternatives.clone()),
            None => (String::new(), Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_global_config() {
        let config = GlobalConfig::from_data(&btreemap! {
            "fqdn".to_string() => "ces.example.com".to_string(),
            "alternativeFQDNs".to_string() => "alt.example.com:alt-cert, other.example.com".to_string(),
            "maintenance".to_string() => r#"{"title":"Update","text":"Back soon"}"#.to_string(),
        });
        assert_eq!(config.fqdn.as_deref(), Some("ces.example.com"));
        assert_eq!(
            config.alternatives,
            vec![
                AlternativeFqdn {
                    fqdn: "alt.example.com".to_string(),
                    certificate_secret_name: Some("alt-cert".to_string()),
                },
                AlternativeFqdn {
                    fqdn: "other.example.com".to_string(),
                    certificate_secret_name: None,
                },
            ]
        );
        assert!(config.maintenance);
    }

    #[test]
    fn maintenance_flag() {
        let maintenance = |value: &str| {
            GlobalConfig::from_data(&btreemap! {
                "maintenance".to_string() => value.to_string(),
            })
            .maintenance
        };
        assert!(!maintenance(""));
        assert!(!maintenance("false"));
        assert!(!maintenance(" FALSE "));
        assert!(maintenance("true"));
        assert!(!GlobalConfig::default().maintenance);
    }

    #[test]
    fn no_redirect_without_fqdn() {
        let config = GlobalConfig::from_data(&btreemap! {
            "alternativeFQDNs".to_string() => "alt.example.com".to_string(),
        });
        assert_eq!(config.redirect(), (String::new(), vec![]));
    }
}
