//! Per-contributor ownership records stored as annotations on a shared
//! resource.
//!
//! The key of a record is `<domain>/<prefix><contributor>`, where the part
//! after the `/` is cut to the 63 characters Kubernetes allows for an
//! annotation name. Contributors whose names share the same truncated prefix
//! therefore map to the same record.

use crate::exposure::{ExposedPorts, ParseError};
use std::collections::BTreeMap;

/// Maximum length of the name segment of an annotation key.
pub const MAX_KEY_NAME_LEN: usize = 63;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnershipAnnotations {
    domain: String,
    prefix: String,
}

impl Default for OwnershipAnnotations {
    fn default() -> Self {
        Self::new("k8s.cloudogu.com", "ces-exposed-ports-")
    }
}

impl OwnershipAnnotations {
    pub fn new(domain: impl ToString, prefix: impl ToString) -> Self {
        Self {
            domain: domain.to_string(),
            prefix: prefix.to_string(),
        }
    }

    /// Returns the annotation key that records `contributor`'s entries.
    pub fn key(&self, contributor: &str) -> String {
        let name = format!("{}{}", self.prefix, contributor);
        let name = name.chars().take(MAX_KEY_NAME_LEN).collect::<String>();
        // Annotation names must end with an alphanumeric character.
        let name = name.trim_end_matches(|c: char| !c.is_ascii_alphanumeric());
        format!("{}/{}", self.domain, name)
    }

    fn is_ownership_key(&self, key: &str) -> bool {
        key.strip_prefix(&self.domain)
            .and_then(|rest| rest.strip_prefix('/'))
            .map_or(false, |name| name.starts_with(&self.prefix))
    }

    /// Reads `contributor`'s record. A missing record owns nothing.
    pub fn read(
        &self,
        annotations: &BTreeMap<String, String>,
        contributor: &str,
    ) -> Result<ExposedPorts, ParseError> {
        let key = self.key(contributor);
        match annotations.get(&key) {
            Some(json) => ExposedPorts::parse(&key, json),
            None => Ok(ExposedPorts::default()),
        }
    }

    /// Reads every record except `contributor`'s.
    pub fn read_others(
        &self,
        annotations: &BTreeMap<String, String>,
        contributor: &str,
    ) -> Result<Vec<ExposedPorts>, ParseError> {
        let own = self.key(contributor);
        annotations
            .iter()
            .filter(|(key, _)| **key != own && self.is_ownership_key(key))
            .map(|(key, json)| ExposedPorts::parse(key, json))
            .collect()
    }

    /// Replaces `contributor`'s record, removing it when `ports` is empty.
    pub fn write(
        &self,
        annotations: &mut BTreeMap<String, String>,
        contributor: &str,
        ports: &ExposedPorts,
    ) -> serde_json::Result<()> {
        let key = self.key(contributor);
        if ports.is_empty() {
            annotations.remove(&key);
        } else {
            annotations.insert(key, ports.to_json()?);
        }
        Ok(())
    }
}
