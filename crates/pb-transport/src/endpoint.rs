//! Named network destinations (spec.md §3 `Endpoint`), read-only
//! configuration resolved by name for outbound rules and by destination URI
//! for peer-initiated messages.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    Basic { username: String, password: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub base_uri: String,
    pub credentials: Option<Credentials>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, base_uri: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_uri: base_uri.into(),
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Read-only table of configured endpoints, keyed by name and by base URI.
#[derive(Debug, Clone, Default)]
pub struct EndpointTable {
    by_name: HashMap<String, Endpoint>,
}

impl EndpointTable {
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let by_name = endpoints.into_iter().map(|e| (e.name.clone(), e)).collect();
        Self { by_name }
    }

    pub fn by_name(&self, name: &str) -> Option<&Endpoint> {
        self.by_name.get(name)
    }

    /// Resolves by destination URI, used to attribute an inbound message to
    /// a configured endpoint for its sender.
    pub fn by_base_uri(&self, base_uri: &str) -> Option<&Endpoint> {
        self.by_name.values().find(|e| e.base_uri == base_uri)
    }
}
