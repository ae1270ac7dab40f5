use std::fmt;

use serde::{Deserialize, Serialize};

/// Tag naming a category of remote data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(pub String);

impl EndpointId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: EndpointId,
    /// Rate-limit bucket class; defaults to the endpoint name.
    pub resource_class: String,
    pub required_scope: Option<String>,
    /// Endpoints whose last attempt must have succeeded before this one runs.
    pub prerequisites: Vec<EndpointId>,
}

impl Endpoint {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            resource_class: id.clone(),
            id: EndpointId(id),
            required_scope: None,
            prerequisites: Vec::new(),
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.required_scope = Some(scope.into());
        self
    }

    pub fn with_prerequisite(mut self, endpoint: impl Into<String>) -> Self {
        self.prerequisites.push(EndpointId(endpoint.into()));
        self
    }

    pub fn with_resource_class(mut self, class: impl Into<String>) -> Self {
        self.resource_class = class.into();
        self
    }
}
