use std::sync::Arc;

use chronicle_config::EndpointSpec;
use chronicle_core::{
    reconcile, Attributes, Endpoint, Fact, Snapshot, SnapshotNode, Target, TargetId, Update,
};
use chronicle_infra::{ApiClient, ApiRequest, FetchError, Fetched, RawData};
use serde_json::Value;

use super::{EndpointAdapter, ProcessContext, ProcessingError};

/// One adapter type for every JSON endpoint; behavior comes from its [`EndpointSpec`].
pub struct JsonEndpointAdapter {
    spec: EndpointSpec,
    endpoint: Endpoint,
    client: Arc<ApiClient>,
}

impl JsonEndpointAdapter {
    pub fn new(spec: EndpointSpec, client: Arc<ApiClient>) -> Self {
        let endpoint = spec.to_endpoint();
        Self {
            spec,
            endpoint,
            client,
        }
    }

    pub fn spec(&self) -> &EndpointSpec {
        &self.spec
    }

    /// Parses a JSON body into a snapshot. A lone object counts as one item; `null` is
    /// malformed, not empty.
    pub fn snapshot(&self, body: &Value) -> Result<Snapshot, ProcessingError> {
        let roots = match body {
            Value::Array(items) => self.nodes(items)?,
            Value::Object(_) => vec![self.node(body)?],
            other => {
                return Err(ProcessingError::Malformed(format!(
                    "expected an array, got {}",
                    kind_of(other)
                )))
            }
        };
        Ok(Snapshot::new(roots))
    }

    fn nodes(&self, items: &[Value]) -> Result<Vec<SnapshotNode>, ProcessingError> {
        items.iter().map(|item| self.node(item)).collect()
    }

    fn node(&self, item: &Value) -> Result<SnapshotNode, ProcessingError> {
        let object = item.as_object().ok_or_else(|| {
            ProcessingError::Malformed(format!("expected an object, got {}", kind_of(item)))
        })?;
        let id = match object.get(&self.spec.id_field) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(ProcessingError::Malformed(format!(
                    "item without usable '{}' field",
                    self.spec.id_field
                )))
            }
        };

        let mut attributes = Attributes::new();
        let mut children = Vec::new();
        for (name, value) in object {
            if Some(name) == self.spec.children_field.as_ref() {
                if let Value::Array(nested) = value {
                    children = self.nodes(nested)?;
                }
                continue;
            }
            attributes.insert(name.clone(), value.clone());
        }
        Ok(SnapshotNode::leaf(id, attributes).with_children(children))
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait::async_trait]
impl EndpointAdapter for JsonEndpointAdapter {
    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn applies_to(&self, target: TargetId) -> bool {
        self.spec.applies_to.matches(target)
    }

    async fn fetch(
        &self,
        target: &Target,
        continuation: Option<&str>,
    ) -> Result<Fetched, FetchError> {
        let req = ApiRequest {
            url: self.spec.url_for(target.id),
            class: self.endpoint.resource_class.clone(),
            target: target.id,
            bearer: target.access_token.clone(),
            if_none_match: continuation.map(str::to_string),
            paged: self.spec.paged,
        };
        self.client.fetch(&req).await
    }

    fn process(
        &self,
        ctx: &ProcessContext<'_>,
        data: &RawData,
    ) -> Result<Vec<Update<Fact>>, ProcessingError> {
        let body = match data {
            RawData::NotModified => return Ok(Vec::new()),
            RawData::Json(body) => body,
            RawData::Undecodable(complaint) => {
                return Err(ProcessingError::Malformed(complaint.clone()))
            }
        };
        let kind = self.endpoint.id.as_str();
        let candidates = self.snapshot(body)?.flatten(kind, ctx.target.id);
        let live = ctx.records.get_all_live(kind, ctx.target.id, ctx.at)?;
        Ok(reconcile(live, candidates, ctx.at))
    }
}
