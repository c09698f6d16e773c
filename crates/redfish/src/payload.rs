//! Thin typed wrapper over decoded Redfish documents.
//!
//! The Redfish universe is too open for schema binding, so a payload keeps
//! the raw decoded tree and offers three navigations: named fields,
//! positional members, and scalar reads. References of the shape
//! `{"@odata.id": "/redfish/v1/..."}` are dereferenced lazily through the
//! owning client; inline values are wrapped in place.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::Client;

#[derive(Clone)]
pub struct Payload {
    client: Client,
    value: Value,
}

/// A navigated node: a nested document, a positional list, or a leaf value.
pub enum Node {
    Object(Payload),
    Array(Payload),
    Scalar(Value),
}

impl Payload {
    pub(crate) fn new(client: Client, value: Value) -> Self {
        Self { client, value }
    }

    pub fn raw(&self) -> &Value {
        &self.value
    }

    /// Scalar string field, `None` when absent or non-string.
    pub fn string(&self, name: &str) -> Option<&str> {
        self.value.get(name).and_then(Value::as_str)
    }

    /// A resource collection carries a `Members` list.
    pub fn is_collection(&self) -> bool {
        self.value.get("Members").is_some()
    }

    pub fn collection_size(&self) -> usize {
        self.value
            .get("Members@odata.count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize
    }

    /// An event collection carries an `Events` list.
    pub fn is_event_collection(&self) -> bool {
        self.value.get("Events").is_some()
    }

    pub fn array_len(&self) -> usize {
        self.value.as_array().map(Vec::len).unwrap_or(0)
    }

    /// Navigate to a named field, following an `@odata.id` reference if that
    /// is all the field holds.
    pub async fn field(&self, name: &str) -> Result<Payload> {
        let value = self
            .value
            .get(name)
            .ok_or_else(|| Error::MissingField(name.to_string()))?;
        self.resolve(value).await
    }

    /// Navigate to a positional member: `Members[i]` on a collection,
    /// otherwise the i-th element of the underlying array.
    pub async fn index(&self, index: usize) -> Result<Payload> {
        let list = if self.is_collection() {
            self.value.get("Members").and_then(Value::as_array)
        } else {
            self.value.as_array()
        };
        let value = list
            .and_then(|items| items.get(index))
            .ok_or(Error::IndexOutOfRange(index))?;
        self.resolve(value).await
    }

    /// Classify a named field without dereferencing.
    pub fn node(&self, name: &str) -> Result<Node> {
        let value = self
            .value
            .get(name)
            .ok_or_else(|| Error::MissingField(name.to_string()))?;
        Ok(match value {
            Value::Object(_) => Node::Object(Payload::new(self.client.clone(), value.clone())),
            Value::Array(_) => Node::Array(Payload::new(self.client.clone(), value.clone())),
            other => Node::Scalar(other.clone()),
        })
    }

    async fn resolve(&self, value: &Value) -> Result<Payload> {
        if let Some(uri) = reference_uri(value) {
            return self.client.get(uri).await;
        }
        Ok(Payload::new(self.client.clone(), value.clone()))
    }
}

/// A value is a reference when it is an object holding exactly one key,
/// `@odata.id`.
fn reference_uri(value: &Value) -> Option<&str> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object.get("@odata.id")?.as_str()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_odata_id_is_a_reference() {
        let value = serde_json::json!({"@odata.id": "/redfish/v1/Chassis"});
        assert_eq!(reference_uri(&value), Some("/redfish/v1/Chassis"));
    }

    #[test]
    fn expanded_objects_are_not_references() {
        let value = serde_json::json!({"@odata.id": "/redfish/v1/Chassis", "Name": "x"});
        assert_eq!(reference_uri(&value), None);
        assert_eq!(reference_uri(&serde_json::json!("/redfish/v1")), None);
        assert_eq!(reference_uri(&serde_json::json!({"Name": "x"})), None);
    }
}
