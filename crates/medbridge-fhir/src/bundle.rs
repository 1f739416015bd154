//! FHIR Bundle封装
//!
//! 以serde_json::Value为底层表示的类型化包装, 未知元素在解析/序列化
//! 往返中原样保留。

use medbridge_core::{BridgeError, Result};
use serde_json::{json, Value};

/// FHIR Bundle (底层保留原始JSON树)
#[derive(Debug, Clone, PartialEq)]
pub struct FhirBundle {
    root: Value,
}

impl FhirBundle {
    /// 新建transaction类型Bundle
    pub fn new_transaction(timestamp: &str) -> Self {
        Self {
            root: json!({
                "resourceType": "Bundle",
                "type": "transaction",
                "timestamp": timestamp,
                "entry": []
            }),
        }
    }

    /// 从JSON文本解析
    pub fn parse(text: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(text)?;
        Self::from_value(root)
    }

    /// 从JSON值构建, 校验resourceType
    pub fn from_value(root: Value) -> Result<Self> {
        match root.get("resourceType").and_then(Value::as_str) {
            Some("Bundle") => Ok(Self { root }),
            Some(other) => Err(BridgeError::Parse(format!(
                "expected Bundle, got resourceType {other:?}"
            ))),
            None => Err(BridgeError::Parse("missing resourceType".to_string())),
        }
    }

    /// Bundle类型 (transaction / collection / ...)
    pub fn bundle_type(&self) -> Option<&str> {
        self.root.get("type").and_then(Value::as_str)
    }

    /// 追加资源条目 (transaction entry附带request)
    pub fn push_resource(&mut self, resource: Value, request_url: &str) {
        let entry = json!({
            "resource": resource,
            "request": { "method": "POST", "url": request_url }
        });
        if let Some(entries) = self
            .root
            .get_mut("entry")
            .and_then(Value::as_array_mut)
        {
            entries.push(entry);
        } else {
            self.root["entry"] = json!([entry]);
        }
    }

    /// 全部条目资源
    pub fn resources(&self) -> Vec<&Value> {
        self.root
            .get("entry")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.get("resource"))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 指定资源类型的条目
    pub fn resources_of_type(&self, resource_type: &str) -> Vec<&Value> {
        self.resources()
            .into_iter()
            .filter(|r| {
                r.get("resourceType").and_then(Value::as_str) == Some(resource_type)
            })
            .collect()
    }

    pub fn as_value(&self) -> &Value {
        &self.root
    }

    pub fn into_value(self) -> Value {
        self.root
    }

    /// 序列化为JSON文本
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.root)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_bundle_entries() {
        let mut bundle = FhirBundle::new_transaction("2024-01-15T10:30:00Z");
        bundle.push_resource(json!({"resourceType": "Patient", "id": "p1"}), "Patient");
        bundle.push_resource(json!({"resourceType": "Encounter", "id": "e1"}), "Encounter");
        assert_eq!(bundle.bundle_type(), Some("transaction"));
        assert_eq!(bundle.resources().len(), 2);
        assert_eq!(bundle.resources_of_type("Patient").len(), 1);
    }

    #[test]
    fn test_unknown_elements_roundtrip() {
        let text = r#"{
            "resourceType": "Bundle",
            "type": "collection",
            "unknownTopLevel": {"nested": true},
            "entry": [{"resource": {"resourceType": "Patient", "proprietaryX": 42}}]
        }"#;
        let bundle = FhirBundle::parse(text).unwrap();
        let reserialized = bundle.to_json().unwrap();
        let reparsed = FhirBundle::parse(&reserialized).unwrap();
        assert_eq!(bundle, reparsed);
        assert!(reserialized.contains("unknownTopLevel"));
        assert!(reserialized.contains("proprietaryX"));
    }

    #[test]
    fn test_non_bundle_rejected() {
        let err = FhirBundle::parse(r#"{"resourceType": "Patient"}"#).unwrap_err();
        assert!(matches!(err, BridgeError::Parse(_)));
    }
}
