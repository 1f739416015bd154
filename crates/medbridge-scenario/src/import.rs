//! 场景JSON导入/导出
//!
//! 导出格式: {key, name, protocol, steps[], description?, category?,
//! tags?, time_config?}; 每步{order_index, message_type, format,
//! delay_seconds, payload}。导入为原子操作, 键冲突失败, 除非提供
//! override_key。

use chrono::{DateTime, Utc};
use medbridge_core::models::{
    MessageRole, Protocol, ScenarioTemplate, ScenarioTemplateStep, TimeAnchorMode, TimeConfig,
};
use medbridge_core::vocabulary::VocabularyRegistry;
use medbridge_core::{BridgeError, Result};
use medbridge_store::Store;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// 导出模板为JSON
pub fn export_template(template: &ScenarioTemplate) -> Value {
    let steps: Vec<Value> = template
        .steps
        .iter()
        .map(|step| {
            json!({
                "order_index": step.order_index,
                "message_type": format!("ADT^{}", step.trigger),
                "format": step
                    .protocol
                    .unwrap_or(Protocol::Hl7v2)
                    .as_str(),
                "delay_seconds": step.delay_seconds,
                "payload": step.payload_snapshot.clone().unwrap_or_default(),
            })
        })
        .collect();

    json!({
        "key": template.key,
        "name": template.name,
        "protocol": template
            .protocols
            .first()
            .unwrap_or(&Protocol::Hl7v2)
            .as_str(),
        "description": template.description,
        "category": template.category,
        "tags": template.tags,
        "time_config": {
            "anchor_mode": match template.time_config.anchor {
                TimeAnchorMode::Sliding => "sliding",
                TimeAnchorMode::Fixed => "fixed",
                TimeAnchorMode::NoShift => "none",
            },
            "anchor_days_offset": template.time_config.anchor_days_offset,
            "fixed_start": template.time_config.fixed_start.map(|t| t.to_rfc3339()),
            "preserve_intervals": template.time_config.preserve_intervals,
            "jitter_min_minutes": template.time_config.jitter_min_minutes,
            "jitter_max_minutes": template.time_config.jitter_max_minutes,
            "jitter_triggers": template.time_config.jitter_triggers,
        },
        "steps": steps,
    })
}

/// 从JSON导入模板（原子: 全部校验通过后一次写入）
pub async fn import_template(
    store: &Arc<dyn Store>,
    data: &Value,
    override_key: Option<&str>,
) -> Result<ScenarioTemplate> {
    let registry = VocabularyRegistry::new();

    let required = |field: &str| -> Result<&Value> {
        data.get(field)
            .ok_or_else(|| BridgeError::Validation(format!("missing field {field:?}")))
    };
    let key = override_key
        .map(String::from)
        .unwrap_or_else(|| {
            required("key")
                .and_then(|v| {
                    v.as_str()
                        .map(String::from)
                        .ok_or_else(|| BridgeError::Validation("key must be a string".to_string()))
                })
                .unwrap_or_default()
        });
    if key.is_empty() {
        return Err(BridgeError::Validation("missing field \"key\"".to_string()));
    }
    let name = required("name")?
        .as_str()
        .ok_or_else(|| BridgeError::Validation("name must be a string".to_string()))?
        .to_string();
    let protocol = required("protocol")?
        .as_str()
        .and_then(Protocol::parse)
        .ok_or_else(|| BridgeError::Validation("invalid protocol".to_string()))?;
    let raw_steps = required("steps")?
        .as_array()
        .ok_or_else(|| BridgeError::Validation("steps must be an array".to_string()))?;

    // 键冲突检查
    if store.get_template(&key).await?.is_some() {
        return Err(BridgeError::Validation(format!(
            "template key {key:?} already exists"
        )));
    }

    let mut steps = Vec::with_capacity(raw_steps.len());
    for (index, raw) in raw_steps.iter().enumerate() {
        let message_type = raw
            .get("message_type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BridgeError::Validation(format!("step {index}: missing message_type"))
            })?;
        let trigger = message_type
            .split('^')
            .nth(1)
            .unwrap_or(message_type)
            .to_string();
        let (semantic_code, role) = match registry.by_trigger(&trigger) {
            Some(event) => (event.semantic_code.to_string(), event.role),
            None => ("OTHER_EVENT".to_string(), MessageRole::Lifecycle),
        };
        steps.push(ScenarioTemplateStep {
            order_index: raw
                .get("order_index")
                .and_then(Value::as_i64)
                .unwrap_or(index as i64 + 1) as i32,
            semantic_code,
            trigger,
            narrative: raw.get("name").and_then(Value::as_str).map(String::from),
            role,
            delay_seconds: raw.get("delay_seconds").and_then(Value::as_i64).unwrap_or(0),
            payload_snapshot: raw
                .get("payload")
                .and_then(Value::as_str)
                .map(String::from),
            snapshot_when: None,
            protocol: raw
                .get("format")
                .and_then(Value::as_str)
                .and_then(Protocol::parse),
        });
    }
    steps.sort_by_key(|s| s.order_index);

    let template = ScenarioTemplate {
        id: Uuid::new_v4(),
        key: key.clone(),
        name,
        description: data
            .get("description")
            .and_then(Value::as_str)
            .map(String::from),
        category: data
            .get("category")
            .and_then(Value::as_str)
            .map(String::from),
        tags: data
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default(),
        protocols: vec![protocol],
        time_config: parse_time_config(data.get("time_config")),
        steps,
        created_at: Utc::now(),
    };
    store.insert_template(template.clone()).await?;
    info!(%key, "场景模板导入完成");
    Ok(template)
}

fn parse_time_config(raw: Option<&Value>) -> TimeConfig {
    let mut cfg = TimeConfig::default();
    let Some(raw) = raw else {
        return cfg;
    };
    if let Some(mode) = raw.get("anchor_mode").and_then(Value::as_str) {
        cfg.anchor = match mode {
            "fixed" | "fixed_start" => TimeAnchorMode::Fixed,
            "none" => TimeAnchorMode::NoShift,
            _ => TimeAnchorMode::Sliding,
        };
    }
    if let Some(offset) = raw.get("anchor_days_offset").and_then(Value::as_i64) {
        cfg.anchor_days_offset = Some(offset);
    }
    if let Some(start) = raw.get("fixed_start").and_then(Value::as_str) {
        cfg.fixed_start = DateTime::parse_from_rfc3339(start)
            .ok()
            .map(|t| t.with_timezone(&Utc));
    }
    if let Some(preserve) = raw.get("preserve_intervals").and_then(Value::as_bool) {
        cfg.preserve_intervals = preserve;
    }
    cfg.jitter_min_minutes = raw.get("jitter_min_minutes").and_then(Value::as_i64);
    cfg.jitter_max_minutes = raw.get("jitter_max_minutes").and_then(Value::as_i64);
    if let Some(triggers) = raw.get("jitter_triggers").and_then(Value::as_array) {
        cfg.jitter_triggers = triggers
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect();
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_store::MemoryStore;

    fn sample_json() -> Value {
        json!({
            "key": "ihe.pam.simple-admission",
            "name": "Admission simple",
            "protocol": "HL7v2",
            "description": "A01 puis A03",
            "category": "ihe",
            "tags": ["ihe", "pam"],
            "time_config": {
                "anchor_mode": "fixed",
                "fixed_start": "2025-11-09T08:30:00Z",
                "preserve_intervals": true,
                "jitter_min_minutes": 1,
                "jitter_max_minutes": 5,
                "jitter_triggers": ["A03"]
            },
            "steps": [
                {"order_index": 1, "message_type": "ADT^A01", "format": "hl7", "delay_seconds": 0, "payload": "snapshot-1"},
                {"order_index": 2, "message_type": "ADT^A03", "format": "hl7", "delay_seconds": 600, "payload": "snapshot-2"}
            ]
        })
    }

    #[tokio::test]
    async fn test_import_roundtrip() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let template = import_template(&store, &sample_json(), None).await.unwrap();
        assert_eq!(template.key, "ihe.pam.simple-admission");
        assert_eq!(template.steps.len(), 2);
        assert_eq!(template.steps[0].semantic_code, "ADMISSION_CONFIRMED");
        assert_eq!(template.steps[1].trigger, "A03");
        assert_eq!(template.steps[1].delay_seconds, 600);
        assert_eq!(template.time_config.anchor, TimeAnchorMode::Fixed);
        assert_eq!(template.time_config.jitter_triggers, vec!["A03".to_string()]);

        let exported = export_template(&template);
        assert_eq!(exported["key"], "ihe.pam.simple-admission");
        assert_eq!(exported["steps"][0]["message_type"], "ADT^A01");
        assert_eq!(exported["time_config"]["anchor_mode"], "fixed");
    }

    #[tokio::test]
    async fn test_duplicate_key_fails_without_override() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        import_template(&store, &sample_json(), None).await.unwrap();
        let err = import_template(&store, &sample_json(), None).await.unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));

        // override_key允许再次导入
        let template = import_template(&store, &sample_json(), Some("ihe.pam.simple-admission.v2"))
            .await
            .unwrap();
        assert_eq!(template.key, "ihe.pam.simple-admission.v2");
    }

    #[tokio::test]
    async fn test_missing_required_fields_rejected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        for field in ["key", "name", "protocol", "steps"] {
            let mut data = sample_json();
            data.as_object_mut().unwrap().remove(field);
            let err = import_template(&store, &data, None).await.unwrap_err();
            assert!(matches!(err, BridgeError::Validation(_)), "field {field}");
        }
        // 校验失败时不落库
        assert!(store.list_templates().await.unwrap().is_empty());
    }
}
