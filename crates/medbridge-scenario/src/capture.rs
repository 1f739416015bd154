//! 档案捕获为场景模板
//!
//! 读取档案的全部移动, 按时间排序提取语义事件序列, 创建完全独立的
//! SNAPSHOT模板（无外键回指源档案）。源档案随后被修改或删除不影响
//! 已捕获模板。

use chrono::Utc;
use medbridge_core::models::{MessageRole, ScenarioTemplate, ScenarioTemplateStep, TimeConfig};
use medbridge_core::models::Protocol;
use medbridge_core::vocabulary::VocabularyRegistry;
use medbridge_core::{BridgeError, Result};
use medbridge_store::Store;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// 捕获一个档案为模板
pub async fn capture_dossier(
    store: &Arc<dyn Store>,
    dossier_id: Uuid,
    template_name: Option<String>,
    template_description: Option<String>,
) -> Result<ScenarioTemplate> {
    let registry = VocabularyRegistry::new();

    let dossier = store
        .get_dossier(dossier_id)
        .await?
        .ok_or_else(|| BridgeError::NotFound(format!("dossier {dossier_id}")))?;

    // 收集全部venue的移动并按时间排序
    let mut movements = Vec::new();
    for venue in store.venues_of_dossier(dossier_id).await? {
        for movement in store.movements_of_venue(venue.id).await? {
            movements.push((movement, venue.hospital_service.clone()));
        }
    }
    movements.sort_by(|a, b| a.0.when.cmp(&b.0.when));

    if movements.is_empty() {
        return Err(BridgeError::CaptureEmptyDossier(dossier_id.to_string()));
    }

    let epoch = Utc::now().timestamp();
    let key = format!("captured.dossier_{dossier_id}_{epoch}");

    let mut steps = Vec::with_capacity(movements.len());
    let mut previous_when: Option<chrono::DateTime<Utc>> = None;
    for (index, (movement, service)) in movements.iter().enumerate() {
        let (semantic_code, role) = match registry.by_trigger(&movement.trigger) {
            Some(event) => (event.semantic_code.to_string(), event.role),
            None => ("OTHER_EVENT".to_string(), MessageRole::Lifecycle),
        };
        let delay_seconds = previous_when
            .map(|prev| (movement.when - prev).num_seconds().max(0))
            .unwrap_or(0);
        previous_when = Some(movement.when);

        // SNAPSHOT: 纯文本参考载荷, 不引用源实体
        let snapshot = format!(
            "type={} action={} service={} uf={} uf_label={}",
            movement.trigger,
            movement.action.as_str(),
            service.as_deref().unwrap_or("-"),
            movement.uf_medicale.code,
            movement.uf_medicale.label.as_deref().unwrap_or("-"),
        );

        steps.push(ScenarioTemplateStep {
            order_index: index as i32 + 1,
            semantic_code,
            trigger: movement.trigger.clone(),
            narrative: Some(format!(
                "{} vers {} le {}",
                movement.trigger,
                service.as_deref().unwrap_or("service"),
                movement.when.format("%Y-%m-%d %H:%M")
            )),
            role,
            delay_seconds,
            payload_snapshot: Some(snapshot),
            snapshot_when: Some(movement.when),
            protocol: None,
        });
    }

    let template = ScenarioTemplate {
        id: Uuid::new_v4(),
        key: key.clone(),
        name: template_name.unwrap_or_else(|| format!("Dossier {} capturé", dossier.sequence)),
        description: template_description.or_else(|| {
            Some(format!(
                "Capturé depuis le dossier {} ({} mouvements)",
                dossier.sequence,
                steps.len()
            ))
        }),
        category: Some("captured".to_string()),
        tags: vec![
            "captured".to_string(),
            "real-data".to_string(),
            format!("dossier-{dossier_id}"),
        ],
        protocols: vec![Protocol::Hl7v2, Protocol::Fhir],
        time_config: TimeConfig::default(),
        steps,
        created_at: Utc::now(),
    };
    store.insert_template(template.clone()).await?;
    info!(%key, steps = template.steps.len(), "档案捕获完成");
    Ok(template)
}
