//! MFN^M05结构权威导入
//!
//! LOC/LCH段幂等upsert结构节点: 已存在节点按代码就地更新并清除
//! 虚拟标记, 不产生重复; 父链按段序中最近一次出现的上级节点归属。

use medbridge_core::models::{NodeKind, StructureNode};
use medbridge_core::{BridgeError, Result};
use medbridge_hl7::parser::Hl7Message;
use medbridge_store::Store;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// 导入结果
#[derive(Debug, Default, Clone)]
pub struct MfnImportReport {
    pub created: usize,
    pub updated: usize,
    pub virtual_replaced: usize,
    pub skipped: usize,
}

/// 导入一条MFN^M05消息的LOC/LCH段
pub async fn import_mfn(
    store: &Arc<dyn Store>,
    msg: &Hl7Message,
    juridical_entity_id: Uuid,
) -> Result<MfnImportReport> {
    let trigger_ok = msg.message_code() == Some("MFN")
        || msg.segment("MFI").is_some();
    if !trigger_ok {
        return Err(BridgeError::Validation(
            "expected an MFN message with an MFI segment".to_string(),
        ));
    }

    let delims = msg.delimiters;
    let mut report = MfnImportReport::default();
    // 段序中每个层级最近出现的节点, 作为后续子节点的父
    let mut last_seen: HashMap<NodeKind, Uuid> = HashMap::new();
    let mut current: Option<Uuid> = None;

    for segment in &msg.segments {
        match segment.id.as_str() {
            "LOC" => {
                let code = segment
                    .component(1, 1, &delims)
                    .unwrap_or("")
                    .to_string();
                if code.is_empty() {
                    warn!("LOC段缺少标识, 跳过");
                    report.skipped += 1;
                    current = None;
                    continue;
                }
                let label = segment
                    .component(1, 2, &delims)
                    .unwrap_or(code.as_str())
                    .to_string();
                // 类型在字段2或字段3（两种线级变体）
                let kind = segment
                    .field(2)
                    .and_then(NodeKind::from_mfn_code)
                    .or_else(|| segment.field(3).and_then(NodeKind::from_mfn_code));
                let Some(kind) = kind else {
                    warn!(%code, "LOC段位置类型无法识别, 跳过");
                    report.skipped += 1;
                    current = None;
                    continue;
                };

                let node_id =
                    upsert_location(store, kind, &code, &label, &last_seen, juridical_entity_id, &mut report)
                        .await?;
                last_seen.insert(kind, node_id);
                current = Some(node_id);
            }
            "LCH" => {
                // 属性行: LCH-3 = 属性名^值
                let Some(node_id) = current else {
                    report.skipped += 1;
                    continue;
                };
                let attribute = segment.component(3, 1, &delims).unwrap_or("");
                let value = segment.component(3, 2, &delims).unwrap_or("");
                if attribute.eq_ignore_ascii_case("LABEL") && !value.is_empty() {
                    if let Some(mut node) = store.get_node(node_id).await? {
                        node.label = value.to_string();
                        node.updated_at = chrono::Utc::now();
                        store.upsert_node(node).await?;
                    }
                }
            }
            _ => {}
        }
    }

    info!(
        created = report.created,
        updated = report.updated,
        virtual_replaced = report.virtual_replaced,
        "MFN^M05导入完成"
    );
    Ok(report)
}

async fn upsert_location(
    store: &Arc<dyn Store>,
    kind: NodeKind,
    code: &str,
    label: &str,
    last_seen: &HashMap<NodeKind, Uuid>,
    juridical_entity_id: Uuid,
    report: &mut MfnImportReport,
) -> Result<Uuid> {
    let parent_id = kind
        .parent_kind()
        .and_then(|pk| last_seen.get(&pk).copied())
        .or(Some(juridical_entity_id).filter(|_| kind != NodeKind::JuridicalEntity));

    let existing = store
        .find_nodes(kind, code, Some(juridical_entity_id))
        .await?;
    if let Some(mut node) = existing.into_iter().next() {
        if node.is_virtual {
            report.virtual_replaced += 1;
        }
        node.label = label.to_string();
        node.is_virtual = false;
        if let Some(parent) = parent_id {
            node.parent_id = Some(parent);
        }
        node.updated_at = chrono::Utc::now();
        let id = node.id;
        store.upsert_node(node).await?;
        report.updated += 1;
        return Ok(id);
    }

    let mut node = StructureNode::new(kind, code, label);
    node.parent_id = parent_id;
    node.juridical_entity_id = Some(juridical_entity_id);
    store.upsert_node(node.clone()).await?;
    report.created += 1;
    Ok(node.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_store::MemoryStore;

    const M05: &str = "MSH|^~\\&|GAM|EJ|MEDBRIDGE|EJ|20240101120000||MFN^M05|MFN001|P|2.5\r\
MFI|LOC||UPD|||AL\r\
LOC|POLE-A^Pôle A|PL\r\
LOC|SRV-CARD^Cardiologie|D\r\
LOC|UF-CARD^UF Cardiologie|UF\r\
LCH|1||LABEL^UF Cardiologie Adultes\r\
LOC|CH-101^Chambre 101|CH\r\
LOC|LIT-1^Lit 1|LIT\r";

    async fn setup() -> (Arc<dyn Store>, Uuid) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let ej = StructureNode::new(NodeKind::JuridicalEntity, "EJ-001", "CH Test");
        let ej_id = ej.id;
        store.upsert_node(ej).await.unwrap();
        (store, ej_id)
    }

    #[tokio::test]
    async fn test_import_creates_hierarchy() {
        let (store, ej_id) = setup().await;
        let msg = Hl7Message::parse(M05).unwrap();
        let report = import_mfn(&store, &msg, ej_id).await.unwrap();
        assert_eq!(report.created, 5);
        assert_eq!(report.updated, 0);

        let uf = store
            .find_nodes(NodeKind::FunctionalUnit, "UF-CARD", Some(ej_id))
            .await
            .unwrap()
            .remove(0);
        // LCH属性行更新了标签
        assert_eq!(uf.label, "UF Cardiologie Adultes");
        let service = store.get_node(uf.parent_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(service.code, "SRV-CARD");
        let pole = store.get_node(service.parent_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(pole.code, "POLE-A");
    }

    #[tokio::test]
    async fn test_import_is_idempotent() {
        let (store, ej_id) = setup().await;
        let msg = Hl7Message::parse(M05).unwrap();
        import_mfn(&store, &msg, ej_id).await.unwrap();
        let report = import_mfn(&store, &msg, ej_id).await.unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.updated, 5);
        let nodes = store
            .find_nodes(NodeKind::FunctionalUnit, "UF-CARD", Some(ej_id))
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_import_replaces_virtual_node() {
        let (store, ej_id) = setup().await;
        let mut virtual_uf =
            StructureNode::new(NodeKind::FunctionalUnit, "UF-CARD", "UF UF-CARD");
        virtual_uf.is_virtual = true;
        virtual_uf.juridical_entity_id = Some(ej_id);
        store.upsert_node(virtual_uf).await.unwrap();

        let msg = Hl7Message::parse(M05).unwrap();
        let report = import_mfn(&store, &msg, ej_id).await.unwrap();
        assert_eq!(report.virtual_replaced, 1);

        let nodes = store
            .find_nodes(NodeKind::FunctionalUnit, "UF-CARD", Some(ej_id))
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(!nodes[0].is_virtual);
    }

    #[tokio::test]
    async fn test_non_mfn_rejected() {
        let (store, ej_id) = setup().await;
        let msg = Hl7Message::parse(
            "MSH|^~\\&|A|B|C|D|20240101000000||ADT^A01|X|P|2.5\rPID|1||X\r",
        )
        .unwrap();
        assert!(import_mfn(&store, &msg, ej_id).await.is_err());
    }
}
