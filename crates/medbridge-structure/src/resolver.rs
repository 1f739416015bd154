//! 结构节点解析
//!
//! `resolve`按(类型, 代码, 法人实体)查找节点。代码未知时, 若该法人
//! 实体启用auto-create-uf策略, 在虚拟pole→虚拟service链下创建虚拟UF
//! 占位（默认关闭, 关闭时拒绝并报UF_UNKNOWN）。虚拟节点带标记,
//! 可被MFN^M05权威导入替换。

use medbridge_core::models::{NodeKind, StructureNode};
use medbridge_core::{BridgeError, Result};
use medbridge_store::Store;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const VIRTUAL_POLE_CODE: &str = "POLE-VIRT";
const VIRTUAL_SERVICE_CODE: &str = "SRV-VIRT";

/// 结构解析器
pub struct StructureResolver {
    store: Arc<dyn Store>,
    auto_create_uf: bool,                        // 全局默认, 可被EJ标志覆盖
}

impl StructureResolver {
    pub fn new(store: Arc<dyn Store>, auto_create_uf: bool) -> Self {
        Self {
            store,
            auto_create_uf,
        }
    }

    /// 解析节点; 未知代码按策略自动创建或拒绝
    pub async fn resolve(
        &self,
        code: &str,
        kind: NodeKind,
        juridical_entity_id: Uuid,
    ) -> Result<StructureNode> {
        let nodes = self
            .store
            .find_nodes(kind, code, Some(juridical_entity_id))
            .await?;
        match nodes.len() {
            1 => return Ok(nodes.into_iter().next().unwrap()),
            0 => {}
            _ => {
                return Err(BridgeError::StructureAmbiguity(format!(
                    "{} {:?} resolves to {} nodes",
                    kind.as_str(),
                    code,
                    nodes.len()
                )))
            }
        }

        if kind == NodeKind::FunctionalUnit && self.auto_create_allowed(juridical_entity_id).await?
        {
            return self.create_virtual_uf(code, juridical_entity_id).await;
        }

        if kind == NodeKind::FunctionalUnit {
            Err(BridgeError::UfUnknown(code.to_string()))
        } else {
            Err(BridgeError::NotFound(format!(
                "{} {:?}",
                kind.as_str(),
                code
            )))
        }
    }

    async fn auto_create_allowed(&self, juridical_entity_id: Uuid) -> Result<bool> {
        if let Some(ej) = self.store.get_node(juridical_entity_id).await? {
            if ej.auto_create_uf {
                return Ok(true);
            }
        }
        Ok(self.auto_create_uf)
    }

    /// 创建虚拟UF, 必要时合成虚拟pole/service父链
    async fn create_virtual_uf(
        &self,
        code: &str,
        juridical_entity_id: Uuid,
    ) -> Result<StructureNode> {
        let pole = self
            .ensure_virtual(
                NodeKind::Pole,
                VIRTUAL_POLE_CODE,
                "Pôle virtuel",
                Some(juridical_entity_id),
                juridical_entity_id,
            )
            .await?;
        let service = self
            .ensure_virtual(
                NodeKind::Service,
                VIRTUAL_SERVICE_CODE,
                "Service virtuel",
                Some(pole.id),
                juridical_entity_id,
            )
            .await?;

        let mut uf = StructureNode::new(NodeKind::FunctionalUnit, code, format!("UF {code}"));
        uf.parent_id = Some(service.id);
        uf.juridical_entity_id = Some(juridical_entity_id);
        uf.is_virtual = true;
        self.store.upsert_node(uf.clone()).await?;
        info!(%code, "未知UF已自动创建为虚拟节点");
        Ok(uf)
    }

    async fn ensure_virtual(
        &self,
        kind: NodeKind,
        code: &str,
        label: &str,
        parent_id: Option<Uuid>,
        juridical_entity_id: Uuid,
    ) -> Result<StructureNode> {
        let existing = self
            .store
            .find_nodes(kind, code, Some(juridical_entity_id))
            .await?;
        if let Some(node) = existing.into_iter().next() {
            return Ok(node);
        }
        let mut node = StructureNode::new(kind, code, label);
        node.parent_id = parent_id;
        node.juridical_entity_id = Some(juridical_entity_id);
        node.is_virtual = true;
        self.store.upsert_node(node.clone()).await?;
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_store::MemoryStore;

    async fn setup(auto_create: bool) -> (Arc<dyn Store>, StructureResolver, Uuid) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut ej = StructureNode::new(NodeKind::JuridicalEntity, "EJ-001", "CH Test");
        ej.finess = Some("750000001".to_string());
        let ej_id = ej.id;
        store.upsert_node(ej).await.unwrap();
        let resolver = StructureResolver::new(store.clone(), auto_create);
        (store, resolver, ej_id)
    }

    #[tokio::test]
    async fn test_resolve_existing_uf() {
        let (store, resolver, ej_id) = setup(false).await;
        let mut uf = StructureNode::new(NodeKind::FunctionalUnit, "UF-CARD", "Cardiologie");
        uf.juridical_entity_id = Some(ej_id);
        store.upsert_node(uf).await.unwrap();

        let node = resolver
            .resolve("UF-CARD", NodeKind::FunctionalUnit, ej_id)
            .await
            .unwrap();
        assert_eq!(node.label, "Cardiologie");
        assert!(!node.is_virtual);
    }

    #[tokio::test]
    async fn test_unknown_uf_rejected_by_default() {
        let (_store, resolver, ej_id) = setup(false).await;
        let err = resolver
            .resolve("UF-XXX", NodeKind::FunctionalUnit, ej_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::UfUnknown(_)));
    }

    #[tokio::test]
    async fn test_auto_create_builds_virtual_chain() {
        let (store, resolver, ej_id) = setup(true).await;
        let uf = resolver
            .resolve("UF-NEW", NodeKind::FunctionalUnit, ej_id)
            .await
            .unwrap();
        assert!(uf.is_virtual);

        let service = store.get_node(uf.parent_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(service.kind, NodeKind::Service);
        assert!(service.is_virtual);
        let pole = store.get_node(service.parent_id.unwrap()).await.unwrap().unwrap();
        assert_eq!(pole.kind, NodeKind::Pole);
        assert!(pole.is_virtual);

        // 再次解析命中已创建节点, 不重复
        let again = resolver
            .resolve("UF-NEW", NodeKind::FunctionalUnit, ej_id)
            .await
            .unwrap();
        assert_eq!(again.id, uf.id);
    }

    #[tokio::test]
    async fn test_per_ej_flag_enables_auto_create() {
        let (store, resolver, ej_id) = setup(false).await;
        let mut ej = store.get_node(ej_id).await.unwrap().unwrap();
        ej.auto_create_uf = true;
        store.upsert_node(ej).await.unwrap();

        let uf = resolver
            .resolve("UF-EJ", NodeKind::FunctionalUnit, ej_id)
            .await
            .unwrap();
        assert!(uf.is_virtual);
    }

    #[tokio::test]
    async fn test_ambiguity_detected() {
        let (store, resolver, ej_id) = setup(false).await;
        for _ in 0..2 {
            let mut uf = StructureNode::new(NodeKind::FunctionalUnit, "UF-DUP", "Doublon");
            uf.juridical_entity_id = Some(ej_id);
            store.upsert_node(uf).await.unwrap();
        }
        let err = resolver
            .resolve("UF-DUP", NodeKind::FunctionalUnit, ej_id)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::StructureAmbiguity(_)));
    }
}
