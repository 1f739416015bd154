//! 内存存储实现
//!
//! 以RwLock保护的HashMap索引实现仓库接口, 作为默认运行时存储与
//! 测试基底。语义与PostgreSQL实现一致。

use crate::repository::Store;
use async_trait::async_trait;
use medbridge_core::models::{
    Diagnostic, Dossier, IdentifierKind, IdentifierRecord, MessageLogEntry, MessageStatus,
    Movement, NodeKind, Patient, ScenarioRun, ScenarioTemplate, StructureNode, Venue,
};
use medbridge_core::{BridgeError, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// 内存存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    patients: RwLock<HashMap<Uuid, Patient>>,
    dossiers: RwLock<HashMap<Uuid, Dossier>>,
    venues: RwLock<HashMap<Uuid, Venue>>,
    movements: RwLock<HashMap<Uuid, Movement>>,
    identifiers: RwLock<Vec<IdentifierRecord>>,
    nodes: RwLock<HashMap<Uuid, StructureNode>>,
    logs: RwLock<Vec<MessageLogEntry>>,
    templates: RwLock<HashMap<String, ScenarioTemplate>>,
    runs: RwLock<HashMap<Uuid, ScenarioRun>>,
    sequences: RwLock<HashMap<String, i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_patient(&self, patient: Patient) -> Result<()> {
        self.patients.write().await.insert(patient.id, patient);
        Ok(())
    }

    async fn update_patient(&self, patient: Patient) -> Result<()> {
        let mut patients = self.patients.write().await;
        if !patients.contains_key(&patient.id) {
            return Err(BridgeError::PatientNotFound(patient.id.to_string()));
        }
        patients.insert(patient.id, patient);
        Ok(())
    }

    async fn get_patient(&self, id: Uuid) -> Result<Option<Patient>> {
        Ok(self.patients.read().await.get(&id).cloned())
    }

    async fn insert_dossier(&self, dossier: Dossier) -> Result<()> {
        self.dossiers.write().await.insert(dossier.id, dossier);
        Ok(())
    }

    async fn update_dossier(&self, dossier: Dossier) -> Result<()> {
        let mut dossiers = self.dossiers.write().await;
        if !dossiers.contains_key(&dossier.id) {
            return Err(BridgeError::NotFound(format!("dossier {}", dossier.id)));
        }
        dossiers.insert(dossier.id, dossier);
        Ok(())
    }

    async fn get_dossier(&self, id: Uuid) -> Result<Option<Dossier>> {
        Ok(self.dossiers.read().await.get(&id).cloned())
    }

    async fn dossiers_of_patient(&self, patient_id: Uuid) -> Result<Vec<Dossier>> {
        Ok(self
            .dossiers
            .read()
            .await
            .values()
            .filter(|d| d.patient_id == patient_id)
            .cloned()
            .collect())
    }

    async fn delete_dossier(&self, id: Uuid) -> Result<()> {
        let venue_ids: Vec<Uuid> = self
            .venues
            .read()
            .await
            .values()
            .filter(|v| v.dossier_id == id)
            .map(|v| v.id)
            .collect();
        self.movements
            .write()
            .await
            .retain(|_, m| !venue_ids.contains(&m.venue_id));
        self.venues.write().await.retain(|_, v| v.dossier_id != id);
        self.dossiers.write().await.remove(&id);
        Ok(())
    }

    async fn insert_venue(&self, venue: Venue) -> Result<()> {
        self.venues.write().await.insert(venue.id, venue);
        Ok(())
    }

    async fn update_venue(&self, venue: Venue) -> Result<()> {
        let mut venues = self.venues.write().await;
        if !venues.contains_key(&venue.id) {
            return Err(BridgeError::VenueNotFound(venue.id.to_string()));
        }
        venues.insert(venue.id, venue);
        Ok(())
    }

    async fn get_venue(&self, id: Uuid) -> Result<Option<Venue>> {
        Ok(self.venues.read().await.get(&id).cloned())
    }

    async fn venues_of_dossier(&self, dossier_id: Uuid) -> Result<Vec<Venue>> {
        let mut venues: Vec<Venue> = self
            .venues
            .read()
            .await
            .values()
            .filter(|v| v.dossier_id == dossier_id)
            .cloned()
            .collect();
        venues.sort_by_key(|v| v.sequence);
        Ok(venues)
    }

    async fn insert_movement(&self, movement: Movement) -> Result<()> {
        self.movements.write().await.insert(movement.id, movement);
        Ok(())
    }

    async fn update_movement(&self, movement: Movement) -> Result<()> {
        let mut movements = self.movements.write().await;
        if !movements.contains_key(&movement.id) {
            return Err(BridgeError::NotFound(format!("movement {}", movement.id)));
        }
        movements.insert(movement.id, movement);
        Ok(())
    }

    async fn movements_of_venue(&self, venue_id: Uuid) -> Result<Vec<Movement>> {
        let mut movements: Vec<Movement> = self
            .movements
            .read()
            .await
            .values()
            .filter(|m| m.venue_id == venue_id)
            .cloned()
            .collect();
        movements.sort_by(|a, b| a.when.cmp(&b.when).then(a.sequence.cmp(&b.sequence)));
        Ok(movements)
    }

    async fn insert_identifier(&self, record: IdentifierRecord) -> Result<()> {
        let mut identifiers = self.identifiers.write().await;
        let duplicate = identifiers.iter().any(|r| {
            r.kind == record.kind && r.system == record.system && r.value == record.value
        });
        if duplicate {
            return Err(BridgeError::IdentifierCollision(format!(
                "{}/{}/{}",
                record.kind.as_str(),
                record.system,
                record.value
            )));
        }
        identifiers.push(record);
        Ok(())
    }

    async fn identifier_exists(
        &self,
        kind: IdentifierKind,
        system: &str,
        value: &str,
    ) -> Result<bool> {
        Ok(self
            .identifiers
            .read()
            .await
            .iter()
            .any(|r| r.kind == kind && r.system == system && r.value == value))
    }

    async fn find_identifier_subject(
        &self,
        kind: IdentifierKind,
        value: &str,
    ) -> Result<Option<Uuid>> {
        Ok(self
            .identifiers
            .read()
            .await
            .iter()
            .find(|r| r.kind == kind && r.value == value)
            .and_then(|r| r.subject_id))
    }

    async fn upsert_node(&self, node: StructureNode) -> Result<()> {
        self.nodes.write().await.insert(node.id, node);
        Ok(())
    }

    async fn get_node(&self, id: Uuid) -> Result<Option<StructureNode>> {
        Ok(self.nodes.read().await.get(&id).cloned())
    }

    async fn find_nodes(
        &self,
        kind: NodeKind,
        code: &str,
        juridical_entity_id: Option<Uuid>,
    ) -> Result<Vec<StructureNode>> {
        Ok(self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| {
                n.kind == kind
                    && n.code == code
                    && (juridical_entity_id.is_none()
                        || n.juridical_entity_id == juridical_entity_id
                        || (kind == NodeKind::JuridicalEntity
                            && Some(n.id) == juridical_entity_id))
            })
            .cloned()
            .collect())
    }

    async fn append_log(&self, entry: MessageLogEntry) -> Result<()> {
        let mut logs = self.logs.write().await;
        if logs.iter().any(|l| l.control_id == entry.control_id) {
            return Err(BridgeError::DuplicateControlId(entry.control_id));
        }
        logs.push(entry);
        Ok(())
    }

    async fn set_log_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        diagnostics: Vec<Diagnostic>,
    ) -> Result<()> {
        let mut logs = self.logs.write().await;
        let entry = logs
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| BridgeError::NotFound(format!("log entry {id}")))?;
        if entry.status != MessageStatus::Pending {
            // pending→终态仅允许一次, 重复转换是编程错误
            return Err(BridgeError::Internal(format!(
                "log entry {id} already transitioned to {:?}",
                entry.status
            )));
        }
        entry.status = status;
        entry.diagnostics.extend(diagnostics);
        Ok(())
    }

    async fn find_log_by_control_id(&self, control_id: &str) -> Result<Option<MessageLogEntry>> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .find(|l| l.control_id == control_id)
            .cloned())
    }

    async fn logs_by_correlation(&self, correlation_id: &str) -> Result<Vec<MessageLogEntry>> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|l| l.correlation_id.as_deref() == Some(correlation_id))
            .cloned()
            .collect())
    }

    async fn insert_template(&self, template: ScenarioTemplate) -> Result<()> {
        let mut templates = self.templates.write().await;
        if templates.contains_key(&template.key) {
            return Err(BridgeError::Validation(format!(
                "template key {:?} already exists",
                template.key
            )));
        }
        templates.insert(template.key.clone(), template);
        Ok(())
    }

    async fn get_template(&self, key: &str) -> Result<Option<ScenarioTemplate>> {
        Ok(self.templates.read().await.get(key).cloned())
    }

    async fn delete_template(&self, key: &str) -> Result<()> {
        self.templates.write().await.remove(key);
        Ok(())
    }

    async fn list_templates(&self) -> Result<Vec<ScenarioTemplate>> {
        let mut templates: Vec<ScenarioTemplate> =
            self.templates.read().await.values().cloned().collect();
        templates.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(templates)
    }

    async fn insert_run(&self, run: ScenarioRun) -> Result<()> {
        self.runs.write().await.insert(run.id, run);
        Ok(())
    }

    async fn update_run(&self, run: ScenarioRun) -> Result<()> {
        let mut runs = self.runs.write().await;
        if !runs.contains_key(&run.id) {
            return Err(BridgeError::NotFound(format!("run {}", run.id)));
        }
        runs.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<ScenarioRun>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list_runs(&self, template_key: Option<&str>) -> Result<Vec<ScenarioRun>> {
        let mut runs: Vec<ScenarioRun> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| template_key.map(|k| r.template_key == k).unwrap_or(true))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    async fn next_sequence(&self, scope: &str) -> Result<i64> {
        let mut sequences = self.sequences.write().await;
        let next = sequences.entry(scope.to_string()).or_insert(0);
        *next += 1;
        Ok(*next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use medbridge_core::models::{Direction, Sex};

    fn log_entry(control_id: &str) -> MessageLogEntry {
        MessageLogEntry {
            id: Uuid::new_v4(),
            control_id: control_id.to_string(),
            trigger: Some("A01".to_string()),
            direction: Direction::Inbound,
            correlation_id: None,
            raw: String::new(),
            timestamp: Utc::now(),
            status: MessageStatus::Pending,
            diagnostics: Vec::new(),
            endpoint_id: None,
        }
    }

    #[tokio::test]
    async fn test_duplicate_control_id_rejected() {
        let store = MemoryStore::new();
        store.append_log(log_entry("CTL001")).await.unwrap();
        let err = store.append_log(log_entry("CTL001")).await.unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateControlId(_)));
    }

    #[tokio::test]
    async fn test_log_status_transitions_once() {
        let store = MemoryStore::new();
        let entry = log_entry("CTL002");
        let id = entry.id;
        store.append_log(entry).await.unwrap();
        store
            .set_log_status(id, MessageStatus::Success, Vec::new())
            .await
            .unwrap();
        let err = store
            .set_log_status(id, MessageStatus::Error, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Internal(_)));
    }

    #[tokio::test]
    async fn test_identifier_uniqueness() {
        let store = MemoryStore::new();
        let record = IdentifierRecord {
            id: Uuid::new_v4(),
            value: "9001".to_string(),
            kind: IdentifierKind::Ipp,
            system: "urn:test".to_string(),
            subject_id: None,
            created_at: Utc::now(),
        };
        store.insert_identifier(record.clone()).await.unwrap();
        let mut duplicate = record;
        duplicate.id = Uuid::new_v4();
        let err = store.insert_identifier(duplicate).await.unwrap_err();
        assert!(matches!(err, BridgeError::IdentifierCollision(_)));
        assert!(store
            .identifier_exists(IdentifierKind::Ipp, "urn:test", "9001")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_delete_dossier_cascades() {
        let store = MemoryStore::new();
        let patient = Patient::new("DOE", vec!["JOHN".into()], Sex::Male);
        let patient_id = patient.id;
        store.insert_patient(patient).await.unwrap();

        let dossier = Dossier {
            id: Uuid::new_v4(),
            patient_id,
            juridical_entity_id: Uuid::new_v4(),
            sequence: 1,
            admit_time: None,
            dossier_type: medbridge_core::models::DossierType::Hospitalise,
            uf_medicale: None,
            uf_hebergement: None,
            uf_soins: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let dossier_id = dossier.id;
        store.insert_dossier(dossier).await.unwrap();

        let venue = Venue {
            id: Uuid::new_v4(),
            dossier_id,
            sequence: 1,
            start: None,
            end: None,
            status: medbridge_core::models::VenueStatus::Active,
            location: None,
            hospital_service: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let venue_id = venue.id;
        store.insert_venue(venue).await.unwrap();

        store.delete_dossier(dossier_id).await.unwrap();
        assert!(store.get_dossier(dossier_id).await.unwrap().is_none());
        assert!(store.get_venue(venue_id).await.unwrap().is_none());
        // 患者不受档案删除影响
        assert!(store.get_patient(patient_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sequences_are_scoped() {
        let store = MemoryStore::new();
        assert_eq!(store.next_sequence("dossier:EJ1").await.unwrap(), 1);
        assert_eq!(store.next_sequence("dossier:EJ1").await.unwrap(), 2);
        assert_eq!(store.next_sequence("dossier:EJ2").await.unwrap(), 1);
    }
}
