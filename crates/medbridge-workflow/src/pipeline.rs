//! 入站消息处理管线
//!
//! 单条消息的完整处理: 解析 → 校验 → 实体解析/创建 → venue锁下
//! 状态机应用 → 移动落库 → 日志 → ACK。解析/校验/解析失败一律
//! 以负向ACK回收, 不中断任务。同一连接上的消息由调用方串行送入。

use crate::state_machine::{cancel_target, MovementStateMachine};
use chrono::Utc;
use medbridge_core::models::{
    Diagnostic, Direction, Dossier, DossierType, Endpoint, IdentifierKind, IdentifierRecord,
    MessageLogEntry, MessageStatus, Movement, MovementAction, NationalId, NationalIdType,
    NodeKind, Patient, Sex, UfRef, Venue, VenueStatus,
};
use medbridge_core::vocabulary::VocabularyRegistry;
use medbridge_core::{BridgeError, Result};
use medbridge_hl7::generator::{build_ack, fresh_control_id, AckCode};
use medbridge_hl7::parser::{decode_payload, Hl7Message};
use medbridge_hl7::segments::{
    extract_evn, extract_mrg, extract_pid, extract_pv1, extract_zbe, PidInfo, Pv1Info,
};
use medbridge_hl7::validator::PamValidator;
use medbridge_identifiers::accept_ins;
use medbridge_store::{Store, VenueLocks};
use medbridge_structure::{import_mfn, StructureResolver};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 管线配置
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub strict_pam_fr: bool,
    pub auto_create_uf: bool,
    pub sending_application: String,
    pub sending_facility: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            strict_pam_fr: false,
            auto_create_uf: false,
            sending_application: "MedBridge".to_string(),
            sending_facility: "MEDBRIDGE".to_string(),
        }
    }
}

/// 单条消息处理结果
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub ack: String,
    pub ack_code: AckCode,
    pub control_id: String,
    pub log_id: Option<Uuid>,
}

/// 创建患者+档案+住院的触发码
const CREATING_TRIGGERS: &[&str] = &["A01", "A04", "A05"];

/// 入站管线
pub struct InboundPipeline {
    store: Arc<dyn Store>,
    venue_locks: Arc<VenueLocks>,
    resolver: StructureResolver,
    registry: VocabularyRegistry,
    state_machine: MovementStateMachine,
    config: PipelineConfig,
}

impl InboundPipeline {
    pub fn new(store: Arc<dyn Store>, venue_locks: Arc<VenueLocks>, config: PipelineConfig) -> Self {
        let resolver = StructureResolver::new(store.clone(), config.auto_create_uf);
        Self {
            store,
            venue_locks,
            resolver,
            registry: VocabularyRegistry::new(),
            state_machine: MovementStateMachine::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// 处理一帧入站消息, 总是返回一条ACK
    pub async fn process(&self, raw: &[u8], endpoint: &Endpoint) -> PipelineOutcome {
        let (text, latin1_fallback) = decode_payload(raw);

        let msg = match Hl7Message::parse(&text) {
            Ok(msg) => msg,
            Err(e) => return self.reject_unparsed(&text, &e, endpoint).await,
        };
        let control_id = msg
            .control_id()
            .map(String::from)
            .unwrap_or_else(fresh_control_id);
        let trigger = msg.trigger().map(String::from);

        // 控制ID全局唯一
        if let Ok(Some(_)) = self.store.find_log_by_control_id(&control_id).await {
            warn!(%control_id, "重复的消息控制ID");
            let diag = Diagnostic::error(
                "DUPLICATE_CONTROL_ID",
                format!("control id {control_id} already processed"),
            );
            let log_id = self
                .append_error_log(
                    // 原控制ID已占用, 带后缀落日志
                    format!("{control_id}#dup-{}", fresh_control_id()),
                    trigger.clone(),
                    &text,
                    endpoint,
                    vec![diag.clone()],
                )
                .await;
            return self.negative(control_id, "duplicate control id", vec![diag], log_id);
        }

        let log_entry = MessageLogEntry {
            id: Uuid::new_v4(),
            control_id: control_id.clone(),
            trigger: trigger.clone(),
            direction: Direction::Inbound,
            correlation_id: Some(control_id.clone()),
            raw: text.clone(),
            timestamp: Utc::now(),
            status: MessageStatus::Pending,
            diagnostics: Vec::new(),
            endpoint_id: Some(endpoint.id),
        };
        let log_id = log_entry.id;
        if let Err(e) = self.store.append_log(log_entry).await {
            // 与重复检查之间的竞争
            let diag = error_diagnostic(&e);
            return self.negative(control_id, "duplicate control id", vec![diag], None);
        }

        let mut diagnostics = Vec::new();
        if latin1_fallback {
            diagnostics.push(Diagnostic::warning(
                "ENCODING_FALLBACK",
                "payload decoded as Latin-1",
            ));
        }

        // MFN走结构导入, 不经PAM校验
        if msg.message_code() == Some("MFN") {
            return match self.apply_mfn(&msg, endpoint).await {
                Ok(()) => {
                    let _ = self
                        .store
                        .set_log_status(log_id, MessageStatus::Success, diagnostics.clone())
                        .await;
                    PipelineOutcome {
                        ack: build_ack(
                            AckCode::Aa,
                            &control_id,
                            "",
                            &[],
                            &self.config.sending_application,
                            &self.config.sending_facility,
                        ),
                        ack_code: AckCode::Aa,
                        control_id,
                        log_id: Some(log_id),
                    }
                }
                Err(e) => {
                    let diag = error_diagnostic(&e);
                    diagnostics.push(diag.clone());
                    let _ = self
                        .store
                        .set_log_status(log_id, MessageStatus::Error, diagnostics.clone())
                        .await;
                    self.negative(control_id, &diag.text, diagnostics, Some(log_id))
                }
            };
        }

        let strict = self.effective_strict(endpoint).await;
        let outcome = PamValidator::new(strict).validate(&msg, &self.registry);
        diagnostics.extend(outcome.diagnostics.clone());
        if outcome.has_errors() {
            let text = outcome
                .errors()
                .first()
                .map(|d| d.text.clone())
                .unwrap_or_default();
            let _ = self
                .store
                .set_log_status(log_id, MessageStatus::Error, diagnostics.clone())
                .await;
            return self.negative(control_id, &text, diagnostics, Some(log_id));
        }

        match self.apply(&msg, endpoint).await {
            Ok(()) => {
                let _ = self
                    .store
                    .set_log_status(log_id, MessageStatus::Success, diagnostics.clone())
                    .await;
                info!(%control_id, trigger = trigger.as_deref().unwrap_or(""), "入站消息处理成功");
                PipelineOutcome {
                    ack: build_ack(
                        AckCode::Aa,
                        &control_id,
                        "",
                        &[],
                        &self.config.sending_application,
                        &self.config.sending_facility,
                    ),
                    ack_code: AckCode::Aa,
                    control_id,
                    log_id: Some(log_id),
                }
            }
            Err(e) => {
                let diag = error_diagnostic(&e);
                diagnostics.push(diag.clone());
                let _ = self
                    .store
                    .set_log_status(log_id, MessageStatus::Error, diagnostics.clone())
                    .await;
                self.negative(control_id, &diag.text, diagnostics, Some(log_id))
            }
        }
    }

    async fn reject_unparsed(
        &self,
        text: &str,
        error: &BridgeError,
        endpoint: &Endpoint,
    ) -> PipelineOutcome {
        // 尽力从原文中提取控制ID, 失败则合成
        let control_id = extract_raw_control_id(text).unwrap_or_else(fresh_control_id);
        let diag = Diagnostic::error("FRAMING_ERROR", error_diagnostic(error).text);
        let log_id = self
            .append_error_log(control_id.clone(), None, text, endpoint, vec![diag.clone()])
            .await;
        self.negative(control_id, "unparseable message", vec![diag], log_id)
    }

    async fn append_error_log(
        &self,
        control_id: String,
        trigger: Option<String>,
        raw: &str,
        endpoint: &Endpoint,
        diagnostics: Vec<Diagnostic>,
    ) -> Option<Uuid> {
        let entry = MessageLogEntry {
            id: Uuid::new_v4(),
            control_id,
            trigger,
            direction: Direction::Inbound,
            correlation_id: None,
            raw: raw.to_string(),
            timestamp: Utc::now(),
            status: MessageStatus::Error,
            diagnostics,
            endpoint_id: Some(endpoint.id),
        };
        let id = entry.id;
        self.store.append_log(entry).await.ok().map(|_| id)
    }

    fn negative(
        &self,
        control_id: String,
        text: &str,
        diagnostics: Vec<Diagnostic>,
        log_id: Option<Uuid>,
    ) -> PipelineOutcome {
        PipelineOutcome {
            ack: build_ack(
                AckCode::Ae,
                &control_id,
                text,
                &diagnostics,
                &self.config.sending_application,
                &self.config.sending_facility,
            ),
            ack_code: AckCode::Ae,
            control_id,
            log_id,
        }
    }

    /// 端点所属EJ的严格标志或全局配置
    async fn effective_strict(&self, endpoint: &Endpoint) -> bool {
        if self.config.strict_pam_fr {
            return true;
        }
        if let Some(ej_id) = endpoint.juridical_entity_id {
            if let Ok(Some(ej)) = self.store.get_node(ej_id).await {
                return ej.strict_pam_fr;
            }
        }
        false
    }

    // ========== 语义应用 ==========

    async fn apply(&self, msg: &Hl7Message, endpoint: &Endpoint) -> Result<()> {
        let trigger = msg
            .trigger()
            .map(String::from)
            .ok_or_else(|| BridgeError::InvalidMsh("missing trigger".to_string()))?;
        let ej_id = endpoint.juridical_entity_id.ok_or_else(|| {
            BridgeError::Config(format!("endpoint {} has no juridical entity", endpoint.name))
        })?;

        let pid = extract_pid(msg);

        if self.registry.is_identity_only(&trigger) {
            return self.apply_identity(&trigger, msg, &pid).await;
        }

        if trigger == "A08" {
            // 仅人口学更新, 无移动
            let mut patient = self.resolve_or_create_patient(&trigger, &pid).await?;
            apply_demographics(&mut patient, &pid);
            patient.updated_at = Utc::now();
            return self.store.update_patient(patient).await;
        }

        let pv1 = extract_pv1(msg);
        let zbe = extract_zbe(msg);
        let event_time = zbe
            .movement_time
            .or(extract_evn(msg).event_time)
            .unwrap_or_else(Utc::now);

        // UF先于实体创建解析, 拒绝时不留半成品实体
        let uf_code = zbe
            .uf_medicale
            .as_ref()
            .map(|uf| uf.code.clone())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| BridgeError::Validation("ZBE-7 code missing".to_string()))?;
        let uf_node = self
            .resolver
            .resolve(&uf_code, NodeKind::FunctionalUnit, ej_id)
            .await?;

        let patient = self.resolve_or_create_patient(&trigger, &pid).await?;

        // venue解析或创建
        let (venue, created) = self
            .resolve_or_create_venue(&trigger, &patient, &pid, &pv1, ej_id, event_time)
            .await?;

        // venue独占锁下应用转换
        let _guard = self.venue_locks.acquire(venue.id).await;
        let mut venue = self
            .store
            .get_venue(venue.id)
            .await?
            .ok_or_else(|| BridgeError::VenueNotFound(venue.id.to_string()))?;
        let movements = self.store.movements_of_venue(venue.id).await?;

        // 时序检查（历史移动ZBE-5=Y豁免）
        if !zbe.historic() {
            if let Some(last) = movements.iter().filter(|m| !m.cancelled).last() {
                if event_time < last.when {
                    return Err(BridgeError::InvalidTransition {
                        from: venue.status.as_str().to_string(),
                        trigger: trigger.clone(),
                        reason: "movement out of chronological order".to_string(),
                    });
                }
            }
        }

        let from = if created { None } else { Some(venue.status) };
        let new_status = self.state_machine.transition(from, &trigger)?;

        // CANCEL类守卫与副作用
        let mut cancels_sequence = None;
        match trigger.as_str() {
            "A11" => {
                let target = cancel_target(&movements, "A11", "A01")?.clone();
                cancels_sequence = Some(target.sequence);
                self.mark_cancelled(target).await?;
            }
            "A12" => {
                let target = cancel_target(&movements, "A12", "A02")?.clone();
                cancels_sequence = Some(target.sequence);
                self.mark_cancelled(target.clone()).await?;
                // 回滚到被取消转科之前的位置
                venue.location = movements
                    .iter()
                    .filter(|m| !m.cancelled && m.sequence != target.sequence)
                    .filter_map(|m| m.location.clone())
                    .last();
            }
            "A13" => {
                let target = cancel_target(&movements, "A13", "A03")?.clone();
                cancels_sequence = Some(target.sequence);
                self.mark_cancelled(target).await?;
                venue.end = None;
            }
            "A02" => {
                venue.location = pv1.location.clone();
            }
            "A03" => {
                venue.end = Some(event_time);
            }
            "A06" | "A07" => {
                let mut dossier = self
                    .store
                    .get_dossier(venue.dossier_id)
                    .await?
                    .ok_or_else(|| BridgeError::NotFound("dossier".to_string()))?;
                if let Some(class) = &pv1.patient_class {
                    dossier.dossier_type = DossierType::from_patient_class(class);
                    dossier.updated_at = Utc::now();
                    self.store.update_dossier(dossier).await?;
                }
            }
            _ => {}
        }

        if created && venue.location.is_none() {
            venue.location = pv1.location.clone();
        }

        // 移动落库
        let action = zbe.action();
        let original_trigger = match action {
            MovementAction::Update | MovementAction::Cancel => Some(
                zbe.original_trigger
                    .clone()
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| trigger.clone()),
            ),
            MovementAction::Insert => zbe.original_trigger.clone().filter(|t| !t.is_empty()),
        };
        let movement = Movement {
            id: Uuid::new_v4(),
            venue_id: venue.id,
            sequence: movements.len() as i64 + 1,
            when: event_time,
            trigger: trigger.clone(),
            action,
            historic: zbe.historic(),
            original_trigger,
            uf_medicale: UfRef {
                code: uf_node.code.clone(),
                label: zbe
                    .uf_medicale
                    .as_ref()
                    .and_then(|u| u.label.clone())
                    .or(Some(uf_node.label.clone())),
            },
            uf_soins: zbe.uf_soins.clone(),
            nature: self.registry.effective_nature(&trigger, zbe.nature()),
            location: pv1.location.clone(),
            cancels_sequence,
            cancelled: false,
            created_at: Utc::now(),
        };
        if let Some(mvt_id) = &zbe.movement_id {
            // MVT标识符登记, 冲突不致命
            let _ = self
                .store
                .insert_identifier(IdentifierRecord {
                    id: Uuid::new_v4(),
                    value: mvt_id.clone(),
                    kind: IdentifierKind::Mvt,
                    system: endpoint.name.clone(),
                    subject_id: Some(movement.id),
                    created_at: Utc::now(),
                })
                .await;
        }
        self.store.insert_movement(movement).await?;

        venue.status = new_status;
        venue.updated_at = Utc::now();
        self.store.update_venue(venue).await?;

        debug!(%trigger, status = new_status.as_str(), "状态转换已应用");
        Ok(())
    }

    /// MFN^M05权威结构导入
    async fn apply_mfn(&self, msg: &Hl7Message, endpoint: &Endpoint) -> Result<()> {
        let ej_id = endpoint.juridical_entity_id.ok_or_else(|| {
            BridgeError::Config(format!("endpoint {} has no juridical entity", endpoint.name))
        })?;
        let report = import_mfn(&self.store, msg, ej_id).await?;
        info!(
            created = report.created,
            updated = report.updated,
            "MFN结构导入已应用"
        );
        Ok(())
    }

    async fn mark_cancelled(&self, mut movement: Movement) -> Result<()> {
        movement.cancelled = true;
        self.store.update_movement(movement).await
    }

    async fn apply_identity(&self, trigger: &str, msg: &Hl7Message, pid: &PidInfo) -> Result<()> {
        match trigger {
            "A28" => {
                self.resolve_or_create_patient("A28", pid).await?;
                Ok(())
            }
            "A31" => {
                let mut patient = self.require_patient(pid).await?;
                apply_demographics(&mut patient, pid);
                patient.updated_at = Utc::now();
                self.store.update_patient(patient).await
            }
            "A40" => self.apply_merge(msg, pid).await,
            other => Err(BridgeError::Internal(format!(
                "unexpected identity trigger {other}"
            ))),
        }
    }

    /// A40患者合并: MRG-1被吸收者并入PID-3存续者
    async fn apply_merge(&self, msg: &Hl7Message, pid: &PidInfo) -> Result<()> {
        let survivor = self.require_patient(pid).await?;
        let mrg = extract_mrg(msg);
        let absorbed_cx = mrg
            .prior_identifier
            .ok_or_else(|| BridgeError::Validation("A40 requires MRG-1".to_string()))?;
        let absorbed_id = self
            .store
            .find_identifier_subject(IdentifierKind::Ipp, &absorbed_cx.value)
            .await?
            .ok_or_else(|| BridgeError::PatientNotFound(absorbed_cx.value.clone()))?;
        let mut absorbed = self
            .store
            .get_patient(absorbed_id)
            .await?
            .ok_or_else(|| BridgeError::PatientNotFound(absorbed_cx.value.clone()))?;

        // 档案重指向存续患者
        for mut dossier in self.store.dossiers_of_patient(absorbed.id).await? {
            dossier.patient_id = survivor.id;
            dossier.updated_at = Utc::now();
            self.store.update_dossier(dossier).await?;
        }
        absorbed.merged_into = Some(survivor.id);
        absorbed.updated_at = Utc::now();
        self.store.update_patient(absorbed).await?;
        info!(survivor = %survivor.id, "A40患者合并完成");
        Ok(())
    }

    async fn require_patient(&self, pid: &PidInfo) -> Result<Patient> {
        let ipp = primary_ipp(pid)
            .ok_or_else(|| BridgeError::Validation("PID-3 has no usable identifier".to_string()))?;
        let subject = self
            .store
            .find_identifier_subject(IdentifierKind::Ipp, &ipp.value)
            .await?
            .ok_or_else(|| BridgeError::PatientNotFound(ipp.value.clone()))?;
        self.store
            .get_patient(subject)
            .await?
            .ok_or_else(|| BridgeError::PatientNotFound(ipp.value.clone()))
    }

    async fn resolve_or_create_patient(&self, trigger: &str, pid: &PidInfo) -> Result<Patient> {
        let ipp = primary_ipp(pid)
            .ok_or_else(|| BridgeError::Validation("PID-3 has no usable identifier".to_string()))?;

        // INS仅接受合法形态
        let national_id = match pid
            .identifiers
            .iter()
            .find(|i| i.type_code.as_deref() == Some("INS"))
        {
            Some(ins) => {
                accept_ins(&ins.value)?;
                Some(NationalId {
                    value: ins.value.clone(),
                    id_type: NationalIdType::Nir,
                    in_registry: false,
                    last_query: None,
                })
            }
            None => None,
        };

        if let Some(subject) = self
            .store
            .find_identifier_subject(IdentifierKind::Ipp, &ipp.value)
            .await?
        {
            let mut patient = self
                .store
                .get_patient(subject)
                .await?
                .ok_or_else(|| BridgeError::PatientNotFound(ipp.value.clone()))?;
            if matches!(trigger, "A01" | "A04" | "A05" | "A28" | "A31") {
                apply_demographics(&mut patient, pid);
                if national_id.is_some() {
                    patient.national_id = national_id;
                }
                patient.updated_at = Utc::now();
                self.store.update_patient(patient.clone()).await?;
            }
            return Ok(patient);
        }

        if !CREATING_TRIGGERS.contains(&trigger) && trigger != "A28" {
            return Err(BridgeError::PatientNotFound(ipp.value.clone()));
        }

        let mut patient = Patient::new(
            pid.family.clone().unwrap_or_default(),
            pid.givens.clone(),
            pid.sex.unwrap_or(Sex::Unknown),
        );
        apply_demographics(&mut patient, pid);
        patient.national_id = national_id;
        self.store.insert_patient(patient.clone()).await?;
        self.store
            .insert_identifier(IdentifierRecord {
                id: Uuid::new_v4(),
                value: ipp.value.clone(),
                kind: IdentifierKind::Ipp,
                system: ipp.assigning_authority.clone().unwrap_or_else(|| "LOCAL".to_string()),
                subject_id: Some(patient.id),
                created_at: Utc::now(),
            })
            .await?;
        debug!(ipp = %ipp.value, "入站消息创建了患者");
        Ok(patient)
    }

    async fn resolve_or_create_venue(
        &self,
        trigger: &str,
        patient: &Patient,
        pid: &PidInfo,
        pv1: &Pv1Info,
        ej_id: Uuid,
        event_time: chrono::DateTime<Utc>,
    ) -> Result<(Venue, bool)> {
        let vn = pv1
            .visit_number
            .as_ref()
            .ok_or_else(|| BridgeError::Validation("PV1-19 missing".to_string()))?;

        if let Some(subject) = self
            .store
            .find_identifier_subject(IdentifierKind::Vn, &vn.value)
            .await?
        {
            let venue = self
                .store
                .get_venue(subject)
                .await?
                .ok_or_else(|| BridgeError::VenueNotFound(vn.value.clone()))?;
            return Ok((venue, false));
        }

        if !CREATING_TRIGGERS.contains(&trigger) {
            return Err(BridgeError::VenueNotFound(vn.value.clone()));
        }

        // 档案: NDA已知则复用, 否则创建
        let dossier = self
            .resolve_or_create_dossier(trigger, patient, pid, pv1, ej_id, event_time)
            .await?;

        // 每档案至多一个ACTIVE venue
        if trigger != "A05" {
            let active_exists = self
                .store
                .venues_of_dossier(dossier.id)
                .await?
                .iter()
                .any(|v| v.status == VenueStatus::Active);
            if active_exists {
                return Err(BridgeError::InvalidTransition {
                    from: VenueStatus::Active.as_str().to_string(),
                    trigger: trigger.to_string(),
                    reason: "dossier already has an active venue".to_string(),
                });
            }
        }

        let venue = Venue {
            id: Uuid::new_v4(),
            dossier_id: dossier.id,
            sequence: self
                .store
                .next_sequence(&format!("venue:{ej_id}"))
                .await?,
            start: Some(event_time),
            end: None,
            status: VenueStatus::PreAdmitted, // 状态机稍后落定
            location: pv1.location.clone(),
            hospital_service: pv1.hospital_service.clone(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.insert_venue(venue.clone()).await?;
        self.store
            .insert_identifier(IdentifierRecord {
                id: Uuid::new_v4(),
                value: vn.value.clone(),
                kind: IdentifierKind::Vn,
                system: vn.assigning_authority.clone().unwrap_or_else(|| "LOCAL".to_string()),
                subject_id: Some(venue.id),
                created_at: Utc::now(),
            })
            .await?;
        Ok((venue, true))
    }

    async fn resolve_or_create_dossier(
        &self,
        trigger: &str,
        patient: &Patient,
        pid: &PidInfo,
        pv1: &Pv1Info,
        ej_id: Uuid,
        event_time: chrono::DateTime<Utc>,
    ) -> Result<Dossier> {
        if let Some(nda) = &pid.account_number {
            if let Some(subject) = self
                .store
                .find_identifier_subject(IdentifierKind::Nda, &nda.value)
                .await?
            {
                if let Some(dossier) = self.store.get_dossier(subject).await? {
                    return Ok(dossier);
                }
            }
        }

        let dossier_type = if trigger == "A04" {
            DossierType::Externe
        } else {
            pv1.patient_class
                .as_deref()
                .map(DossierType::from_patient_class)
                .unwrap_or(DossierType::Hospitalise)
        };
        let dossier = Dossier {
            id: Uuid::new_v4(),
            patient_id: patient.id,
            juridical_entity_id: ej_id,
            sequence: self
                .store
                .next_sequence(&format!("dossier:{ej_id}"))
                .await?,
            admit_time: Some(event_time),
            dossier_type,
            uf_medicale: None,
            uf_hebergement: None,
            uf_soins: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.insert_dossier(dossier.clone()).await?;
        if let Some(nda) = &pid.account_number {
            self.store
                .insert_identifier(IdentifierRecord {
                    id: Uuid::new_v4(),
                    value: nda.value.clone(),
                    kind: IdentifierKind::Nda,
                    system: nda
                        .assigning_authority
                        .clone()
                        .unwrap_or_else(|| "LOCAL".to_string()),
                    subject_id: Some(dossier.id),
                    created_at: Utc::now(),
                })
                .await?;
        }
        Ok(dossier)
    }
}

/// PID-3中首个非INS标识符
fn primary_ipp(pid: &PidInfo) -> Option<&medbridge_hl7::segments::CxIdentifier> {
    pid.identifiers
        .iter()
        .find(|i| i.type_code.as_deref() != Some("INS"))
}

fn apply_demographics(patient: &mut Patient, pid: &PidInfo) {
    if let Some(family) = &pid.family {
        patient.family = family.clone();
    }
    if !pid.givens.is_empty() {
        patient.givens = pid.givens.clone();
    }
    if pid.birth_family.is_some() {
        patient.birth_family = pid.birth_family.clone();
    }
    if let Some(birth_date) = pid.birth_date {
        patient.birth_date = Some(birth_date);
    }
    if let Some(sex) = pid.sex {
        patient.sex = sex;
    }
    if pid.address.is_some() {
        patient.address = pid.address.clone();
        patient.city = pid.city.clone();
        patient.postal_code = pid.postal_code.clone();
        patient.country = pid.country.clone();
    }
    if pid.phone.is_some() {
        patient.phone = pid.phone.clone();
    }
    if pid.mobile.is_some() {
        patient.mobile = pid.mobile.clone();
    }
    if pid.marital_status.is_some() {
        patient.marital_status = pid.marital_status.clone();
    }
    if pid.birth_place.is_some() {
        patient.birth_place = pid.birth_place.clone();
    }
    if let Some(reliability) = pid.reliability {
        patient.reliability = reliability;
    }
}

/// 从未解析原文中尽力提取MSH-10
fn extract_raw_control_id(text: &str) -> Option<String> {
    let first_line = text.split(['\r', '\n']).next()?;
    if !first_line.starts_with("MSH") || first_line.len() < 5 {
        return None;
    }
    let sep = first_line.chars().nth(3)?;
    let fields: Vec<&str> = first_line.split(sep).collect();
    fields
        .get(9)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn error_diagnostic(error: &BridgeError) -> Diagnostic {
    let text = match error {
        BridgeError::InvalidTransition {
            from,
            trigger,
            reason,
        } => format!("invalid transition from {from} on {trigger}: {reason}"),
        BridgeError::UfUnknown(code) => format!("unknown functional unit {code}"),
        BridgeError::PatientNotFound(value) => format!("patient not found: {value}"),
        BridgeError::VenueNotFound(value) => format!("venue not found: {value}"),
        BridgeError::DuplicateControlId(value) => format!("duplicate control id {value}"),
        BridgeError::InsFormatInvalid(value) => format!("invalid INS format: {value}"),
        BridgeError::Validation(text) => text.clone(),
        BridgeError::StructureAmbiguity(text) => format!("ambiguous structure code: {text}"),
        other => other.diagnostic_code().to_string(),
    };
    Diagnostic::error(error.diagnostic_code(), text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_core::models::{EndpointKind, Severity, StructureNode};
    use medbridge_hl7::generator::parse_ack;
    use medbridge_store::MemoryStore;

    const A01: &str = "MSH|^~\\&|GAM|EJ-001|MEDBRIDGE|EJ-001|20240115103000||ADT^A01|CTL001|P|2.5\r\
EVN|A01|20240115103000\r\
PID|1||IPP-42^^^HOSP^PI||DOE^JOHN||19800115|M||||||||||NDA-7^^^HOSP^AN\r\
PV1|1|I|CARD^101^1||||||||||||||||VN-9^^^HOSP^VN\r\
ZBE|MVT-1|20240115103000||INSERT|N||CARDIOLOGIE^^^^^^^^^UF-CARD||S\r";

    const A02: &str = "MSH|^~\\&|GAM|EJ-001|MEDBRIDGE|EJ-001|20240115113000||ADT^A02|CTL002|P|2.5\r\
EVN|A02|20240115113000\r\
PID|1||IPP-42^^^HOSP^PI||DOE^JOHN||19800115|M||||||||||NDA-7^^^HOSP^AN\r\
PV1|1|I|CARD^102^1|||CARD^101^1|||||||||||||VN-9^^^HOSP^VN\r\
ZBE|MVT-2|20240115113000||INSERT|N||CARDIOLOGIE^^^^^^^^^UF-CARD||M\r";

    const A11: &str = "MSH|^~\\&|GAM|EJ-001|MEDBRIDGE|EJ-001|20240115123000||ADT^A11|CTL003|P|2.5\r\
EVN|A11|20240115123000\r\
PID|1||IPP-42^^^HOSP^PI||DOE^JOHN||19800115|M||||||||||NDA-7^^^HOSP^AN\r\
PV1|1|I|CARD^101^1||||||||||||||||VN-9^^^HOSP^VN\r\
ZBE|MVT-3|20240115123000||CANCEL|N|A01|CARDIOLOGIE^^^^^^^^^UF-CARD||S\r";

    const A02_AFTER_CANCEL: &str = "MSH|^~\\&|GAM|EJ-001|MEDBRIDGE|EJ-001|20240115133000||ADT^A02|CTL004|P|2.5\r\
EVN|A02|20240115133000\r\
PID|1||IPP-42^^^HOSP^PI||DOE^JOHN||19800115|M||||||||||NDA-7^^^HOSP^AN\r\
PV1|1|I|CARD^103^1|||CARD^101^1|||||||||||||VN-9^^^HOSP^VN\r\
ZBE|MVT-6|20240115133000||INSERT|N||CARDIOLOGIE^^^^^^^^^UF-CARD||M\r";

    const A03: &str = "MSH|^~\\&|GAM|EJ-001|MEDBRIDGE|EJ-001|20240115150000||ADT^A03|CTL007|P|2.5\r\
EVN|A03|20240115150000\r\
PID|1||IPP-42^^^HOSP^PI||DOE^JOHN||19800115|M||||||||||NDA-7^^^HOSP^AN\r\
PV1|1|I|CARD^101^1||||||||||||||||VN-9^^^HOSP^VN\r\
ZBE|MVT-4|20240115150000||INSERT|N||CARDIOLOGIE^^^^^^^^^UF-CARD||D\r";

    const A13: &str = "MSH|^~\\&|GAM|EJ-001|MEDBRIDGE|EJ-001|20240115160000||ADT^A13|CTL008|P|2.5\r\
EVN|A13|20240115160000\r\
PID|1||IPP-42^^^HOSP^PI||DOE^JOHN||19800115|M||||||||||NDA-7^^^HOSP^AN\r\
PV1|1|I|CARD^101^1||||||||||||||||VN-9^^^HOSP^VN\r\
ZBE|MVT-5|20240115160000||CANCEL|N|A03|CARDIOLOGIE^^^^^^^^^UF-CARD||S\r";

    const A08: &str = "MSH|^~\\&|GAM|EJ-001|MEDBRIDGE|EJ-001|20240115140000||ADT^A08|CTL005|P|2.5\r\
EVN|A08|20240115140000\r\
PID|1||IPP-42^^^HOSP^PI||DOE^JANE||19800115|F||||||||||NDA-7^^^HOSP^AN\r\
PV1|1|I|CARD^101^1||||||||||||||||VN-9^^^HOSP^VN\r";

    const A28: &str = "MSH|^~\\&|GAM|EJ-001|MEDBRIDGE|EJ-001|20240115170000||ADT^A28|CTL009|P|2.5\r\
EVN|A28|20240115170000\r\
PID|1||IPP-43^^^HOSP^PI||SMITH^ANNA||19900101|F\r";

    const A40: &str = "MSH|^~\\&|GAM|EJ-001|MEDBRIDGE|EJ-001|20240115180000||ADT^A40|CTL010|P|2.5\r\
EVN|A40|20240115180000\r\
PID|1||IPP-42^^^HOSP^PI||DOE^JOHN||19800115|M\r\
MRG|IPP-43^^^HOSP^PI\r";

    async fn setup(strict: bool) -> (Arc<dyn Store>, InboundPipeline, Endpoint) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

        let mut ej = StructureNode::new(NodeKind::JuridicalEntity, "EJ-001", "CH Test");
        ej.finess = Some("750000001".to_string());
        ej.strict_pam_fr = strict;
        let ej_id = ej.id;
        store.upsert_node(ej).await.unwrap();

        let mut uf = StructureNode::new(NodeKind::FunctionalUnit, "UF-CARD", "Cardiologie");
        uf.juridical_entity_id = Some(ej_id);
        store.upsert_node(uf).await.unwrap();

        let mut endpoint = Endpoint::new("his-inbound", EndpointKind::MllpListener);
        endpoint.juridical_entity_id = Some(ej_id);

        let pipeline = InboundPipeline::new(
            store.clone(),
            Arc::new(VenueLocks::new()),
            PipelineConfig::default(),
        );
        (store, pipeline, endpoint)
    }

    async fn venue_of(store: &Arc<dyn Store>, vn: &str) -> Venue {
        let id = store
            .find_identifier_subject(IdentifierKind::Vn, vn)
            .await
            .unwrap()
            .expect("venue identifier");
        store.get_venue(id).await.unwrap().expect("venue")
    }

    async fn patient_of(store: &Arc<dyn Store>, ipp: &str) -> Patient {
        let id = store
            .find_identifier_subject(IdentifierKind::Ipp, ipp)
            .await
            .unwrap()
            .expect("patient identifier");
        store.get_patient(id).await.unwrap().expect("patient")
    }

    #[tokio::test]
    async fn test_simple_admission() {
        let (store, pipeline, endpoint) = setup(false).await;
        let outcome = pipeline.process(A01.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Aa, "ack: {}", outcome.ack);
        assert!(outcome.ack.contains("MSA|AA|CTL001"));

        let patient = patient_of(&store, "IPP-42").await;
        assert_eq!(patient.family, "DOE");
        assert_eq!(patient.givens, vec!["JOHN".to_string()]);

        let venue = venue_of(&store, "VN-9").await;
        assert_eq!(venue.status, VenueStatus::Active);
        assert_eq!(venue.location.as_ref().unwrap().to_string(), "CARD/101/1");

        let movements = store.movements_of_venue(venue.id).await.unwrap();
        assert_eq!(movements.len(), 1);
        assert_eq!(movements[0].trigger, "A01");
        assert_eq!(movements[0].nature, Some(medbridge_core::models::Nature::S));
        assert_eq!(movements[0].uf_medicale.code, "UF-CARD");

        let dossier = store.get_dossier(venue.dossier_id).await.unwrap().unwrap();
        assert_eq!(dossier.patient_id, patient.id);
        assert_eq!(dossier.dossier_type, DossierType::Hospitalise);
    }

    #[tokio::test]
    async fn test_transfer_with_provenance() {
        let (store, pipeline, endpoint) = setup(false).await;
        assert_eq!(pipeline.process(A01.as_bytes(), &endpoint).await.ack_code, AckCode::Aa);
        let outcome = pipeline.process(A02.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Aa, "ack: {}", outcome.ack);

        let venue = venue_of(&store, "VN-9").await;
        assert_eq!(venue.location.as_ref().unwrap().to_string(), "CARD/102/1");
        let movements = store.movements_of_venue(venue.id).await.unwrap();
        assert_eq!(movements.len(), 2);
        assert_eq!(movements[1].trigger, "A02");
        assert_eq!(movements[1].location.as_ref().unwrap().to_string(), "CARD/102/1");
    }

    #[tokio::test]
    async fn test_cancel_admission_then_transfer_rejected() {
        let (store, pipeline, endpoint) = setup(false).await;
        assert_eq!(pipeline.process(A01.as_bytes(), &endpoint).await.ack_code, AckCode::Aa);
        let outcome = pipeline.process(A11.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Aa, "ack: {}", outcome.ack);

        let venue = venue_of(&store, "VN-9").await;
        assert_eq!(venue.status, VenueStatus::Cancelled);
        let movements = store.movements_of_venue(venue.id).await.unwrap();
        // 入院移动已被标记取消
        assert!(movements[0].cancelled);
        assert_eq!(movements[1].cancels_sequence, Some(1));

        let outcome = pipeline.process(A02_AFTER_CANCEL.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Ae);
        assert!(outcome.ack.contains("INVALID_TRANSITION"), "ack: {}", outcome.ack);
    }

    #[tokio::test]
    async fn test_strict_mode_rejects_a08_without_mutation() {
        let (store, pipeline, endpoint) = setup(true).await;
        assert_eq!(pipeline.process(A01.as_bytes(), &endpoint).await.ack_code, AckCode::Aa);
        let outcome = pipeline.process(A08.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Ae);
        assert!(outcome.ack.contains("strict PAM FR forbids A08"), "ack: {}", outcome.ack);

        // 患者未被修改
        let patient = patient_of(&store, "IPP-42").await;
        assert_eq!(patient.givens, vec!["JOHN".to_string()]);
    }

    #[tokio::test]
    async fn test_a08_updates_demographics_when_not_strict() {
        let (store, pipeline, endpoint) = setup(false).await;
        assert_eq!(pipeline.process(A01.as_bytes(), &endpoint).await.ack_code, AckCode::Aa);
        let outcome = pipeline.process(A08.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Aa, "ack: {}", outcome.ack);

        let patient = patient_of(&store, "IPP-42").await;
        assert_eq!(patient.givens, vec!["JANE".to_string()]);
        // A08不产生移动
        let venue = venue_of(&store, "VN-9").await;
        assert_eq!(store.movements_of_venue(venue.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_discharge_and_cancel_discharge() {
        let (store, pipeline, endpoint) = setup(false).await;
        assert_eq!(pipeline.process(A01.as_bytes(), &endpoint).await.ack_code, AckCode::Aa);
        assert_eq!(pipeline.process(A03.as_bytes(), &endpoint).await.ack_code, AckCode::Aa);

        let venue = venue_of(&store, "VN-9").await;
        assert_eq!(venue.status, VenueStatus::Discharged);
        assert!(venue.end.is_some());

        assert_eq!(pipeline.process(A13.as_bytes(), &endpoint).await.ack_code, AckCode::Aa);
        let venue = venue_of(&store, "VN-9").await;
        assert_eq!(venue.status, VenueStatus::Active);
        assert!(venue.end.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_control_id_acked_ae() {
        let (_store, pipeline, endpoint) = setup(false).await;
        assert_eq!(pipeline.process(A01.as_bytes(), &endpoint).await.ack_code, AckCode::Aa);
        let outcome = pipeline.process(A01.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Ae);
        assert!(outcome.ack.contains("DUPLICATE_CONTROL_ID"));
        let info = parse_ack(&outcome.ack).unwrap();
        assert_eq!(info.original_control_id.as_deref(), Some("CTL001"));
    }

    #[tokio::test]
    async fn test_unknown_uf_rejected() {
        let (_store, pipeline, endpoint) = setup(false).await;
        let message = A01.replace("^^^^^^^^^UF-CARD", "^^^^^^^^^UF-XXX");
        let outcome = pipeline.process(message.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Ae);
        assert!(outcome.ack.contains("UF_UNKNOWN"), "ack: {}", outcome.ack);
    }

    #[tokio::test]
    async fn test_patient_merge_repoints_dossiers() {
        let (store, pipeline, endpoint) = setup(false).await;
        assert_eq!(pipeline.process(A01.as_bytes(), &endpoint).await.ack_code, AckCode::Aa);
        assert_eq!(pipeline.process(A28.as_bytes(), &endpoint).await.ack_code, AckCode::Aa);

        // 吸收方向: IPP-42存续, IPP-43被并入
        let swapped = A40
            .replace("IPP-42^^^HOSP^PI||DOE^JOHN||19800115|M", "IPP-43^^^HOSP^PI||SMITH^ANNA||19900101|F")
            .replace("MRG|IPP-43^^^HOSP^PI", "MRG|IPP-42^^^HOSP^PI");
        let outcome = pipeline.process(swapped.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Aa, "ack: {}", outcome.ack);

        let survivor = patient_of(&store, "IPP-43").await;
        let absorbed = patient_of(&store, "IPP-42").await;
        assert_eq!(absorbed.merged_into, Some(survivor.id));
        let dossiers = store.dossiers_of_patient(survivor.id).await.unwrap();
        assert_eq!(dossiers.len(), 1);
    }

    #[tokio::test]
    async fn test_merge_with_unknown_patient_rejected() {
        let (_store, pipeline, endpoint) = setup(false).await;
        assert_eq!(pipeline.process(A01.as_bytes(), &endpoint).await.ack_code, AckCode::Aa);
        let outcome = pipeline.process(A40.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Ae);
        assert!(outcome.ack.contains("PATIENT_NOT_FOUND"));
    }

    #[tokio::test]
    async fn test_latin1_fallback_recorded_as_warning() {
        let (store, pipeline, endpoint) = setup(false).await;
        let mut raw = A01.replace("DOE^JOHN", "REMY^RENE").into_bytes();
        // 'E' → 0xC9 (Latin-1 'É'): 非法UTF-8序列
        let pos = raw.windows(4).position(|w| w == b"RENE").unwrap();
        raw[pos + 3] = 0xC9;
        let outcome = pipeline.process(&raw, &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Aa, "ack: {}", outcome.ack);

        let log = store
            .find_log_by_control_id("CTL001")
            .await
            .unwrap()
            .unwrap();
        assert!(log
            .diagnostics
            .iter()
            .any(|d| d.code == "ENCODING_FALLBACK" && d.severity == Severity::Warning));
    }

    #[tokio::test]
    async fn test_out_of_order_rejected_unless_historic() {
        let (_store, pipeline, endpoint) = setup(false).await;
        assert_eq!(pipeline.process(A01.as_bytes(), &endpoint).await.ack_code, AckCode::Aa);

        // ZBE-2早于入院时间
        let backdated = A02
            .replace("ZBE|MVT-2|20240115113000", "ZBE|MVT-2|20240115093000")
            .replace("CTL002", "CTL030");
        let outcome = pipeline.process(backdated.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Ae);
        assert!(outcome.ack.contains("chronological"), "ack: {}", outcome.ack);

        // 同样的时间戳带历史标记则被接受
        let historic = backdated
            .replace("|INSERT|N|", "|INSERT|Y|")
            .replace("CTL030", "CTL031");
        let outcome = pipeline.process(historic.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Aa, "ack: {}", outcome.ack);
    }

    #[tokio::test]
    async fn test_unparseable_message_gets_framing_ack() {
        let (_store, pipeline, endpoint) = setup(false).await;
        let outcome = pipeline.process(b"GARBAGE|NO|MSH", &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Ae);
        assert!(outcome.ack.contains("FRAMING_ERROR"));
    }

    #[tokio::test]
    async fn test_mfn_import_routed_through_pipeline() {
        let (store, pipeline, endpoint) = setup(false).await;
        let m05 = "MSH|^~\\&|GAM|EJ-001|MEDBRIDGE|EJ-001|20240115120000||MFN^M05|MFN01|P|2.5\r\
MFI|LOC||UPD|||AL\r\
LOC|POLE-B^Pôle B|PL\r\
LOC|SRV-URG^Urgences|D\r\
LOC|UF-URG^UF Urgences|UF\r";
        let outcome = pipeline.process(m05.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Aa, "ack: {}", outcome.ack);

        let ej_id = endpoint.juridical_entity_id.unwrap();
        let nodes = store
            .find_nodes(NodeKind::FunctionalUnit, "UF-URG", Some(ej_id))
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);

        // 导入后该UF可被ADT引用
        let message = A01
            .replace("^^^^^^^^^UF-CARD", "^^^^^^^^^UF-URG")
            .replace("CTL001", "CTL040");
        let outcome = pipeline.process(message.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Aa, "ack: {}", outcome.ack);
    }

    #[tokio::test]
    async fn test_validation_failure_logged_with_diagnostics() {
        let (store, pipeline, endpoint) = setup(false).await;
        let message = A01.replace("IPP-42^^^HOSP^PI", "");
        let outcome = pipeline.process(message.as_bytes(), &endpoint).await;
        assert_eq!(outcome.ack_code, AckCode::Ae);

        let log = store
            .find_log_by_control_id("CTL001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, MessageStatus::Error);
        assert!(!log.diagnostics.is_empty());
    }
}
