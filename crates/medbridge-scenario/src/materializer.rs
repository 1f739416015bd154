//! 模板物化
//!
//! 模板 + 协议 + 法人实体上下文 → 可发送的消息序列。整个序列分配
//! 一组IPP/NDA/VN（除非要求复用）, 每步一个MVT。消息由结构化提示
//! （语义码、角色、UF）与绑定的标识符经生成器合成, 不做文本替换。

use crate::timeplan::plan_times;
use chrono::{DateTime, Utc};
use medbridge_core::models::{
    DossierType, Endpoint, IdentifierKind, IdentifierNamespace, LocationPath, MovementAction,
    Patient, Protocol, ScenarioTemplate, Sex, StructureNode, UfRef, VenueStatus,
};
use medbridge_core::vocabulary::VocabularyRegistry;
use medbridge_core::{BridgeError, Result};
use medbridge_fhir::{build_transaction_bundle, BundleRequest, FhirIdentifier};
use medbridge_hl7::generator::{AdtGenerator, CxSource, GenerateRequest};
use medbridge_identifiers::IdentifierAllocator;
use medbridge_store::Store;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::info;

/// 整序列共用的标识符组
#[derive(Debug, Clone)]
pub struct GeneratedIds {
    pub ipp: String,
    pub nda: String,
    pub vn: String,
}

/// 物化选项
#[derive(Debug, Clone)]
pub struct MaterializationOptions {
    pub protocol: Protocol,
    pub ipp_prefix: Option<String>,
    pub nda_prefix: Option<String>,
    /// 复用既有标识符组（再物化同一场景时）
    pub reuse_identifiers: Option<GeneratedIds>,
    pub uf_medicale: UfRef,
}

impl Default for MaterializationOptions {
    fn default() -> Self {
        Self {
            protocol: Protocol::Hl7v2,
            ipp_prefix: None,
            nda_prefix: None,
            reuse_identifiers: None,
            uf_medicale: UfRef {
                code: "UF-DEMO".to_string(),
                label: Some("Unité de démonstration".to_string()),
            },
        }
    }
}

/// 物化后的一步
#[derive(Debug, Clone)]
pub struct MaterializedStep {
    pub order_index: i32,
    pub trigger: String,
    pub semantic_code: String,
    pub protocol: Protocol,
    pub payload: Vec<u8>,
    pub scheduled_at: DateTime<Utc>,
}

/// 模板物化器
pub struct Materializer {
    allocator: Arc<IdentifierAllocator>,
    generator: AdtGenerator,
    registry: VocabularyRegistry,
    ipp_namespace: IdentifierNamespace,
    nda_namespace: IdentifierNamespace,
    vn_namespace: IdentifierNamespace,
    mvt_namespace: IdentifierNamespace,
}

impl Materializer {
    pub fn new(
        store: Arc<dyn Store>,
        ipp_namespace: IdentifierNamespace,
        nda_namespace: IdentifierNamespace,
        vn_namespace: IdentifierNamespace,
        mvt_namespace: IdentifierNamespace,
    ) -> Self {
        Self {
            allocator: Arc::new(IdentifierAllocator::new(store)),
            generator: AdtGenerator::new(),
            registry: VocabularyRegistry::new(),
            ipp_namespace,
            nda_namespace,
            vn_namespace,
            mvt_namespace,
        }
    }

    /// 物化为有序消息列表
    pub async fn materialize(
        &self,
        template: &ScenarioTemplate,
        endpoint: &Endpoint,
        juridical_entity: &StructureNode,
        options: &MaterializationOptions,
    ) -> Result<(Vec<MaterializedStep>, GeneratedIds)> {
        if !template.protocols.contains(&options.protocol) {
            return Err(BridgeError::Validation(format!(
                "template {} does not support protocol {}",
                template.key,
                options.protocol.as_str()
            )));
        }

        // 整序列一组IPP/NDA/VN
        let ids = match &options.reuse_identifiers {
            Some(ids) => ids.clone(),
            None => GeneratedIds {
                ipp: self
                    .allocator
                    .allocate(&self.ipp_namespace, options.ipp_prefix.as_deref(), None)
                    .await?
                    .value,
                nda: self
                    .allocator
                    .allocate(&self.nda_namespace, options.nda_prefix.as_deref(), None)
                    .await?
                    .value,
                vn: self
                    .allocator
                    .allocate(&self.vn_namespace, None, None)
                    .await?
                    .value,
            },
        };

        let patient = synthetic_patient(template);
        let times = plan_times(template, Utc::now(), &mut StdRng::from_entropy());

        let mut steps = Vec::with_capacity(template.steps.len());
        let mut venue_status = VenueStatus::PreAdmitted;
        let mut location = LocationPath::parse("WARD^101^1");
        let mut room = 101u32;

        for (step, scheduled_at) in template.steps.iter().zip(times) {
            // 每步一个MVT
            let mvt = self
                .allocator
                .allocate(&self.mvt_namespace, None, None)
                .await?
                .value;

            venue_status = next_status(venue_status, &step.trigger);
            let mut prior_location = None;
            if step.trigger == "A02" {
                prior_location = location.clone();
                room += 1;
                location = LocationPath::parse(&format!("WARD^{room}^1"));
            }

            let protocol = step.protocol.unwrap_or(options.protocol);
            let payload = match protocol {
                Protocol::Hl7v2 => self.render_hl7(
                    step,
                    &patient,
                    &ids,
                    &mvt,
                    endpoint,
                    juridical_entity,
                    options,
                    location.clone(),
                    prior_location,
                    scheduled_at,
                )?,
                Protocol::Fhir => self.render_fhir(
                    step,
                    &patient,
                    &ids,
                    endpoint,
                    juridical_entity,
                    venue_status,
                    location.clone(),
                    scheduled_at,
                )?,
            };

            steps.push(MaterializedStep {
                order_index: step.order_index,
                trigger: step.trigger.clone(),
                semantic_code: step.semantic_code.clone(),
                protocol,
                payload,
                scheduled_at,
            });
        }

        info!(
            template = %template.key,
            steps = steps.len(),
            ipp = %ids.ipp,
            nda = %ids.nda,
            "模板物化完成"
        );
        Ok((steps, ids))
    }

    #[allow(clippy::too_many_arguments)]
    fn render_hl7(
        &self,
        step: &medbridge_core::models::ScenarioTemplateStep,
        patient: &Patient,
        ids: &GeneratedIds,
        mvt: &str,
        endpoint: &Endpoint,
        juridical_entity: &StructureNode,
        options: &MaterializationOptions,
        location: Option<LocationPath>,
        prior_location: Option<LocationPath>,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Vec<u8>> {
        let mut req = GenerateRequest::for_patient(step.trigger.clone(), patient.clone());
        req.timestamp = Some(scheduled_at);
        req.event_time = Some(scheduled_at);
        req.sending_facility = juridical_entity.code.clone();
        req.ipp = Some(cx(&ids.ipp, &self.ipp_namespace, IdentifierKind::Ipp));
        req.nda = Some(cx(&ids.nda, &self.nda_namespace, IdentifierKind::Nda));
        req.vn = Some(cx(&ids.vn, &self.vn_namespace, IdentifierKind::Vn));
        req.mvt = Some(cx(mvt, &self.mvt_namespace, IdentifierKind::Mvt));
        req.dossier_type = DossierType::Hospitalise;
        req.location = location;
        req.prior_location = prior_location;
        req.uf_medicale = Some(options.uf_medicale.clone());
        req.action = action_for(&step.trigger);
        req.original_trigger = original_for(&step.trigger);
        req.nature = self.registry.default_nature(&step.trigger);

        let text = self.generator.generate(&req, Some(endpoint), false)?;
        Ok(text.into_bytes())
    }

    #[allow(clippy::too_many_arguments)]
    fn render_fhir(
        &self,
        step: &medbridge_core::models::ScenarioTemplateStep,
        patient: &Patient,
        ids: &GeneratedIds,
        endpoint: &Endpoint,
        juridical_entity: &StructureNode,
        venue_status: VenueStatus,
        location: Option<LocationPath>,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Vec<u8>> {
        let req = BundleRequest {
            patient: patient.clone(),
            ipp: Some(fhir_id(&ids.ipp, &self.ipp_namespace, "PI")),
            nda: Some(fhir_id(&ids.nda, &self.nda_namespace, "AN")),
            vn: Some(fhir_id(&ids.vn, &self.vn_namespace, "VN")),
            venue_status,
            dossier_type: DossierType::Hospitalise,
            location,
            organization_code: juridical_entity.code.clone(),
            organization_name: Some(juridical_entity.label.clone()),
            practitioner_id: None,
            semantic_code: Some(step.semantic_code.clone()),
            action: action_for(&step.trigger),
            nature: self.registry.default_nature(&step.trigger),
            timestamp: scheduled_at,
        };
        let bundle = build_transaction_bundle(&req, Some(endpoint));
        Ok(bundle.to_json()?.into_bytes())
    }
}

fn cx(value: &str, namespace: &IdentifierNamespace, kind: IdentifierKind) -> CxSource {
    CxSource {
        value: value.to_string(),
        authority: Some(namespace.name.clone()),
        oid: namespace.oid.clone(),
        kind,
    }
}

fn fhir_id(value: &str, namespace: &IdentifierNamespace, type_code: &'static str) -> FhirIdentifier {
    FhirIdentifier {
        value: value.to_string(),
        system: Some(namespace.system.clone()),
        oid: namespace.oid.clone(),
        type_code,
    }
}

/// 合成患者: 模板无真实身份, 使用固定测试身份
fn synthetic_patient(template: &ScenarioTemplate) -> Patient {
    let mut patient = Patient::new(
        "TEMPLATE",
        vec![template
            .steps
            .first()
            .map(|s| s.semantic_code.clone())
            .unwrap_or_else(|| "SCENARIO".to_string())],
        Sex::Female,
    );
    patient.birth_date = chrono::NaiveDate::from_ymd_opt(1990, 1, 1);
    patient
}

fn action_for(trigger: &str) -> MovementAction {
    match trigger {
        "A11" | "A12" | "A13" => MovementAction::Cancel,
        _ => MovementAction::Insert,
    }
}

fn original_for(trigger: &str) -> Option<String> {
    match trigger {
        "A11" => Some("A01".to_string()),
        "A12" => Some("A02".to_string()),
        "A13" => Some("A03".to_string()),
        _ => None,
    }
}

fn next_status(current: VenueStatus, trigger: &str) -> VenueStatus {
    match trigger {
        "A05" => VenueStatus::PreAdmitted,
        "A01" | "A04" | "A13" | "A22" => VenueStatus::Active,
        "A02" => VenueStatus::Active,
        "A21" => VenueStatus::OnLeave,
        "A03" => VenueStatus::Discharged,
        "A11" => VenueStatus::Cancelled,
        _ => current,
    }
}
