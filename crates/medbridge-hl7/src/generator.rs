//! 出站HL7 PAM消息生成
//!
//! 从规范化实体生成ADT消息（段序: MSH, EVN, PID, [PD1], PV1, [MRG], ZBE）,
//! 以及入站处理的ACK应答（MSH + MSA + ERR*）。
//! CX复合中的赋值机构按端点强制覆盖 → 命名空间OID → system URI的顺序解析。

use crate::datetime::{format_hl7_date, format_hl7_datetime};
use crate::parser::{Delimiters, Hl7Message, Hl7Segment};
use crate::segments::render_xon_uf;
use chrono::{DateTime, Utc};
use medbridge_core::models::{
    Diagnostic, DossierType, Endpoint, IdentifierKind, LocationPath, MovementAction, Nature,
    Patient, Severity, UfRef,
};
use medbridge_core::vocabulary::VocabularyRegistry;
use medbridge_core::{BridgeError, Result};
use uuid::Uuid;

/// CX生成来源（值 + 命名空间定位信息）
#[derive(Debug, Clone)]
pub struct CxSource {
    pub value: String,
    pub authority: Option<String>,               // 命名空间名或system URI
    pub oid: Option<String>,
    pub kind: IdentifierKind,
}

impl CxSource {
    pub fn new(value: impl Into<String>, kind: IdentifierKind) -> Self {
        Self {
            value: value.into(),
            authority: None,
            oid: None,
            kind,
        }
    }

    /// 解析赋值机构: 端点强制OID → 端点强制system → 命名空间OID → system
    fn resolved_authority(&self, endpoint: Option<&Endpoint>) -> String {
        if let Some(ep) = endpoint {
            if let Some(oid) = &ep.forced_identifier_oid {
                return oid.clone();
            }
            if let Some(system) = &ep.forced_identifier_system {
                return system.clone();
            }
        }
        self.oid
            .clone()
            .or_else(|| self.authority.clone())
            .unwrap_or_default()
    }

    /// CX线级编码: value^^^authority^type
    pub fn render(&self, endpoint: Option<&Endpoint>) -> String {
        format!(
            "{}^^^{}^{}",
            self.value,
            self.resolved_authority(endpoint),
            self.kind.cx_type_code()
        )
    }

    /// ZBE-1编码: value^authority^oid^ISO
    fn render_zbe1(&self) -> String {
        match (&self.authority, &self.oid) {
            (Some(auth), Some(oid)) => format!("{}^{}^{}^ISO", self.value, auth, oid),
            (Some(auth), None) => format!("{}^{}", self.value, auth),
            _ => self.value.clone(),
        }
    }
}

/// 出站ADT消息生成请求
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub trigger: String,
    pub control_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub event_time: Option<DateTime<Utc>>,
    pub sending_application: String,
    pub sending_facility: String,
    pub patient: Patient,
    pub ipp: Option<CxSource>,
    pub nda: Option<CxSource>,
    pub vn: Option<CxSource>,
    pub mvt: Option<CxSource>,
    pub dossier_type: DossierType,
    pub location: Option<LocationPath>,
    pub prior_location: Option<LocationPath>,
    pub hospital_service: Option<String>,
    pub admit_time: Option<DateTime<Utc>>,
    pub action: MovementAction,
    pub historic: bool,
    pub original_trigger: Option<String>,
    pub uf_medicale: Option<UfRef>,
    pub uf_soins: Option<UfRef>,
    pub nature: Option<Nature>,
    pub merge_source_ipp: Option<CxSource>,      // A40: MRG-1
    pub include_zbe: bool,
}

impl GenerateRequest {
    pub fn for_patient(trigger: impl Into<String>, patient: Patient) -> Self {
        let trigger = trigger.into();
        let include_zbe = !matches!(trigger.as_str(), "A08" | "A28" | "A31" | "A40");
        Self {
            trigger,
            control_id: None,
            timestamp: None,
            event_time: None,
            sending_application: "MedBridge".to_string(),
            sending_facility: "MEDBRIDGE".to_string(),
            patient,
            ipp: None,
            nda: None,
            vn: None,
            mvt: None,
            dossier_type: DossierType::Hospitalise,
            location: None,
            prior_location: None,
            hospital_service: None,
            admit_time: None,
            action: MovementAction::Insert,
            historic: false,
            original_trigger: None,
            uf_medicale: None,
            uf_soins: None,
            nature: None,
            merge_source_ipp: None,
            include_zbe,
        }
    }
}

/// ADT消息生成器
#[derive(Debug, Default)]
pub struct AdtGenerator {
    registry: VocabularyRegistry,
}

impl AdtGenerator {
    pub fn new() -> Self {
        Self {
            registry: VocabularyRegistry::new(),
        }
    }

    /// 生成完整ADT消息文本
    pub fn generate(
        &self,
        req: &GenerateRequest,
        endpoint: Option<&Endpoint>,
        strict: bool,
    ) -> Result<String> {
        if strict && req.trigger == "A08" {
            return Err(BridgeError::Validation(
                "strict PAM FR forbids A08".to_string(),
            ));
        }

        let timestamp = req.timestamp.unwrap_or_else(Utc::now);
        let control_id = req
            .control_id
            .clone()
            .unwrap_or_else(|| fresh_control_id());
        let recv = endpoint
            .map(|ep| {
                (
                    ep.receiving_application.clone(),
                    ep.receiving_facility.clone(),
                )
            })
            .unwrap_or_else(|| ("TARGET".to_string(), "TARGET".to_string()));

        let mut segments = Vec::new();
        segments.push(build_msh(
            &req.sending_application,
            &req.sending_facility,
            &recv.0,
            &recv.1,
            timestamp,
            &req.trigger,
            &control_id,
        ));
        segments.push(build_evn(&req.trigger, req.event_time.unwrap_or(timestamp)));
        segments.push(self.build_pid(req, endpoint));
        if let Some(pd1) = self.build_pd1(req) {
            segments.push(pd1);
        }
        if req.trigger == "A40" {
            segments.push(self.build_mrg(req, endpoint)?);
        }
        segments.push(self.build_pv1(req, endpoint));
        if req.include_zbe {
            segments.push(self.build_zbe(req)?);
        }

        let msg = Hl7Message {
            delimiters: Delimiters::default(),
            segments,
        };
        Ok(msg.serialize())
    }

    fn build_pid(&self, req: &GenerateRequest, endpoint: Option<&Endpoint>) -> Hl7Segment {
        let mut seg = Hl7Segment::new("PID");
        seg.set_field(1, "1");

        let mut pid3 = Vec::new();
        if let Some(ipp) = &req.ipp {
            pid3.push(ipp.render(endpoint));
        }
        if let Some(nid) = &req.patient.national_id {
            pid3.push(format!("{}^^^INS^INS", nid.value));
        }
        seg.set_field(3, pid3.join("~"));

        let mut name = req.patient.family.clone();
        for given in &req.patient.givens {
            name.push('^');
            name.push_str(given);
        }
        seg.set_field(5, name);
        if let Some(birth) = req.patient.birth_date {
            seg.set_field(7, format_hl7_date(birth));
        }
        seg.set_field(8, req.patient.sex.hl7_code());
        if let Some(addr) = &req.patient.address {
            seg.set_field(
                11,
                format!(
                    "{}^^{}^^{}^{}",
                    addr,
                    req.patient.city.as_deref().unwrap_or(""),
                    req.patient.postal_code.as_deref().unwrap_or(""),
                    req.patient.country.as_deref().unwrap_or("")
                ),
            );
        }
        if let Some(phone) = &req.patient.phone {
            seg.set_field(13, phone.clone());
        }
        if let Some(status) = &req.patient.marital_status {
            seg.set_field(16, status.clone());
        }
        if let Some(nda) = &req.nda {
            seg.set_field(18, nda.render(endpoint));
        }
        if let Some(place) = &req.patient.birth_place {
            seg.set_field(23, place.clone());
        }
        seg.set_field(32, req.patient.reliability.as_str());
        seg
    }

    fn build_pd1(&self, req: &GenerateRequest) -> Option<Hl7Segment> {
        let patient = &req.patient;
        if patient.primary_care_provider.is_none() && patient.language.is_none() {
            return None;
        }
        let mut seg = Hl7Segment::new("PD1");
        if let Some(provider) = &patient.primary_care_provider {
            seg.set_field(3, provider.clone());
        }
        if let Some(language) = &patient.language {
            seg.set_field(6, language.clone());
        }
        Some(seg)
    }

    fn build_pv1(&self, req: &GenerateRequest, endpoint: Option<&Endpoint>) -> Hl7Segment {
        let mut seg = Hl7Segment::new("PV1");
        seg.set_field(1, "1");
        seg.set_field(2, req.dossier_type.patient_class());
        if let Some(loc) = &req.location {
            seg.set_field(3, loc.hl7());
        }
        // 转科消息必须回显来源位置
        if req.trigger == "A02" {
            if let Some(prior) = &req.prior_location {
                seg.set_field(6, prior.hl7());
            }
        }
        if let Some(service) = &req.hospital_service {
            seg.set_field(10, service.clone());
        }
        if let Some(vn) = &req.vn {
            seg.set_field(19, vn.render(endpoint));
        }
        if let Some(admit) = req.admit_time {
            seg.set_field(44, format_hl7_datetime(admit));
        }
        seg
    }

    fn build_mrg(&self, req: &GenerateRequest, endpoint: Option<&Endpoint>) -> Result<Hl7Segment> {
        let source = req.merge_source_ipp.as_ref().ok_or_else(|| {
            BridgeError::Validation("A40 requires the absorbed patient identifier".to_string())
        })?;
        let mut seg = Hl7Segment::new("MRG");
        seg.set_field(1, source.render(endpoint));
        Ok(seg)
    }

    fn build_zbe(&self, req: &GenerateRequest) -> Result<Hl7Segment> {
        let uf_medicale = req.uf_medicale.as_ref().ok_or_else(|| {
            BridgeError::Validation(format!(
                "ZBE-7 medical functional unit required for ADT^{}",
                req.trigger
            ))
        })?;

        let mut seg = Hl7Segment::new("ZBE");
        if let Some(mvt) = &req.mvt {
            seg.set_field(1, mvt.render_zbe1());
        }
        seg.set_field(
            2,
            format_hl7_datetime(req.event_time.or(req.timestamp).unwrap_or_else(Utc::now)),
        );
        seg.set_field(4, req.action.as_str());
        seg.set_field(5, if req.historic { "Y" } else { "N" });
        if matches!(req.action, MovementAction::Update | MovementAction::Cancel) {
            let original = req
                .original_trigger
                .clone()
                .unwrap_or_else(|| req.trigger.clone());
            seg.set_field(6, original);
        }
        seg.set_field(7, render_xon_uf(uf_medicale));
        if let Some(uf_soins) = &req.uf_soins {
            seg.set_field(8, render_xon_uf(uf_soins));
        }
        if let Some(nature) = self.registry.effective_nature(&req.trigger, req.nature) {
            seg.set_field(9, nature.as_str());
        }
        Ok(seg)
    }
}

/// 生成新控制ID（UUID派生, 20字符）
pub fn fresh_control_id() -> String {
    Uuid::new_v4().simple().to_string()[..20].to_string()
}

fn build_msh(
    sending_application: &str,
    sending_facility: &str,
    receiving_application: &str,
    receiving_facility: &str,
    timestamp: DateTime<Utc>,
    trigger: &str,
    control_id: &str,
) -> Hl7Segment {
    let mut seg = Hl7Segment::new("MSH");
    seg.set_field(1, "|");
    seg.set_field(2, "^~\\&");
    seg.set_field(3, sending_application);
    seg.set_field(4, sending_facility);
    seg.set_field(5, receiving_application);
    seg.set_field(6, receiving_facility);
    seg.set_field(7, format_hl7_datetime(timestamp));
    let message_code = if trigger == "ACK" { "ACK".to_string() } else { format!("ADT^{trigger}") };
    seg.set_field(9, message_code);
    seg.set_field(10, control_id);
    seg.set_field(11, "P");
    seg.set_field(12, "2.5");
    seg
}

fn build_evn(trigger: &str, event_time: DateTime<Utc>) -> Hl7Segment {
    let mut seg = Hl7Segment::new("EVN");
    seg.set_field(1, trigger);
    seg.set_field(2, format_hl7_datetime(event_time));
    seg
}

// ========== ACK ==========

/// ACK应答码 (MSA-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckCode {
    Aa,
    Ae,
    Ar,
}

impl AckCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckCode::Aa => "AA",
            AckCode::Ae => "AE",
            AckCode::Ar => "AR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AA" | "CA" => Some(AckCode::Aa),
            "AE" | "CE" => Some(AckCode::Ae),
            "AR" | "CR" => Some(AckCode::Ar),
            _ => None,
        }
    }
}

/// 构建ACK消息 (MSH + MSA, AE/AR时每条诊断附一个ERR段)
pub fn build_ack(
    code: AckCode,
    original_control_id: &str,
    text: &str,
    diagnostics: &[Diagnostic],
    sending_application: &str,
    sending_facility: &str,
) -> String {
    let mut segments = vec![build_msh(
        sending_application,
        sending_facility,
        "SOURCE",
        "SOURCE",
        Utc::now(),
        "ACK",
        &fresh_control_id(),
    )];

    let mut msa = Hl7Segment::new("MSA");
    msa.set_field(1, code.as_str());
    msa.set_field(2, original_control_id);
    if !text.is_empty() {
        // 字段分隔符转义
        msa.set_field(3, text.replace('|', "\\F\\"));
    }
    segments.push(msa);

    if code != AckCode::Aa {
        for diag in diagnostics {
            let severity = match diag.severity {
                Severity::Error => "E",
                Severity::Warning => "W",
                Severity::Info => "I",
            };
            let mut err = Hl7Segment::new("ERR");
            err.set_field(
                2,
                format!(
                    "{}^{}",
                    diag.segment.as_deref().unwrap_or(""),
                    diag.field.as_deref().unwrap_or("")
                ),
            );
            err.set_field(3, format!("{}^{}", diag.code, diag.text.replace('|', "\\F\\")));
            err.set_field(4, severity);
            segments.push(err);
        }
    }

    Hl7Message {
        delimiters: Delimiters::default(),
        segments,
    }
    .serialize()
}

/// 解析后的ACK信息
#[derive(Debug, Clone)]
pub struct AckInfo {
    pub code: AckCode,
    pub original_control_id: Option<String>,
    pub text: Option<String>,
}

/// 解析ACK应答
pub fn parse_ack(text: &str) -> Result<AckInfo> {
    let msg = Hl7Message::parse(text)?;
    let msa = msg
        .segment("MSA")
        .ok_or_else(|| BridgeError::Parse("ACK without MSA segment".to_string()))?;
    let code = msa
        .field(1)
        .and_then(AckCode::parse)
        .ok_or_else(|| BridgeError::Parse("MSA-1 missing or invalid".to_string()))?;
    Ok(AckInfo {
        code,
        original_control_id: msa.field(2).map(String::from),
        text: msa.field(3).map(String::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segments::{extract_pid, extract_pv1, extract_zbe};
    use chrono::TimeZone;
    use medbridge_core::models::Sex;

    fn sample_request() -> GenerateRequest {
        let patient = {
            let mut p = Patient::new("DOE", vec!["JOHN".to_string()], Sex::Male);
            p.birth_date = chrono::NaiveDate::from_ymd_opt(1980, 1, 15);
            p
        };
        let mut req = GenerateRequest::for_patient("A01", patient);
        req.timestamp = Some(Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap());
        req.ipp = Some(CxSource {
            value: "IPP-42".into(),
            authority: Some("HOSP".into()),
            oid: None,
            kind: IdentifierKind::Ipp,
        });
        req.nda = Some(CxSource {
            value: "NDA-7".into(),
            authority: Some("HOSP".into()),
            oid: None,
            kind: IdentifierKind::Nda,
        });
        req.vn = Some(CxSource {
            value: "VN-9".into(),
            authority: Some("HOSP".into()),
            oid: None,
            kind: IdentifierKind::Vn,
        });
        req.mvt = Some(CxSource::new("MVT-1", IdentifierKind::Mvt));
        req.location = Some(LocationPath::parse("CARD^101^1").unwrap());
        req.uf_medicale = Some(UfRef {
            code: "UF-CARD".into(),
            label: Some("CARDIOLOGIE".into()),
        });
        req
    }

    #[test]
    fn test_generate_a01_roundtrips() {
        let gen = AdtGenerator::new();
        let text = gen.generate(&sample_request(), None, false).unwrap();
        let msg = Hl7Message::parse(&text).unwrap();
        assert_eq!(msg.trigger(), Some("A01"));

        let pid = extract_pid(&msg);
        assert_eq!(pid.identifiers[0].value, "IPP-42");
        assert_eq!(pid.identifiers[0].type_code.as_deref(), Some("PI"));
        assert_eq!(pid.account_number.as_ref().unwrap().value, "NDA-7");

        let pv1 = extract_pv1(&msg);
        assert_eq!(pv1.patient_class.as_deref(), Some("I"));
        assert_eq!(pv1.visit_number.as_ref().unwrap().value, "VN-9");

        let zbe = extract_zbe(&msg);
        assert_eq!(zbe.movement_id.as_deref(), Some("MVT-1"));
        assert_eq!(zbe.uf_medicale.as_ref().unwrap().code, "UF-CARD");
        // 未显式给出性质时按触发码派生 (A01→S)
        assert_eq!(zbe.nature(), Some(Nature::S));
    }

    #[test]
    fn test_a02_carries_prior_location() {
        let mut req = sample_request();
        req.trigger = "A02".to_string();
        req.location = Some(LocationPath::parse("CARD^102^1").unwrap());
        req.prior_location = Some(LocationPath::parse("CARD^101^1").unwrap());
        let text = AdtGenerator::new().generate(&req, None, false).unwrap();
        let msg = Hl7Message::parse(&text).unwrap();
        let pv1 = extract_pv1(&msg);
        assert_eq!(pv1.prior_location.as_ref().unwrap().hl7(), "CARD^101^1");
        assert_eq!(extract_zbe(&msg).nature(), Some(Nature::M));
    }

    #[test]
    fn test_endpoint_forced_oid_overrides_authority() {
        let mut endpoint = Endpoint::new("target", medbridge_core::models::EndpointKind::MllpSender);
        endpoint.forced_identifier_oid = Some("1.2.250.1.999".to_string());
        let text = AdtGenerator::new()
            .generate(&sample_request(), Some(&endpoint), false)
            .unwrap();
        let msg = Hl7Message::parse(&text).unwrap();
        let pid = extract_pid(&msg);
        assert_eq!(
            pid.identifiers[0].assigning_authority.as_deref(),
            Some("1.2.250.1.999")
        );
    }

    #[test]
    fn test_strict_mode_blocks_a08_generation() {
        let mut req = sample_request();
        req.trigger = "A08".to_string();
        req.include_zbe = false;
        let err = AdtGenerator::new().generate(&req, None, true).unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));
    }

    #[test]
    fn test_a40_builds_mrg() {
        let mut req = sample_request();
        req.trigger = "A40".to_string();
        req.include_zbe = false;
        req.merge_source_ipp = Some(CxSource {
            value: "IPP-OLD".into(),
            authority: Some("HOSP".into()),
            oid: None,
            kind: IdentifierKind::Ipp,
        });
        let text = AdtGenerator::new().generate(&req, None, false).unwrap();
        let msg = Hl7Message::parse(&text).unwrap();
        let mrg = crate::segments::extract_mrg(&msg);
        assert_eq!(mrg.prior_identifier.unwrap().value, "IPP-OLD");
    }

    #[test]
    fn test_cancel_fills_zbe6_fallback() {
        let mut req = sample_request();
        req.trigger = "A11".to_string();
        req.action = MovementAction::Cancel;
        let text = AdtGenerator::new().generate(&req, None, false).unwrap();
        let msg = Hl7Message::parse(&text).unwrap();
        let zbe = extract_zbe(&msg);
        assert_eq!(zbe.original_trigger.as_deref(), Some("A11"));
    }

    #[test]
    fn test_ack_roundtrip() {
        let diags = vec![Diagnostic::error("INVALID_TRANSITION", "venue already cancelled")
            .at("ZBE", Some("4"))];
        let ack = build_ack(AckCode::Ae, "CTL001", "rejected", &diags, "MedBridge", "POC");
        let info = parse_ack(&ack).unwrap();
        assert_eq!(info.code, AckCode::Ae);
        assert_eq!(info.original_control_id.as_deref(), Some("CTL001"));
        assert!(ack.contains("INVALID_TRANSITION"));
        assert!(ack.contains("ERR|"));
    }

    #[test]
    fn test_ack_aa_has_no_err_segments() {
        let ack = build_ack(AckCode::Aa, "CTL001", "", &[], "MedBridge", "POC");
        assert!(!ack.contains("ERR|"));
        let msg = Hl7Message::parse(&ack).unwrap();
        assert_eq!(msg.segment("MSA").unwrap().field(2), Some("CTL001"));
    }
}
