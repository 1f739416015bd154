//! 核心数据模型定义
//!
//! 医院患者行政生命周期的规范化模型：
//! - Patient / Dossier / Venue / Mouvement（患者→档案→住院→移动）
//! - 组织结构树（法人实体→极→科室→功能单元→房间→床位）
//! - 标识符命名空间（IPP / NDA / VN / MVT）
//! - 消息日志与场景模板

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ========== 患者身份 ==========

/// 行政性别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    Male,
    Female,
    Other,
    Unknown,
}

impl Sex {
    /// PID-8编码
    pub fn hl7_code(&self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
            Sex::Other => "O",
            Sex::Unknown => "U",
        }
    }

    pub fn from_hl7(code: &str) -> Self {
        match code {
            "M" => Sex::Male,
            "F" => Sex::Female,
            "O" | "A" => Sex::Other,
            _ => Sex::Unknown,
        }
    }

    /// FHIR administrative-gender编码
    pub fn fhir_code(&self) -> &'static str {
        match self {
            Sex::Male => "male",
            Sex::Female => "female",
            Sex::Other => "other",
            Sex::Unknown => "unknown",
        }
    }
}

/// 身份可靠性等级 (PID-32, profil FR)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityReliability {
    Vali,
    Qual,
    Prov,
    Vide,
    Doute,
    Doub,
}

impl IdentityReliability {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentityReliability::Vali => "VALI",
            IdentityReliability::Qual => "QUAL",
            IdentityReliability::Prov => "PROV",
            IdentityReliability::Vide => "VIDE",
            IdentityReliability::Doute => "DOUTE",
            IdentityReliability::Doub => "DOUB",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VALI" => Some(IdentityReliability::Vali),
            "QUAL" => Some(IdentityReliability::Qual),
            "PROV" => Some(IdentityReliability::Prov),
            "VIDE" => Some(IdentityReliability::Vide),
            "DOUTE" => Some(IdentityReliability::Doute),
            "DOUB" => Some(IdentityReliability::Doub),
            _ => None,
        }
    }
}

/// 国家健康标识符类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NationalIdType {
    Nir,
    InsC,
}

/// 国家健康标识符 (INS)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NationalId {
    pub value: String,
    pub id_type: NationalIdType,
    pub in_registry: bool,                       // INS-A: 已在国家登记处确认
    pub last_query: Option<DateTime<Utc>>,
}

/// 患者基本信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: Uuid,
    pub family: String,                          // 姓
    pub birth_family: Option<String>,            // 出生姓 (XPN type L)
    pub givens: Vec<String>,                     // 名（有序）
    pub birth_date: Option<NaiveDate>,
    pub sex: Sex,
    pub birth_place: Option<String>,             // 出生地自由文本 (PID-23)
    pub birth_insee: Option<String>,             // INSEE代码
    pub birth_country: Option<String>,
    pub national_id: Option<NationalId>,
    pub reliability: IdentityReliability,
    pub address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub phone: Option<String>,
    pub mobile: Option<String>,
    pub marital_status: Option<String>,
    pub primary_care_provider: Option<String>,   // PD1-3
    pub language: Option<String>,                // PD1-6
    pub merged_into: Option<Uuid>,               // A40吸收后指向存续患者
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Patient {
    pub fn new(family: impl Into<String>, givens: Vec<String>, sex: Sex) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            family: family.into(),
            birth_family: None,
            givens,
            birth_date: None,
            sex,
            birth_place: None,
            birth_insee: None,
            birth_country: None,
            national_id: None,
            reliability: IdentityReliability::Prov,
            address: None,
            city: None,
            postal_code: None,
            country: None,
            phone: None,
            mobile: None,
            marital_status: None,
            primary_care_provider: None,
            language: None,
            merged_into: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ========== 档案与住院 ==========

/// 行政档案类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DossierType {
    Hospitalise,
    Urgences,
    Externe,
    Ambulatoire,
}

impl DossierType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DossierType::Hospitalise => "HOSPITALISE",
            DossierType::Urgences => "URGENCES",
            DossierType::Externe => "EXTERNE",
            DossierType::Ambulatoire => "AMBULATOIRE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HOSPITALISE" => Some(DossierType::Hospitalise),
            "URGENCES" => Some(DossierType::Urgences),
            "EXTERNE" => Some(DossierType::Externe),
            "AMBULATOIRE" => Some(DossierType::Ambulatoire),
            _ => None,
        }
    }

    /// PV1-2患者类别编码
    pub fn patient_class(&self) -> &'static str {
        match self {
            DossierType::Hospitalise => "I",
            DossierType::Urgences => "E",
            DossierType::Externe => "O",
            DossierType::Ambulatoire => "O",
        }
    }

    pub fn from_patient_class(class: &str) -> Self {
        match class {
            "E" => DossierType::Urgences,
            "O" => DossierType::Externe,
            _ => DossierType::Hospitalise,
        }
    }

    /// FHIR Encounter.class编码 (v3-ActCode)
    pub fn fhir_class(&self) -> &'static str {
        match self {
            DossierType::Hospitalise => "IMP",
            DossierType::Urgences => "EMER",
            DossierType::Externe => "AMB",
            DossierType::Ambulatoire => "AMB",
        }
    }
}

/// 行政档案（admission folder）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dossier {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub juridical_entity_id: Uuid,
    pub sequence: i64,                           // 每法人实体内唯一
    pub admit_time: Option<DateTime<Utc>>,
    pub dossier_type: DossierType,
    pub uf_medicale: Option<String>,
    pub uf_hebergement: Option<String>,
    pub uf_soins: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 住院运营状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VenueStatus {
    PreAdmitted,
    Active,
    OnLeave,
    Discharged,
    Cancelled,
}

impl VenueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueStatus::PreAdmitted => "PRE_ADMITTED",
            VenueStatus::Active => "ACTIVE",
            VenueStatus::OnLeave => "ON_LEAVE",
            VenueStatus::Discharged => "DISCHARGED",
            VenueStatus::Cancelled => "CANCELLED",
        }
    }

    /// FHIR Encounter.status派生
    pub fn fhir_status(&self) -> &'static str {
        match self {
            VenueStatus::PreAdmitted => "planned",
            VenueStatus::Active => "in-progress",
            VenueStatus::OnLeave => "onleave",
            VenueStatus::Discharged => "finished",
            VenueStatus::Cancelled => "cancelled",
        }
    }
}

/// 病房位置 (PV1-3: point of care^room^bed)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationPath {
    pub point_of_care: String,
    pub room: Option<String>,
    pub bed: Option<String>,
}

impl LocationPath {
    pub fn new(point_of_care: impl Into<String>) -> Self {
        Self {
            point_of_care: point_of_care.into(),
            room: None,
            bed: None,
        }
    }

    /// 从PV1-3组件解析; 空串返回None
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.trim().is_empty() {
            return None;
        }
        let mut comps = raw.split('^');
        let poc = comps.next().unwrap_or_default().to_string();
        let room = comps.next().filter(|s| !s.is_empty()).map(String::from);
        let bed = comps.next().filter(|s| !s.is_empty()).map(String::from);
        Some(Self {
            point_of_care: poc,
            room,
            bed,
        })
    }

    /// PV1-3线级编码
    pub fn hl7(&self) -> String {
        match (&self.room, &self.bed) {
            (Some(r), Some(b)) => format!("{}^{}^{}", self.point_of_care, r, b),
            (Some(r), None) => format!("{}^{}", self.point_of_care, r),
            (None, _) => self.point_of_care.clone(),
        }
    }
}

impl std::fmt::Display for LocationPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.point_of_care)?;
        if let Some(r) = &self.room {
            write!(f, "/{}", r)?;
        }
        if let Some(b) = &self.bed {
            write!(f, "/{}", b)?;
        }
        Ok(())
    }
}

/// 住院（一段连续照护期, encounter）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Venue {
    pub id: Uuid,
    pub dossier_id: Uuid,
    pub sequence: i64,                           // 每法人实体内唯一
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub status: VenueStatus,
    pub location: Option<LocationPath>,
    pub hospital_service: Option<String>,        // PV1-10
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ========== 移动 ==========

/// ZBE-4动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementAction {
    Insert,
    Update,
    Cancel,
}

impl MovementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementAction::Insert => "INSERT",
            MovementAction::Update => "UPDATE",
            MovementAction::Cancel => "CANCEL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(MovementAction::Insert),
            "UPDATE" => Some(MovementAction::Update),
            "CANCEL" => Some(MovementAction::Cancel),
            _ => None,
        }
    }
}

/// ZBE-9移动性质
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Nature {
    S,
    H,
    M,
    L,
    D,
    Sm,
}

impl Nature {
    pub fn as_str(&self) -> &'static str {
        match self {
            Nature::S => "S",
            Nature::H => "H",
            Nature::M => "M",
            Nature::L => "L",
            Nature::D => "D",
            Nature::Sm => "SM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "S" => Some(Nature::S),
            "H" => Some(Nature::H),
            "M" => Some(Nature::M),
            "L" => Some(Nature::L),
            "D" => Some(Nature::D),
            "SM" => Some(Nature::Sm),
            _ => None,
        }
    }
}

/// 功能单元引用 (ZBE-7/ZBE-8 XON: 组件1标签, 组件10代码)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UfRef {
    pub code: String,
    pub label: Option<String>,
}

/// 住院上的单次行政移动事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Movement {
    pub id: Uuid,
    pub venue_id: Uuid,
    pub sequence: i64,                           // 移动序号（venue内时序）
    pub when: DateTime<Utc>,
    pub trigger: String,                         // ADT触发码 (A01, A02, ...)
    pub action: MovementAction,
    pub historic: bool,                          // ZBE-5=Y
    pub original_trigger: Option<String>,        // UPDATE/CANCEL时必填
    pub uf_medicale: UfRef,
    pub uf_soins: Option<UfRef>,
    pub nature: Option<Nature>,
    pub location: Option<LocationPath>,
    pub cancels_sequence: Option<i64>,           // CANCEL指向的被取消移动
    pub cancelled: bool,                         // 被后续CANCEL标记
    pub created_at: DateTime<Utc>,
}

// ========== 组织结构 ==========

/// 结构树节点类型（严格层级）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Territory,
    JuridicalEntity,
    GeographicEntity,
    Pole,
    Service,
    FunctionalUnit,
    HousingUnit,
    Room,
    Bed,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Territory => "TERRITORY",
            NodeKind::JuridicalEntity => "JURIDICAL_ENTITY",
            NodeKind::GeographicEntity => "GEOGRAPHIC_ENTITY",
            NodeKind::Pole => "POLE",
            NodeKind::Service => "SERVICE",
            NodeKind::FunctionalUnit => "FUNCTIONAL_UNIT",
            NodeKind::HousingUnit => "HOUSING_UNIT",
            NodeKind::Room => "ROOM",
            NodeKind::Bed => "BED",
        }
    }

    /// 合法父节点类型
    pub fn parent_kind(&self) -> Option<NodeKind> {
        match self {
            NodeKind::Territory => None,
            NodeKind::JuridicalEntity => Some(NodeKind::Territory),
            NodeKind::GeographicEntity => Some(NodeKind::JuridicalEntity),
            NodeKind::Pole => Some(NodeKind::GeographicEntity),
            NodeKind::Service => Some(NodeKind::Pole),
            NodeKind::FunctionalUnit => Some(NodeKind::Service),
            NodeKind::HousingUnit => Some(NodeKind::FunctionalUnit),
            NodeKind::Room => Some(NodeKind::HousingUnit),
            NodeKind::Bed => Some(NodeKind::Room),
        }
    }

    /// MFN LOC段位置类型编码
    pub fn mfn_code(&self) -> &'static str {
        match self {
            NodeKind::Territory => "GHT",
            NodeKind::JuridicalEntity => "ETBL_GRPQ",
            NodeKind::GeographicEntity => "ETBL_GRPQ",
            NodeKind::Pole => "PL",
            NodeKind::Service => "D",
            NodeKind::FunctionalUnit => "UF",
            NodeKind::HousingUnit => "UH",
            NodeKind::Room => "CH",
            NodeKind::Bed => "LIT",
        }
    }

    pub fn from_mfn_code(code: &str) -> Option<Self> {
        match code {
            "PL" => Some(NodeKind::Pole),
            "D" => Some(NodeKind::Service),
            "UF" => Some(NodeKind::FunctionalUnit),
            "UH" => Some(NodeKind::HousingUnit),
            "CH" => Some(NodeKind::Room),
            "LIT" | "BED" => Some(NodeKind::Bed),
            "ETBL_GRPQ" => Some(NodeKind::GeographicEntity),
            _ => None,
        }
    }
}

/// 组织结构节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureNode {
    pub id: Uuid,
    pub kind: NodeKind,
    pub code: String,                            // 同范围内唯一
    pub label: String,
    pub parent_id: Option<Uuid>,
    pub juridical_entity_id: Option<Uuid>,       // 所属法人实体（EJ自身为None）
    pub finess: Option<String>,                  // 仅法人实体
    pub is_virtual: bool,                        // 自动创建占位, 可被MFN导入替换
    pub strict_pam_fr: bool,                     // 仅法人实体: PAM FR严格模式
    pub auto_create_uf: bool,                    // 仅法人实体: 未知UF自动创建策略
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StructureNode {
    pub fn new(kind: NodeKind, code: impl Into<String>, label: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            code: code.into(),
            label: label.into(),
            parent_id: None,
            juridical_entity_id: None,
            finess: None,
            is_virtual: false,
            strict_pam_fr: false,
            auto_create_uf: false,
            created_at: now,
            updated_at: now,
        }
    }
}

// ========== 标识符命名空间 ==========

/// 标识符类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentifierKind {
    Ipp,
    Nda,
    Vn,
    Mvt,
    Ins,
    Structure,
}

impl IdentifierKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierKind::Ipp => "IPP",
            IdentifierKind::Nda => "NDA",
            IdentifierKind::Vn => "VN",
            IdentifierKind::Mvt => "MVT",
            IdentifierKind::Ins => "INS",
            IdentifierKind::Structure => "STRUCTURE",
        }
    }

    /// CX组件5的HL7两字母类型码
    pub fn cx_type_code(&self) -> &'static str {
        match self {
            IdentifierKind::Ipp => "PI",
            IdentifierKind::Nda => "AN",
            IdentifierKind::Vn => "VN",
            IdentifierKind::Mvt => "MV",
            IdentifierKind::Ins => "INS",
            IdentifierKind::Structure => "XX",
        }
    }
}

/// 标识符生成模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationMode {
    FixedPrefix,
    Range,
    External,
}

/// 标识符命名空间（命名取值池）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifierNamespace {
    pub id: Uuid,
    pub name: String,
    pub system: String,                          // system URI
    pub oid: Option<String>,
    pub kind: IdentifierKind,
    pub juridical_entity_id: Option<Uuid>,       // None = 全局
    pub mode: GenerationMode,
    pub prefix_pattern: Option<String>,          // 如 "9..." = 前缀9 + 3位随机
    pub range_min: Option<i64>,
    pub range_max: Option<i64>,
}

/// 已分配的标识符记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifierRecord {
    pub id: Uuid,
    pub value: String,
    pub kind: IdentifierKind,
    pub system: String,
    pub subject_id: Option<Uuid>,                // 持有实体（患者/档案/住院/移动）
    pub created_at: DateTime<Utc>,
}

// ========== 诊断与消息日志 ==========

/// 诊断严重级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// 带上下文的诊断条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub severity: Severity,
    pub segment: Option<String>,
    pub field: Option<String>,
    pub text: String,
}

impl Diagnostic {
    pub fn error(code: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            severity: Severity::Error,
            segment: None,
            field: None,
            text: text.into(),
        }
    }

    pub fn warning(code: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            severity: Severity::Warning,
            segment: None,
            field: None,
            text: text.into(),
        }
    }

    pub fn at(mut self, segment: &str, field: Option<&str>) -> Self {
        self.segment = Some(segment.to_string());
        self.field = field.map(String::from);
        self
    }
}

/// 消息方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// 消息日志状态 (pending→success|error, 仅一次)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    Pending,
    Success,
    Error,
}

/// 消息日志条目（append-only）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageLogEntry {
    pub id: Uuid,
    pub control_id: String,                      // 全局唯一
    pub trigger: Option<String>,
    pub direction: Direction,
    pub correlation_id: Option<String>,          // 请求/ACK配对
    pub raw: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub diagnostics: Vec<Diagnostic>,
    pub endpoint_id: Option<Uuid>,
}

// ========== 场景模板 ==========

/// 支持的线级协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Hl7v2,
    Fhir,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Hl7v2 => "HL7v2",
            Protocol::Fhir => "FHIR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HL7v2" | "HL7" | "hl7" => Some(Protocol::Hl7v2),
            "FHIR" | "fhir" => Some(Protocol::Fhir),
            _ => None,
        }
    }
}

/// 步骤消息角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRole {
    Lifecycle,
    Admission,
    Transfer,
    Discharge,
    Update,
}

/// 时间锚定模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeAnchorMode {
    /// 首步 = now + 偏移天数
    Sliding,
    /// 首步 = 给定时间戳
    Fixed,
    /// 保留快照时间戳
    NoShift,
}

/// 场景时间配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeConfig {
    pub anchor: TimeAnchorMode,
    pub anchor_days_offset: Option<i64>,
    pub fixed_start: Option<DateTime<Utc>>,
    pub preserve_intervals: bool,
    pub jitter_min_minutes: Option<i64>,
    pub jitter_max_minutes: Option<i64>,
    pub jitter_triggers: Vec<String>,            // jitter仅作用于这些触发码
}

impl Default for TimeConfig {
    fn default() -> Self {
        Self {
            anchor: TimeAnchorMode::Sliding,
            anchor_days_offset: Some(0),
            fixed_start: None,
            preserve_intervals: true,
            jitter_min_minutes: None,
            jitter_max_minutes: None,
            jitter_triggers: ["A02", "A03", "A06", "A07", "A08"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// 模板单步（抽象事件）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioTemplateStep {
    pub order_index: i32,
    pub semantic_code: String,                   // 语义事件码 (ADMISSION_CONFIRMED, ...)
    pub trigger: String,                         // 派生线级触发码 (A01, ...)
    pub narrative: Option<String>,
    pub role: MessageRole,
    pub delay_seconds: i64,                      // 距上一步的延迟
    pub payload_snapshot: Option<String>,        // 参考载荷快照（无外键）
    pub snapshot_when: Option<DateTime<Utc>>,    // 捕获时刻的原始时间戳
    pub protocol: Option<Protocol>,
}

/// 场景模板（有序语义事件序列, 独立于任何真实档案）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioTemplate {
    pub id: Uuid,
    pub key: String,                             // 唯一键
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub protocols: Vec<Protocol>,
    pub time_config: TimeConfig,
    pub steps: Vec<ScenarioTemplateStep>,
    pub created_at: DateTime<Utc>,
}

// ========== 场景执行 ==========

/// 单步执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStepStatus {
    Success,
    Error,
    Skipped,
}

/// 整体执行状态 (success < partial < error)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Success,
    Partial,
    Error,
}

/// 单步执行日志
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStepLog {
    pub order_index: i32,
    pub trigger: String,
    pub status: RunStepStatus,
    pub ack_code: Option<String>,                // AA|AE|AR 或 HTTP状态码
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

/// 场景执行实例
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioRun {
    pub id: Uuid,
    pub template_key: String,
    pub endpoint_id: Uuid,
    pub protocol: Protocol,
    pub dry_run: bool,
    pub stop_on_error: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub generated_ipp: Option<String>,
    pub generated_nda: Option<String>,
    pub generated_vn: Option<String>,
    pub steps: Vec<RunStepLog>,
}

// ========== 端点 ==========

/// 端点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndpointKind {
    MllpListener,
    MllpSender,
    FileInbox,
    FileOutbox,
    FhirClient,
}

/// 传输端点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: Uuid,
    pub name: String,
    pub kind: EndpointKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub inbox_path: Option<String>,
    pub outbox_path: Option<String>,
    pub file_glob: Option<String>,
    pub base_url: Option<String>,                // FHIR客户端
    pub tls_ca_bundle: Option<String>,
    pub forced_identifier_system: Option<String>,
    pub forced_identifier_oid: Option<String>,
    pub juridical_entity_id: Option<Uuid>,
    pub receiving_application: String,
    pub receiving_facility: String,
    pub ack_timeout_seconds: u64,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, kind: EndpointKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            host: None,
            port: None,
            inbox_path: None,
            outbox_path: None,
            file_glob: None,
            base_url: None,
            tls_ca_bundle: None,
            forced_identifier_system: None,
            forced_identifier_oid: None,
            juridical_entity_id: None,
            receiving_application: "TARGET".to_string(),
            receiving_facility: "TARGET".to_string(),
            ack_timeout_seconds: 30,
        }
    }
}
