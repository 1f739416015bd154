//! HL7段的类型化提取
//!
//! 从解析后的消息中提取MSH/EVN/PID/PD1/PV1/MRG/ZBE的业务字段。
//! 提取为宽容模式: 缺失字段返回None, 由校验器负责判定强制性。

use crate::datetime::{parse_hl7_date, parse_hl7_datetime};
use crate::parser::{Delimiters, Hl7Message};
use chrono::{DateTime, NaiveDate, Utc};
use medbridge_core::models::{
    IdentityReliability, LocationPath, MovementAction, Nature, Sex, UfRef,
};

/// CX复合标识符 (value^^^assigning-authority^type-code)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CxIdentifier {
    pub value: String,
    pub assigning_authority: Option<String>,
    pub type_code: Option<String>,
}

impl CxIdentifier {
    /// 从CX原文解析; 权威机构取组件4的首个子组件
    pub fn parse(raw: &str, delims: &Delimiters) -> Option<Self> {
        if raw.trim().is_empty() {
            return None;
        }
        let comps: Vec<&str> = raw.split(delims.component).collect();
        let value = comps.first()?.to_string();
        if value.is_empty() {
            return None;
        }
        let authority = comps
            .get(3)
            .and_then(|c| c.split(delims.subcomponent).next())
            .filter(|s| !s.is_empty())
            .map(String::from);
        let type_code = comps
            .get(4)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string());
        Some(Self {
            value,
            assigning_authority: authority,
            type_code,
        })
    }

    /// 线级编码
    pub fn hl7(&self) -> String {
        format!(
            "{}^^^{}^{}",
            self.value,
            self.assigning_authority.as_deref().unwrap_or(""),
            self.type_code.as_deref().unwrap_or("")
        )
    }
}

/// XON功能单元解析 (组件1标签, 组件10代码)
pub fn parse_xon_uf(raw: &str, delims: &Delimiters) -> Option<UfRef> {
    if raw.trim().is_empty() {
        return None;
    }
    let comps: Vec<&str> = raw.split(delims.component).collect();
    let label = comps
        .first()
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    let code = comps.get(9).filter(|s| !s.is_empty()).map(|s| s.to_string());
    match (code, label) {
        (Some(code), label) => Some(UfRef { code, label }),
        // 代码缺失时保留标签, 由校验器报ZBE7_CODE_MISSING
        (None, Some(label)) => Some(UfRef {
            code: String::new(),
            label: Some(label),
        }),
        (None, None) => None,
    }
}

/// XON线级编码 (标签^^^^^^^^^代码)
pub fn render_xon_uf(uf: &UfRef) -> String {
    format!(
        "{}^^^^^^^^^{}",
        uf.label.as_deref().unwrap_or(&uf.code),
        uf.code
    )
}

// ========== MSH ==========

/// 消息头信息
#[derive(Debug, Clone)]
pub struct MshInfo {
    pub sending_application: Option<String>,
    pub sending_facility: Option<String>,
    pub receiving_application: Option<String>,
    pub receiving_facility: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub message_code: Option<String>,
    pub trigger: Option<String>,
    pub control_id: Option<String>,
    pub processing_id: Option<String>,
    pub version: Option<String>,
}

pub fn extract_msh(msg: &Hl7Message) -> MshInfo {
    let d = &msg.delimiters;
    let seg = msg.segment("MSH");
    let get = |n: usize| -> Option<String> { seg.and_then(|s| s.field(n)).map(String::from) };
    MshInfo {
        sending_application: get(3),
        sending_facility: get(4),
        receiving_application: get(5),
        receiving_facility: get(6),
        timestamp: seg.and_then(|s| s.field(7)).and_then(parse_hl7_datetime),
        message_code: seg
            .and_then(|s| s.component(9, 1, d))
            .map(String::from),
        trigger: seg.and_then(|s| s.component(9, 2, d)).map(String::from),
        control_id: get(10),
        processing_id: get(11),
        version: get(12),
    }
}

// ========== EVN ==========

/// 事件信息 (EVN-2事件时间)
#[derive(Debug, Clone)]
pub struct EvnInfo {
    pub event_time: Option<DateTime<Utc>>,
}

pub fn extract_evn(msg: &Hl7Message) -> EvnInfo {
    EvnInfo {
        event_time: msg
            .segment("EVN")
            .and_then(|s| s.field(2))
            .and_then(parse_hl7_datetime),
    }
}

// ========== PID ==========

/// 患者身份信息
#[derive(Debug, Clone)]
pub struct PidInfo {
    pub identifiers: Vec<CxIdentifier>,          // PID-3（可重复）
    pub family: Option<String>,
    pub birth_family: Option<String>,            // XPN类型L的姓
    pub givens: Vec<String>,
    pub birth_date: Option<NaiveDate>,
    pub sex: Option<Sex>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    pub country: Option<String>,
    pub phone: Option<String>,
    pub mobile: Option<String>,
    pub marital_status: Option<String>,
    pub account_number: Option<CxIdentifier>,    // PID-18 (NDA)
    pub birth_place: Option<String>,             // PID-23
    pub reliability: Option<IdentityReliability>, // PID-32
}

pub fn extract_pid(msg: &Hl7Message) -> PidInfo {
    let d = &msg.delimiters;
    let seg = msg.segment("PID");

    let identifiers = seg
        .map(|s| {
            s.repetitions(3, d)
                .into_iter()
                .filter_map(|cx| CxIdentifier::parse(cx, d))
                .collect()
        })
        .unwrap_or_default();

    // PID-5可重复: 首个为常用姓名, 类型L的重复为出生姓
    let mut family = None;
    let mut birth_family = None;
    let mut givens = Vec::new();
    if let Some(s) = seg {
        for (i, rep) in s.repetitions(5, d).into_iter().enumerate() {
            let comps: Vec<&str> = rep.split(d.component).collect();
            let fam = comps.first().filter(|c| !c.is_empty()).map(|c| c.to_string());
            if i == 0 {
                family = fam.clone();
                givens = comps
                    .iter()
                    .skip(1)
                    .take(2)
                    .filter(|c| !c.is_empty())
                    .map(|c| c.to_string())
                    .collect();
            }
            if comps.get(6).map(|t| *t == "L").unwrap_or(false) {
                birth_family = fam;
            }
        }
    }

    // PID-11首个重复: 常用地址
    let mut address = None;
    let mut city = None;
    let mut postal_code = None;
    let mut country = None;
    if let Some(raw) = seg.and_then(|s| s.field(11)) {
        if let Some(first) = raw.split(d.repetition).next() {
            let comps: Vec<&str> = first.split(d.component).collect();
            address = comps.first().filter(|c| !c.is_empty()).map(|c| c.to_string());
            city = comps.get(2).filter(|c| !c.is_empty()).map(|c| c.to_string());
            postal_code = comps.get(4).filter(|c| !c.is_empty()).map(|c| c.to_string());
            country = comps.get(5).filter(|c| !c.is_empty()).map(|c| c.to_string());
        }
    }

    // PID-13: 首个为主电话, use=CELL的重复为手机
    let mut phone = None;
    let mut mobile = None;
    if let Some(s) = seg {
        for (i, rep) in s.repetitions(13, d).into_iter().enumerate() {
            let comps: Vec<&str> = rep.split(d.component).collect();
            let number = comps.first().filter(|c| !c.is_empty()).map(|c| c.to_string());
            if i == 0 {
                phone = number.clone();
            } else if comps.get(1).map(|u| *u == "CELL").unwrap_or(false)
                || comps.get(2).map(|t| *t == "CP").unwrap_or(false)
            {
                mobile = number;
            }
        }
    }

    PidInfo {
        identifiers,
        family,
        birth_family,
        givens,
        birth_date: seg.and_then(|s| s.field(7)).and_then(parse_hl7_date),
        sex: seg.and_then(|s| s.field(8)).map(Sex::from_hl7),
        address,
        city,
        postal_code,
        country,
        phone,
        mobile,
        marital_status: seg.and_then(|s| s.field(16)).map(String::from),
        account_number: seg
            .and_then(|s| s.field(18))
            .and_then(|cx| CxIdentifier::parse(cx, d)),
        birth_place: seg.and_then(|s| s.field(23)).map(String::from),
        reliability: seg
            .and_then(|s| s.field(32))
            .and_then(IdentityReliability::parse),
    }
}

// ========== PD1 ==========

/// 补充人口学信息
#[derive(Debug, Clone)]
pub struct Pd1Info {
    pub primary_care_provider: Option<String>,
    pub language: Option<String>,
}

pub fn extract_pd1(msg: &Hl7Message) -> Pd1Info {
    let d = &msg.delimiters;
    let seg = msg.segment("PD1");
    Pd1Info {
        primary_care_provider: seg.and_then(|s| s.component(3, 1, d)).map(String::from),
        language: seg.and_then(|s| s.field(6)).map(String::from),
    }
}

// ========== PV1 ==========

/// 就诊信息
#[derive(Debug, Clone)]
pub struct Pv1Info {
    pub patient_class: Option<String>,           // PV1-2
    pub location: Option<LocationPath>,          // PV1-3
    pub prior_location: Option<LocationPath>,    // PV1-6
    pub hospital_service: Option<String>,        // PV1-10
    pub visit_number: Option<CxIdentifier>,      // PV1-19
    pub admit_time: Option<DateTime<Utc>>,       // PV1-44
    pub discharge_time: Option<DateTime<Utc>>,   // PV1-45
}

pub fn extract_pv1(msg: &Hl7Message) -> Pv1Info {
    let d = &msg.delimiters;
    let seg = msg.segment("PV1");
    Pv1Info {
        patient_class: seg.and_then(|s| s.field(2)).map(String::from),
        location: seg.and_then(|s| s.field(3)).and_then(LocationPath::parse),
        prior_location: seg.and_then(|s| s.field(6)).and_then(LocationPath::parse),
        hospital_service: seg.and_then(|s| s.field(10)).map(String::from),
        visit_number: seg
            .and_then(|s| s.field(19))
            .and_then(|cx| CxIdentifier::parse(cx, d)),
        admit_time: seg.and_then(|s| s.field(44)).and_then(parse_hl7_datetime),
        discharge_time: seg.and_then(|s| s.field(45)).and_then(parse_hl7_datetime),
    }
}

// ========== MRG ==========

/// 患者合并信息 (A40)
#[derive(Debug, Clone)]
pub struct MrgInfo {
    pub prior_identifier: Option<CxIdentifier>,  // MRG-1: 被吸收患者IPP
    pub prior_name: Option<String>,              // MRG-7
}

pub fn extract_mrg(msg: &Hl7Message) -> MrgInfo {
    let d = &msg.delimiters;
    let seg = msg.segment("MRG");
    MrgInfo {
        prior_identifier: seg
            .and_then(|s| s.field(1))
            .and_then(|cx| CxIdentifier::parse(cx, d)),
        prior_name: seg.and_then(|s| s.field(7)).map(String::from),
    }
}

// ========== ZBE ==========

/// ZBE法国扩展段信息
///
/// 原文字段保持原样以便校验器应用回退规则。
#[derive(Debug, Clone)]
pub struct ZbeInfo {
    pub present: bool,
    pub movement_id: Option<String>,             // ZBE-1首个标识符
    pub movement_time: Option<DateTime<Utc>>,    // ZBE-2
    pub action_raw: Option<String>,              // ZBE-4
    pub historic_raw: Option<String>,            // ZBE-5
    pub original_trigger: Option<String>,        // ZBE-6
    pub uf_medicale: Option<UfRef>,              // ZBE-7
    pub uf_soins: Option<UfRef>,                 // ZBE-8
    pub nature_raw: Option<String>,              // ZBE-9
}

impl ZbeInfo {
    /// 动作, 非法值回退INSERT
    pub fn action(&self) -> MovementAction {
        self.action_raw
            .as_deref()
            .and_then(MovementAction::parse)
            .unwrap_or(MovementAction::Insert)
    }

    /// 历史标记, 非法值回退N
    pub fn historic(&self) -> bool {
        self.historic_raw.as_deref() == Some("Y")
    }

    /// 显式性质（仅当合法）
    pub fn nature(&self) -> Option<Nature> {
        self.nature_raw.as_deref().and_then(Nature::parse)
    }
}

pub fn extract_zbe(msg: &Hl7Message) -> ZbeInfo {
    let d = &msg.delimiters;
    let seg = msg.segment("ZBE");
    let up = |s: &str| s.trim().to_uppercase();
    ZbeInfo {
        present: seg.is_some(),
        movement_id: seg
            .and_then(|s| s.repetitions(1, d).first().copied().map(String::from))
            .and_then(|r| {
                let v = r.split(d.component).next().unwrap_or("").to_string();
                if v.is_empty() {
                    None
                } else {
                    Some(v)
                }
            }),
        movement_time: seg.and_then(|s| s.field(2)).and_then(parse_hl7_datetime),
        action_raw: seg.and_then(|s| s.field(4)).map(up),
        historic_raw: seg.and_then(|s| s.field(5)).map(up),
        original_trigger: seg.and_then(|s| s.field(6)).map(up),
        uf_medicale: seg.and_then(|s| s.field(7)).and_then(|f| parse_xon_uf(f, d)),
        uf_soins: seg.and_then(|s| s.field(8)).and_then(|f| parse_xon_uf(f, d)),
        nature_raw: seg.and_then(|s| s.field(9)).map(up),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Hl7Message;

    const A01: &str = "MSH|^~\\&|SENDER|FAC|RECEIVER|FAC|20240115103000||ADT^A01|CTL001|P|2.5\r\
EVN|A01|20240115102500\r\
PID|1||IPP-42^^^HOSP^PI~1234567890123^^^INS&1.2.250.1.213&ISO^INS||DOE^JOHN^PAUL~DUPONT^^^^^^L||19800115|M|||3 RUE X^^LYON^^69000^FRA||0411111111~0611111111^CELL|||M||NDA-7^^^HOSP^AN|||||LYON|||||||||VALI\r\
PV1|1|I|CARD^101^1|||URG^2^1||||CARDIO|||||||||VN-9^^^HOSP^VN\r\
ZBE|MVT-1^MVTNS|20240115103000||INSERT|N||CARDIOLOGIE^^^^^^^^^UF-CARD|SOINS^^^^^^^^^UF-SOINS|S\r";

    #[test]
    fn test_extract_msh() {
        let msg = Hl7Message::parse(A01).unwrap();
        let msh = extract_msh(&msg);
        assert_eq!(msh.sending_application.as_deref(), Some("SENDER"));
        assert_eq!(msh.trigger.as_deref(), Some("A01"));
        assert_eq!(msh.control_id.as_deref(), Some("CTL001"));
        assert_eq!(msh.version.as_deref(), Some("2.5"));
    }

    #[test]
    fn test_extract_pid_identifiers() {
        let msg = Hl7Message::parse(A01).unwrap();
        let pid = extract_pid(&msg);
        assert_eq!(pid.identifiers.len(), 2);
        assert_eq!(pid.identifiers[0].value, "IPP-42");
        assert_eq!(pid.identifiers[0].assigning_authority.as_deref(), Some("HOSP"));
        assert_eq!(pid.identifiers[0].type_code.as_deref(), Some("PI"));
        assert_eq!(pid.identifiers[1].type_code.as_deref(), Some("INS"));
        assert_eq!(pid.identifiers[1].assigning_authority.as_deref(), Some("INS"));
    }

    #[test]
    fn test_extract_pid_demographics() {
        let msg = Hl7Message::parse(A01).unwrap();
        let pid = extract_pid(&msg);
        assert_eq!(pid.family.as_deref(), Some("DOE"));
        assert_eq!(pid.givens, vec!["JOHN".to_string(), "PAUL".to_string()]);
        assert_eq!(pid.birth_family.as_deref(), Some("DUPONT"));
        assert_eq!(pid.sex, Some(Sex::Male));
        assert_eq!(pid.city.as_deref(), Some("LYON"));
        assert_eq!(pid.mobile.as_deref(), Some("0611111111"));
        assert_eq!(pid.account_number.as_ref().unwrap().value, "NDA-7");
        assert_eq!(pid.birth_place.as_deref(), Some("LYON"));
        assert_eq!(pid.reliability, Some(IdentityReliability::Vali));
    }

    #[test]
    fn test_extract_pv1() {
        let msg = Hl7Message::parse(A01).unwrap();
        let pv1 = extract_pv1(&msg);
        assert_eq!(pv1.patient_class.as_deref(), Some("I"));
        assert_eq!(pv1.location.as_ref().unwrap().to_string(), "CARD/101/1");
        assert_eq!(pv1.prior_location.as_ref().unwrap().to_string(), "URG/2/1");
        assert_eq!(pv1.hospital_service.as_deref(), Some("CARDIO"));
        assert_eq!(pv1.visit_number.as_ref().unwrap().value, "VN-9");
    }

    #[test]
    fn test_extract_zbe() {
        let msg = Hl7Message::parse(A01).unwrap();
        let zbe = extract_zbe(&msg);
        assert!(zbe.present);
        assert_eq!(zbe.movement_id.as_deref(), Some("MVT-1"));
        assert_eq!(zbe.action(), MovementAction::Insert);
        assert!(!zbe.historic());
        assert_eq!(zbe.nature(), Some(Nature::S));
        let uf = zbe.uf_medicale.unwrap();
        assert_eq!(uf.code, "UF-CARD");
        assert_eq!(uf.label.as_deref(), Some("CARDIOLOGIE"));
        assert_eq!(zbe.uf_soins.unwrap().code, "UF-SOINS");
    }

    #[test]
    fn test_zbe_fallbacks() {
        let text = "MSH|^~\\&|A|B|C|D|20240101000000||ADT^A02|X|P|2.5\r\
ZBE|MVT-2|20240101010000||BOGUS|Q||UF^^^^^^^^^U1\r";
        let msg = Hl7Message::parse(text).unwrap();
        let zbe = extract_zbe(&msg);
        assert_eq!(zbe.action(), MovementAction::Insert); // 非法动作回退
        assert!(!zbe.historic()); // 非法标记回退N
        assert_eq!(zbe.nature(), None);
    }

    #[test]
    fn test_extract_mrg() {
        let text = "MSH|^~\\&|A|B|C|D|20240101000000||ADT^A40|X|P|2.5\r\
PID|1||IPP-1^^^HOSP^PI\rMRG|IPP-2^^^HOSP^PI||||||OLD^NAME\r";
        let msg = Hl7Message::parse(text).unwrap();
        let mrg = extract_mrg(&msg);
        assert_eq!(mrg.prior_identifier.unwrap().value, "IPP-2");
        assert_eq!(mrg.prior_name.as_deref(), Some("OLD^NAME"));
    }

    #[test]
    fn test_cx_render() {
        let cx = CxIdentifier {
            value: "IPP-42".into(),
            assigning_authority: Some("HOSP".into()),
            type_code: Some("PI".into()),
        };
        assert_eq!(cx.hl7(), "IPP-42^^^HOSP^PI");
    }

    #[test]
    fn test_xon_roundtrip() {
        let d = Delimiters::default();
        let uf = parse_xon_uf("CARDIOLOGIE^^^^^^^^^UF-CARD", &d).unwrap();
        assert_eq!(render_xon_uf(&uf), "CARDIOLOGIE^^^^^^^^^UF-CARD");
    }
}
