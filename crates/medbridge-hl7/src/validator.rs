//! IHE PAM FR消息校验
//!
//! 段级与跨段规则, 产出带严重级别的诊断列表。错误中止处理（ACK AE）,
//! 警告继续。严格模式下A08被整体拒绝, UPDATE/CANCEL缺失ZBE-6升级为错误。

use crate::parser::Hl7Message;
use crate::segments::{extract_msh, extract_pv1, extract_zbe};
use medbridge_core::models::{Diagnostic, MovementAction, Nature, Severity};
use medbridge_core::vocabulary::VocabularyRegistry;

/// 校验结果
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationOutcome {
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn errors(&self) -> Vec<&Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .collect()
    }

    fn error(&mut self, code: &str, segment: &str, field: Option<&str>, text: impl Into<String>) {
        self.diagnostics
            .push(Diagnostic::error(code, text).at(segment, field));
    }

    fn warning(&mut self, code: &str, segment: &str, field: Option<&str>, text: impl Into<String>) {
        self.diagnostics
            .push(Diagnostic::warning(code, text).at(segment, field));
    }
}

/// 受理的ADT触发码
const KNOWN_TRIGGERS: &[&str] = &[
    "A01", "A02", "A03", "A04", "A05", "A06", "A07", "A08", "A11", "A12", "A13", "A21", "A22",
    "A28", "A31", "A40",
];

/// 需要ZBE段的移动类触发码
const MOVEMENT_TRIGGERS: &[&str] = &[
    "A01", "A02", "A03", "A04", "A05", "A06", "A07", "A11", "A12", "A13", "A21", "A22",
];

/// PAM FR校验器
#[derive(Debug)]
pub struct PamValidator {
    strict: bool,
}

impl PamValidator {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// 校验一条已解析的ADT消息
    pub fn validate(&self, msg: &Hl7Message, registry: &VocabularyRegistry) -> ValidationOutcome {
        let mut out = ValidationOutcome::default();

        self.validate_msh(msg, &mut out);

        let trigger = msg.trigger().unwrap_or("").to_string();

        if !trigger.is_empty() && !KNOWN_TRIGGERS.contains(&trigger.as_str()) {
            out.error(
                "INVALID_TRIGGER",
                "MSH",
                Some("9"),
                format!("unsupported trigger event {trigger}"),
            );
            return out;
        }

        // 严格模式整体拒绝A08
        if self.strict && trigger == "A08" {
            out.error("INVALID_TRIGGER", "MSH", Some("9"), "strict PAM FR forbids A08");
            return out;
        }

        self.validate_evn(msg, &mut out);
        self.validate_pid(msg, &mut out);

        // 身份类消息无就诊/移动段
        if registry.is_identity_only(&trigger) {
            return out;
        }

        self.validate_pv1(msg, &trigger, &mut out);

        if MOVEMENT_TRIGGERS.contains(&trigger.as_str()) {
            self.validate_zbe(msg, &trigger, &mut out);
        }

        out
    }

    fn validate_msh(&self, msg: &Hl7Message, out: &mut ValidationOutcome) {
        let msh = extract_msh(msg);
        let checks = [
            (msh.sending_application.is_none(), "3", "sending application"),
            (msh.sending_facility.is_none(), "4", "sending facility"),
            (msh.receiving_application.is_none(), "5", "receiving application"),
            (msh.receiving_facility.is_none(), "6", "receiving facility"),
            (msh.timestamp.is_none(), "7", "message timestamp"),
            (msh.trigger.is_none(), "9", "message type"),
            (msh.control_id.is_none(), "10", "control id"),
        ];
        for (missing, field, label) in checks {
            if missing {
                out.error(
                    "MISSING_REQUIRED_FIELD",
                    "MSH",
                    Some(field),
                    format!("MSH-{field} ({label}) is required"),
                );
            }
        }
    }

    fn validate_evn(&self, msg: &Hl7Message, out: &mut ValidationOutcome) {
        let event_time = msg.segment("EVN").and_then(|s| s.field(2));
        if event_time.is_none() {
            out.error(
                "MISSING_REQUIRED_FIELD",
                "EVN",
                Some("2"),
                "EVN-2 (recorded date/time) is required",
            );
        }
    }

    fn validate_pid(&self, msg: &Hl7Message, out: &mut ValidationOutcome) {
        let Some(pid) = msg.segment("PID") else {
            out.error("MISSING_REQUIRED_FIELD", "PID", None, "PID segment is required");
            return;
        };
        let d = &msg.delimiters;

        if pid.field(3).is_none() {
            out.error(
                "MISSING_REQUIRED_FIELD",
                "PID",
                Some("3"),
                "PID-3 (patient identifier list) is required",
            );
        }
        match pid.field(5) {
            None => out.error(
                "MISSING_REQUIRED_FIELD",
                "PID",
                Some("5"),
                "PID-5 (patient name) is required",
            ),
            Some(_) => {
                if pid.component(5, 2, d).is_none() {
                    out.warning(
                        "PID5_GIVEN_MISSING",
                        "PID",
                        Some("5"),
                        "given name absent from PID-5",
                    );
                }
            }
        }
        if pid.field(7).is_none() {
            out.error(
                "MISSING_REQUIRED_FIELD",
                "PID",
                Some("7"),
                "PID-7 (birth date) is required",
            );
        }
        if pid.field(8).is_none() {
            out.error(
                "MISSING_REQUIRED_FIELD",
                "PID",
                Some("8"),
                "PID-8 (administrative sex) is required",
            );
        }
    }

    fn validate_pv1(&self, msg: &Hl7Message, trigger: &str, out: &mut ValidationOutcome) {
        let Some(pv1) = msg.segment("PV1") else {
            out.error("MISSING_REQUIRED_FIELD", "PV1", None, "PV1 segment is required");
            return;
        };

        if pv1.field(2).is_none() {
            out.error(
                "MISSING_REQUIRED_FIELD",
                "PV1",
                Some("2"),
                "PV1-2 (patient class) is required",
            );
        }
        if pv1.field(19).is_none() {
            out.error(
                "MISSING_REQUIRED_FIELD",
                "PV1",
                Some("19"),
                "PV1-19 (visit number) is required",
            );
        }
        // A02必须携带来源位置
        if trigger == "A02" && extract_pv1(msg).prior_location.is_none() {
            out.error(
                "MISSING_REQUIRED_FIELD",
                "PV1",
                Some("6"),
                "PV1-6 (prior location) is required on A02",
            );
        }
    }

    fn validate_zbe(&self, msg: &Hl7Message, trigger: &str, out: &mut ValidationOutcome) {
        let zbe = extract_zbe(msg);

        if zbe.movement_id.is_none() {
            out.error("ZBE1_MISSING", "ZBE", Some("1"), "ZBE-1 requires at least one movement identifier");
        }
        if zbe.movement_time.is_none() {
            out.error("ZBE2_MISSING", "ZBE", Some("2"), "ZBE-2 requires a valid timestamp");
        }
        if let Some(raw) = &zbe.action_raw {
            if MovementAction::parse(raw).is_none() {
                out.warning(
                    "ZBE4_ACTION_INVALID",
                    "ZBE",
                    Some("4"),
                    format!("unknown action {raw:?}, falling back to INSERT"),
                );
            }
        }
        match zbe.historic_raw.as_deref() {
            Some("Y") | Some("N") => {}
            _ => out.warning(
                "ZBE5_MISSING",
                "ZBE",
                Some("5"),
                "ZBE-5 historic flag absent or invalid, falling back to N",
            ),
        }
        if matches!(zbe.action(), MovementAction::Update | MovementAction::Cancel)
            && zbe.original_trigger.as_deref().unwrap_or("").is_empty()
        {
            let text = format!(
                "ZBE-6 original trigger required for {}, falling back to {trigger}",
                zbe.action().as_str()
            );
            if self.strict {
                out.error("ZBE6_REQUIRED", "ZBE", Some("6"), text);
            } else {
                out.warning("ZBE6_REQUIRED", "ZBE", Some("6"), text);
            }
        }
        match &zbe.uf_medicale {
            Some(uf) if !uf.code.is_empty() => {}
            _ => out.error(
                "ZBE7_CODE_MISSING",
                "ZBE",
                Some("7"),
                "ZBE-7 component 10 (medical functional unit code) is required",
            ),
        }
        if zbe.uf_soins.is_none() {
            out.warning("ZBE8_MISSING", "ZBE", Some("8"), "ZBE-8 care functional unit absent");
        }
        if let Some(raw) = &zbe.nature_raw {
            if Nature::parse(raw).is_none() {
                out.warning(
                    "ZBE9_INVALID",
                    "ZBE",
                    Some("9"),
                    format!("invalid nature {raw:?}, deriving from trigger"),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_core::vocabulary::VocabularyRegistry;

    const VALID_A01: &str = "MSH|^~\\&|SENDER|FAC|RECEIVER|FAC|20240115103000||ADT^A01|CTL001|P|2.5\r\
EVN|A01|20240115103000\r\
PID|1||IPP-42^^^HOSP^PI||DOE^JOHN||19800115|M||||||||||NDA-7^^^HOSP^AN\r\
PV1|1|I|CARD^101^1||||||||||||||||VN-9^^^HOSP^VN\r\
ZBE|MVT-1|20240115103000||INSERT|N||CARDIOLOGIE^^^^^^^^^UF-CARD||S\r";

    fn validate(text: &str, strict: bool) -> ValidationOutcome {
        let msg = Hl7Message::parse(text).unwrap();
        PamValidator::new(strict).validate(&msg, &VocabularyRegistry::new())
    }

    #[test]
    fn test_valid_a01_passes() {
        let out = validate(VALID_A01, false);
        assert!(!out.has_errors(), "diagnostics: {:?}", out.diagnostics);
        // ZBE-8缺失仅为警告
        assert!(out.diagnostics.iter().any(|d| d.code == "ZBE8_MISSING"));
    }

    #[test]
    fn test_missing_pid3_is_error() {
        let text = VALID_A01.replace("IPP-42^^^HOSP^PI", "");
        let out = validate(&text, false);
        assert!(out.has_errors());
        assert!(out
            .diagnostics
            .iter()
            .any(|d| d.code == "MISSING_REQUIRED_FIELD" && d.field.as_deref() == Some("3")));
    }

    #[test]
    fn test_strict_mode_rejects_a08() {
        let text = VALID_A01.replace("ADT^A01", "ADT^A08");
        let out = validate(&text, true);
        assert!(out.has_errors());
        assert!(out
            .diagnostics
            .iter()
            .any(|d| d.text == "strict PAM FR forbids A08"));

        // 非严格模式下A08可通过
        let out = validate(&text, false);
        assert!(!out.has_errors(), "diagnostics: {:?}", out.diagnostics);
    }

    #[test]
    fn test_a02_requires_prior_location() {
        let text = VALID_A01.replace("ADT^A01", "ADT^A02");
        let out = validate(&text, false);
        assert!(out
            .errors()
            .iter()
            .any(|d| d.field.as_deref() == Some("6") && d.segment.as_deref() == Some("PV1")));
    }

    #[test]
    fn test_zbe6_warning_upgrades_in_strict() {
        let text = VALID_A01
            .replace("ADT^A01", "ADT^A11")
            .replace("|INSERT|", "|CANCEL|");
        let out = validate(&text, false);
        assert!(out
            .diagnostics
            .iter()
            .any(|d| d.code == "ZBE6_REQUIRED" && d.severity == Severity::Warning));

        let out = validate(&text, true);
        assert!(out
            .diagnostics
            .iter()
            .any(|d| d.code == "ZBE6_REQUIRED" && d.severity == Severity::Error));
    }

    #[test]
    fn test_zbe7_code_missing() {
        let text = VALID_A01.replace("CARDIOLOGIE^^^^^^^^^UF-CARD", "CARDIOLOGIE");
        let out = validate(&text, false);
        assert!(out.diagnostics.iter().any(|d| d.code == "ZBE7_CODE_MISSING"));
    }

    #[test]
    fn test_invalid_action_and_nature_are_warnings() {
        let text = VALID_A01
            .replace("|INSERT|", "|WIPE|")
            .replace("^UF-CARD||S", "^UF-CARD||Z");
        let out = validate(&text, false);
        assert!(!out.has_errors(), "diagnostics: {:?}", out.diagnostics);
        assert!(out.diagnostics.iter().any(|d| d.code == "ZBE4_ACTION_INVALID"));
        assert!(out.diagnostics.iter().any(|d| d.code == "ZBE9_INVALID"));
    }

    #[test]
    fn test_unknown_trigger_rejected() {
        let text = VALID_A01.replace("ADT^A01", "ADT^A99");
        let out = validate(&text, false);
        assert!(out.diagnostics.iter().any(|d| d.code == "INVALID_TRIGGER"));
    }

    #[test]
    fn test_identity_only_skips_pv1() {
        let text = "MSH|^~\\&|S|F|R|F|20240115103000||ADT^A28|CTL9|P|2.5\r\
EVN|A28|20240115103000\r\
PID|1||IPP-42^^^HOSP^PI||DOE^JOHN||19800115|M\r";
        let out = validate(text, false);
        assert!(!out.has_errors(), "diagnostics: {:?}", out.diagnostics);
    }
}
