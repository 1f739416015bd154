//! 语义词汇与映射注册表
//!
//! 语义事件码 ↔ 线级触发码的双向映射, 以及触发码→ZBE-9性质的默认表。
//! 进程启动时初始化一次, 之后只读。

use crate::models::{MessageRole, Nature};
use std::collections::HashMap;

/// 语义事件条目
#[derive(Debug, Clone)]
pub struct SemanticEvent {
    pub semantic_code: &'static str,
    pub trigger: &'static str,
    pub role: MessageRole,
    pub default_nature: Option<Nature>,
}

/// 词汇注册表
#[derive(Debug)]
pub struct VocabularyRegistry {
    by_semantic: HashMap<&'static str, SemanticEvent>,
    by_trigger: HashMap<&'static str, SemanticEvent>,
}

impl VocabularyRegistry {
    /// 创建并填充注册表
    pub fn new() -> Self {
        let entries = [
            ("PRE_ADMISSION", "A05", MessageRole::Admission, Some(Nature::S)),
            ("ADMISSION_CONFIRMED", "A01", MessageRole::Admission, Some(Nature::S)),
            ("OUTPATIENT_ADMISSION", "A04", MessageRole::Admission, Some(Nature::S)),
            ("TRANSFER", "A02", MessageRole::Transfer, Some(Nature::M)),
            ("LEAVE_START", "A21", MessageRole::Transfer, Some(Nature::L)),
            ("LEAVE_RETURN", "A22", MessageRole::Transfer, Some(Nature::L)),
            ("DISCHARGE", "A03", MessageRole::Discharge, Some(Nature::D)),
            ("CANCEL_ADMIT", "A11", MessageRole::Update, Some(Nature::S)),
            ("CANCEL_TRANSFER", "A12", MessageRole::Update, Some(Nature::M)),
            ("CANCEL_DISCHARGE", "A13", MessageRole::Update, Some(Nature::S)),
            ("DOSSIER_TYPE_CHANGE", "A06", MessageRole::Update, Some(Nature::M)),
            ("DOSSIER_TYPE_CHANGE_CANCEL", "A07", MessageRole::Update, Some(Nature::M)),
            ("DEMOGRAPHIC_UPDATE", "A08", MessageRole::Update, None),
            ("PATIENT_CREATED", "A28", MessageRole::Lifecycle, None),
            ("IDENTITY_UPDATE", "A31", MessageRole::Lifecycle, None),
            ("PATIENT_MERGE", "A40", MessageRole::Lifecycle, None),
        ];

        let mut by_semantic = HashMap::new();
        let mut by_trigger = HashMap::new();
        for (semantic_code, trigger, role, default_nature) in entries {
            let event = SemanticEvent {
                semantic_code,
                trigger,
                role,
                default_nature,
            };
            by_semantic.insert(semantic_code, event.clone());
            by_trigger.insert(trigger, event);
        }

        Self {
            by_semantic,
            by_trigger,
        }
    }

    /// 语义码 → (触发码, 角色)
    pub fn by_semantic(&self, semantic_code: &str) -> Option<&SemanticEvent> {
        self.by_semantic.get(semantic_code)
    }

    /// 触发码 → (语义码, 默认性质)
    pub fn by_trigger(&self, trigger: &str) -> Option<&SemanticEvent> {
        self.by_trigger.get(trigger)
    }

    /// 触发码的默认性质
    pub fn default_nature(&self, trigger: &str) -> Option<Nature> {
        self.by_trigger.get(trigger).and_then(|e| e.default_nature)
    }

    /// 有效性质: 显式值合法则保留, 否则按触发码派生
    pub fn effective_nature(&self, trigger: &str, explicit: Option<Nature>) -> Option<Nature> {
        explicit.or_else(|| self.default_nature(trigger))
    }

    /// 是否为身份类触发（不影响venue工作流）
    pub fn is_identity_only(&self, trigger: &str) -> bool {
        matches!(trigger, "A28" | "A31" | "A40")
    }
}

impl Default for VocabularyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
