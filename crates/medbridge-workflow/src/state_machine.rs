//! 住院移动状态机
//!
//! 以数据表（当前状态 × 触发码 → 新状态）管理住院运营状态转换,
//! CANCEL类触发另有针对移动历史的前置守卫。状态逻辑集中于此,
//! 不散落在消息处理器中。

use medbridge_core::models::{Movement, VenueStatus};
use medbridge_core::{BridgeError, Result};
use std::collections::HashMap;

/// 状态键: None = 尚无venue
type StateKey = (Option<VenueStatus>, &'static str);

/// 移动状态机
#[derive(Debug)]
pub struct MovementStateMachine {
    transitions: HashMap<StateKey, VenueStatus>,
}

impl MovementStateMachine {
    /// 创建状态机并装载转换规则
    pub fn new() -> Self {
        use VenueStatus::*;
        let mut transitions = HashMap::new();

        // 预住院
        transitions.insert((None, "A05"), PreAdmitted);
        transitions.insert((Some(PreAdmitted), "A05"), PreAdmitted);
        // 入院（含门诊A04）
        transitions.insert((None, "A01"), Active);
        transitions.insert((Some(PreAdmitted), "A01"), Active);
        transitions.insert((None, "A04"), Active);
        transitions.insert((Some(PreAdmitted), "A04"), Active);
        // 转科
        transitions.insert((Some(Active), "A02"), Active);
        // 出院
        transitions.insert((Some(Active), "A03"), Discharged);
        transitions.insert((Some(OnLeave), "A03"), Discharged);
        // 请假外出/返回
        transitions.insert((Some(Active), "A21"), OnLeave);
        transitions.insert((Some(OnLeave), "A22"), Active);
        // 取消类
        transitions.insert((Some(Active), "A11"), Cancelled);
        transitions.insert((Some(Active), "A12"), Active);
        transitions.insert((Some(Discharged), "A13"), Active);
        // 档案类型变更
        transitions.insert((Some(Active), "A06"), Active);
        transitions.insert((Some(Active), "A07"), Active);
        // 人口学更新: 任意状态保持不变
        for status in [PreAdmitted, Active, OnLeave, Discharged] {
            transitions.insert((Some(status), "A08"), status);
        }

        Self { transitions }
    }

    /// 检查转换是否有效
    pub fn can_transition(&self, from: Option<VenueStatus>, trigger: &str) -> bool {
        self.lookup(from, trigger).is_some()
    }

    /// 执行状态转换
    pub fn transition(&self, from: Option<VenueStatus>, trigger: &str) -> Result<VenueStatus> {
        self.lookup(from, trigger).ok_or_else(|| {
            BridgeError::InvalidTransition {
                from: from.map(|s| s.as_str().to_string()).unwrap_or_else(|| "NONE".to_string()),
                trigger: trigger.to_string(),
                reason: "no transition defined for this status".to_string(),
            }
        })
    }

    fn lookup(&self, from: Option<VenueStatus>, trigger: &str) -> Option<VenueStatus> {
        self.transitions
            .iter()
            .find(|((state, t), _)| *state == from && *t == trigger)
            .map(|(_, to)| *to)
    }

    /// 当前状态下可接受的触发码
    pub fn possible_triggers(&self, from: Option<VenueStatus>) -> Vec<&'static str> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == from)
            .map(|(_, trigger)| *trigger)
            .collect()
    }
}

impl Default for MovementStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// CANCEL类触发的历史守卫: 最后一个未取消移动必须匹配期望触发码
pub fn cancel_target<'a>(
    movements: &'a [Movement],
    trigger: &str,
    expected_original: &str,
) -> Result<&'a Movement> {
    let last = movements
        .iter()
        .rev()
        .find(|m| !m.cancelled)
        .ok_or_else(|| BridgeError::InvalidTransition {
            from: "NONE".to_string(),
            trigger: trigger.to_string(),
            reason: "no active movement to cancel".to_string(),
        })?;
    if last.trigger != expected_original {
        return Err(BridgeError::InvalidTransition {
            from: last.trigger.clone(),
            trigger: trigger.to_string(),
            reason: format!(
                "last non-cancelled movement is {} (expected {expected_original})",
                last.trigger
            ),
        });
    }
    Ok(last)
}
