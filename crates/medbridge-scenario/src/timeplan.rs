//! 场景时间重排
//!
//! 锚定模式: sliding（首步=now+偏移天数）、fixed（首步=给定时间戳）、
//! none（沿用快照时间戳）。preserve_intervals保留步骤间隔, 否则全部
//! 压到锚点。可选jitter按模板配置的触发码独立作用于每一步, 之后做
//! 单调性校正（落到前一步之前的时间戳推到前一步+1秒）。

use chrono::{DateTime, Duration, Utc};
use medbridge_core::models::{ScenarioTemplate, TimeAnchorMode};
use rand::Rng;

/// 计算每一步的计划时刻
pub fn plan_times<R: Rng>(
    template: &ScenarioTemplate,
    now: DateTime<Utc>,
    rng: &mut R,
) -> Vec<DateTime<Utc>> {
    let cfg = &template.time_config;

    let anchor = match cfg.anchor {
        TimeAnchorMode::Sliding => now + Duration::days(cfg.anchor_days_offset.unwrap_or(0)),
        TimeAnchorMode::Fixed => cfg.fixed_start.unwrap_or(now),
        TimeAnchorMode::NoShift => template
            .steps
            .first()
            .and_then(|s| s.snapshot_when)
            .unwrap_or(now),
    };

    // 基准时刻
    let mut times = Vec::with_capacity(template.steps.len());
    let mut cursor = anchor;
    for (index, step) in template.steps.iter().enumerate() {
        let base = if cfg.anchor == TimeAnchorMode::NoShift {
            step.snapshot_when.unwrap_or(cursor)
        } else if !cfg.preserve_intervals {
            anchor
        } else if index == 0 {
            anchor
        } else {
            cursor + Duration::seconds(step.delay_seconds)
        };
        cursor = base;
        times.push(base);
    }

    // jitter仅作用于配置的触发码
    if let (Some(min), Some(max)) = (cfg.jitter_min_minutes, cfg.jitter_max_minutes) {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        for (step, time) in template.steps.iter().zip(times.iter_mut()) {
            if cfg.jitter_triggers.iter().any(|t| t == &step.trigger) {
                let offset = rng.gen_range(min..=max);
                *time += Duration::minutes(offset);
            }
        }
    }

    // 单调性校正
    for i in 1..times.len() {
        if times[i] < times[i - 1] {
            times[i] = times[i - 1] + Duration::seconds(1);
        }
    }
    times
}
