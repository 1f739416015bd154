//! # MedBridge Scenario
//!
//! 场景模板引擎: 从真实档案捕获语义事件序列为可复用模板, 按协议与
//! 上下文物化为线级消息, 经时间重排后定时回放到任意下游端点,
//! 并从执行日志聚合统计。

pub mod capture;
pub mod import;
pub mod materializer;
pub mod replay;
pub mod stats;
pub mod timeplan;

pub use capture::capture_dossier;
pub use import::{export_template, import_template};
pub use materializer::{GeneratedIds, MaterializationOptions, MaterializedStep, Materializer};
pub use replay::{ReplayEngine, ReplayOptions, StepTransport};
pub use stats::{compute_stats, ScenarioStats};
pub use timeplan::plan_times;
