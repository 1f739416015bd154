//! # MedBridge Workflow
//!
//! 患者行政工作流: 住院移动状态机与入站消息处理管线。

pub mod pipeline;
pub mod state_machine;

pub use pipeline::{InboundPipeline, PipelineConfig, PipelineOutcome};
pub use state_machine::MovementStateMachine;
