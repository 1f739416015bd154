//! # MedBridge Identifiers
//!
//! 标识符命名空间服务: 按可配置前缀模式或数值区间分配IPP/NDA/VN/MVT,
//! 冲突检测重试, 分配与唯一性检查在(命名空间,类型)锁下原子完成。
//! INS值从不生成, 仅从线上接受或拒绝。

pub mod allocator;

pub use allocator::{
    accept_ins, AllocatedIdentifier, DigitSource, IdentifierAllocator, RandomDigits,
    SequenceDigits,
};
