//! # MedBridge Structure
//!
//! 组织结构解析: 按代码查找结构树节点, 未知功能单元按策略自动创建
//! 虚拟占位链, MFN^M05权威导入幂等替换虚拟节点。

pub mod mfn;
pub mod resolver;

pub use mfn::{import_mfn, MfnImportReport};
pub use resolver::StructureResolver;
