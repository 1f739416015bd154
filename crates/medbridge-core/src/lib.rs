//! # MedBridge Core
//!
//! MedBridge互操作桥的核心模块, 提供规范化数据模型、错误定义、
//! 语义词汇注册表与运行时配置。

pub mod config;
pub mod error;
pub mod models;
pub mod vocabulary;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use models::*;
pub use vocabulary::VocabularyRegistry;
