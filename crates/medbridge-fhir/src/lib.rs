//! # MedBridge FHIR
//!
//! FHIR R4 JSON线级支持:
//! - Bundle解析/序列化（未知元素往返保留）
//! - 规范化实体 → transaction Bundle映射
//!   (Patient + Organization + Location + Encounter + Practitioner)

pub mod bundle;
pub mod export;

pub use bundle::FhirBundle;
pub use export::{build_transaction_bundle, BundleRequest, FhirIdentifier};
