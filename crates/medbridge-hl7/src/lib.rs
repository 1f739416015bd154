//! # MedBridge HL7
//!
//! HL7 v2.5线级协议模块, 支持:
//! - MLLP帧编解码 (0x0B ... 0x1C 0x0D)
//! - HL7 v2消息解析/序列化（保留未知段与字段序）
//! - PID/PV1/ZBE/MRG等段的类型化提取
//! - IHE PAM FR校验（含ZBE法国扩展规则）
//! - 出站ADT消息与ACK生成

pub mod datetime;
pub mod generator;
pub mod mllp;
pub mod parser;
pub mod segments;
pub mod validator;

pub use generator::{build_ack, parse_ack, AckCode, AckInfo, AdtGenerator, CxSource, GenerateRequest};
pub use mllp::MllpCodec;
pub use parser::{decode_payload, Delimiters, Hl7Message, Hl7Segment};
pub use validator::{PamValidator, ValidationOutcome};
