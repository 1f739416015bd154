//! 错误定义模块

use thiserror::Error;

/// MedBridge系统统一错误类型
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("配置错误: {0}")]
    Config(String),

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("MLLP帧错误: {0}")]
    Framing(String),

    #[error("MSH段无效: {0}")]
    InvalidMsh(String),

    #[error("HL7解析错误: {0}")]
    Parse(String),

    #[error("校验错误: {0}")]
    Validation(String),

    #[error("功能单元未知: {0}")]
    UfUnknown(String),

    #[error("患者未找到: {0}")]
    PatientNotFound(String),

    #[error("住院venue未找到: {0}")]
    VenueNotFound(String),

    #[error("结构定位不唯一: {0}")]
    StructureAmbiguity(String),

    #[error("无效状态转换: 从 {from} 经 {trigger} ({reason})")]
    InvalidTransition {
        from: String,
        trigger: String,
        reason: String,
    },

    #[error("消息控制ID重复: {0}")]
    DuplicateControlId(String),

    #[error("并发修改冲突: {0}")]
    ConcurrentModification(String),

    #[error("标识符冲突: {0}")]
    IdentifierCollision(String),

    #[error("标识符池耗尽: {0}")]
    IdentifierPoolExhausted(String),

    #[error("INS格式无效: {0}")]
    InsFormatInvalid(String),

    #[error("网络错误: {0}")]
    Network(#[from] std::io::Error),

    #[error("连接被拒绝: {0}")]
    ConnectionRefused(String),

    #[error("读取超时: {0}")]
    ReadTimeout(String),

    #[error("ACK被拒绝 (AE): {0}")]
    AckRejected(String),

    #[error("ACK错误 (AR): {0}")]
    AckError(String),

    #[error("HTTP错误: {0}")]
    Http(String),

    #[error("场景模板未找到: {0}")]
    TemplateNotFound(String),

    #[error("档案无任何移动, 无法捕获: {0}")]
    CaptureEmptyDossier(String),

    #[error("场景执行已取消: {0}")]
    RunCancelled(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl BridgeError {
    /// 对应线级诊断代码 (ERR段 / 日志)
    pub fn diagnostic_code(&self) -> &'static str {
        match self {
            BridgeError::Config(_) => "CONFIG_ERROR",
            BridgeError::Database(_) => "DATABASE_ERROR",
            BridgeError::Framing(_) => "FRAMING_ERROR",
            BridgeError::InvalidMsh(_) => "INVALID_MSH",
            BridgeError::Parse(_) => "FRAMING_ERROR",
            BridgeError::Validation(_) => "MISSING_REQUIRED_FIELD",
            BridgeError::UfUnknown(_) => "UF_UNKNOWN",
            BridgeError::PatientNotFound(_) => "PATIENT_NOT_FOUND",
            BridgeError::VenueNotFound(_) => "VENUE_NOT_FOUND",
            BridgeError::StructureAmbiguity(_) => "STRUCTURE_AMBIGUITY",
            BridgeError::InvalidTransition { .. } => "INVALID_TRANSITION",
            BridgeError::DuplicateControlId(_) => "DUPLICATE_CONTROL_ID",
            BridgeError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            BridgeError::IdentifierCollision(_) => "IDENTIFIER_COLLISION",
            BridgeError::IdentifierPoolExhausted(_) => "IDENTIFIER_POOL_EXHAUSTED",
            BridgeError::InsFormatInvalid(_) => "INS_FORMAT_INVALID",
            BridgeError::Network(_) => "CONNECTION_REFUSED",
            BridgeError::ConnectionRefused(_) => "CONNECTION_REFUSED",
            BridgeError::ReadTimeout(_) => "READ_TIMEOUT",
            BridgeError::AckRejected(_) => "ACK_REJECTED",
            BridgeError::AckError(_) => "ACK_ERROR",
            BridgeError::Http(_) => "HTTP_ERROR",
            BridgeError::TemplateNotFound(_) => "TEMPLATE_NOT_FOUND",
            BridgeError::CaptureEmptyDossier(_) => "CAPTURE_EMPTY_DOSSIER",
            BridgeError::RunCancelled(_) => "RUN_CANCELLED",
            BridgeError::Serialization(_) => "SERIALIZATION_ERROR",
            BridgeError::NotFound(_) => "NOT_FOUND",
            BridgeError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// MedBridge系统统一结果类型
pub type Result<T> = std::result::Result<T, BridgeError>;
