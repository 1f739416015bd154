//! 运行时配置
//!
//! 从环境变量加载核心配置项, 支持布尔/整数两种写法。

use crate::error::{BridgeError, Result};
use config::{Config, Environment};
use serde::Deserialize;

/// 桥接核心配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// MLLP最大帧字节数
    pub mllp_max_frame_bytes: usize,
    /// PAM FR严格模式全局开关
    pub strict_pam_fr: bool,
    /// 未知UF自动创建开关
    pub pam_auto_create_uf: bool,
    /// MFN导入时自动创建虚拟pole
    pub mfn_auto_virtual_pole: bool,
    /// MLLP读超时（秒）
    pub mllp_read_timeout_seconds: u64,
    /// HTTP超时（秒）
    pub http_timeout_seconds: u64,
    /// PostgreSQL连接串, 为空时使用内存存储
    pub database_url: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            mllp_max_frame_bytes: 1024 * 1024,
            strict_pam_fr: false,
            pam_auto_create_uf: false,
            mfn_auto_virtual_pole: false,
            mllp_read_timeout_seconds: 30,
            http_timeout_seconds: 30,
            database_url: None,
        }
    }
}

impl BridgeConfig {
    /// 从环境变量加载配置
    ///
    /// 识别: MLLP_MAX_FRAME_BYTES, STRICT_PAM_FR, PAM_AUTO_CREATE_UF,
    /// MFN_AUTO_VIRTUAL_POLE, MLLP_READ_TIMEOUT_SECONDS, HTTP_TIMEOUT_SECONDS,
    /// DATABASE_URL
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()
            .map_err(|e| BridgeError::Config(e.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|e| BridgeError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.mllp_max_frame_bytes, 1024 * 1024);
        assert!(!cfg.strict_pam_fr);
        assert!(!cfg.pam_auto_create_uf);
        assert_eq!(cfg.mllp_read_timeout_seconds, 30);
    }
}
