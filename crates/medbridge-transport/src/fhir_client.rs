//! FHIR HTTP客户端
//!
//! 向端点base_url POST transaction Bundle, 读取JSON应答。
//! 失败分类: 连接拒绝 / 超时 / HTTP非2xx。

use medbridge_core::models::Endpoint;
use medbridge_core::{BridgeError, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// FHIR客户端
pub struct FhirClient {
    client: reqwest::Client,
}

impl FhirClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::Config(e.to_string()))?;
        Ok(Self { client })
    }

    /// POST一个Bundle, 返回HTTP状态码
    pub async fn post_bundle(&self, endpoint: &Endpoint, bundle_json: &[u8]) -> Result<u16> {
        let base_url = endpoint
            .base_url
            .clone()
            .ok_or_else(|| BridgeError::Config(format!("endpoint {} has no base_url", endpoint.name)))?;

        let response = self
            .client
            .post(&base_url)
            .header("Content-Type", "application/fhir+json")
            .body(bundle_json.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BridgeError::ReadTimeout(base_url.clone())
                } else if e.is_connect() {
                    BridgeError::ConnectionRefused(format!("{base_url}: {e}"))
                } else {
                    BridgeError::Http(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if response.status().is_success() {
            debug!(endpoint = %endpoint.name, status, "FHIR Bundle已提交");
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(endpoint = %endpoint.name, status, "FHIR提交被拒绝");
            return Err(BridgeError::Http(format!(
                "status {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medbridge_core::models::EndpointKind;

    #[tokio::test]
    async fn test_connection_refused_classified() {
        let client = FhirClient::new(Duration::from_secs(1)).unwrap();
        let mut endpoint = Endpoint::new("fhir", EndpointKind::FhirClient);
        endpoint.base_url = Some("http://127.0.0.1:1/fhir".to_string());
        let err = client.post_bundle(&endpoint, b"{}").await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ConnectionRefused(_) | BridgeError::ReadTimeout(_) | BridgeError::Http(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_base_url_is_config_error() {
        let client = FhirClient::new(Duration::from_secs(1)).unwrap();
        let endpoint = Endpoint::new("fhir", EndpointKind::FhirClient);
        let err = client.post_bundle(&endpoint, b"{}").await.unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }
}
