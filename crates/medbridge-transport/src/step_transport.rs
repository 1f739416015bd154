//! 回放步骤传输实现
//!
//! 把场景引擎的抽象步骤发送路由到具体传输: MLLP发送器（按端点
//! 缓存连接）、FHIR客户端、文件发件箱。返回分类码供回放引擎判定。

use crate::fhir_client::FhirClient;
use crate::file_poller::FileOutbox;
use crate::mllp_sender::MllpSender;
use async_trait::async_trait;
use medbridge_core::models::{Endpoint, EndpointKind, Protocol};
use medbridge_core::{BridgeError, Result};
use medbridge_scenario::StepTransport;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// 默认步骤传输
pub struct DefaultStepTransport {
    senders: Mutex<HashMap<Uuid, Arc<MllpSender>>>,
    fhir: FhirClient,
    max_frame_bytes: usize,
}

impl DefaultStepTransport {
    pub fn new(max_frame_bytes: usize, http_timeout: Duration) -> Result<Self> {
        Ok(Self {
            senders: Mutex::new(HashMap::new()),
            fhir: FhirClient::new(http_timeout)?,
            max_frame_bytes,
        })
    }

    async fn sender_for(&self, endpoint: &Endpoint) -> Arc<MllpSender> {
        let mut senders = self.senders.lock().await;
        senders
            .entry(endpoint.id)
            .or_insert_with(|| {
                Arc::new(MllpSender::new(endpoint.clone(), self.max_frame_bytes))
            })
            .clone()
    }
}

#[async_trait]
impl StepTransport for DefaultStepTransport {
    async fn send(
        &self,
        endpoint: &Endpoint,
        payload: &[u8],
        protocol: Protocol,
    ) -> Result<String> {
        match (endpoint.kind, protocol) {
            (EndpointKind::MllpSender, Protocol::Hl7v2) => {
                let sender = self.sender_for(endpoint).await;
                let ack = sender.send(payload).await?;
                Ok(ack.code.as_str().to_string())
            }
            (EndpointKind::FhirClient, Protocol::Fhir) => {
                let status = self.fhir.post_bundle(endpoint, payload).await?;
                Ok(status.to_string())
            }
            (EndpointKind::FileOutbox, _) => {
                FileOutbox::new(endpoint.clone()).write_message(payload).await?;
                // 文件无应答语义, 写入即成功
                Ok("AA".to_string())
            }
            (kind, protocol) => Err(BridgeError::Config(format!(
                "endpoint kind {kind:?} cannot carry protocol {}",
                protocol.as_str()
            ))),
        }
    }
}
