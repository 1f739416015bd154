//! 端点生命周期管理
//!
//! 注册/启动/停止/探测端点。监听器与轮询器作为后台任务运行,
//! 生命周期状态由每端点互斥保护, 停止经取消令牌传播。

use crate::file_poller::FilePoller;
use crate::mllp_listener::MllpListener;
use async_trait::async_trait;
use medbridge_core::models::{Endpoint, EndpointKind};
use medbridge_core::{BridgeError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// 入站消息处理器（由工作流管线实现）
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// 处理一帧载荷, 返回ACK字节
    async fn handle(&self, endpoint: &Endpoint, payload: Vec<u8>) -> Vec<u8>;
}

/// 端点运行状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointStatus {
    Stopped,
    Running,
    Error(String),
}

struct EndpointState {
    status: EndpointStatus,
    shutdown: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// 端点管理器
pub struct EndpointManager {
    endpoints: Mutex<HashMap<Uuid, Endpoint>>,
    states: Mutex<HashMap<Uuid, EndpointState>>,
    max_frame_bytes: usize,
    read_timeout: Duration,
    poll_interval: Duration,
}

impl EndpointManager {
    pub fn new(max_frame_bytes: usize, read_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            max_frame_bytes,
            read_timeout,
            poll_interval,
        }
    }

    pub async fn register(&self, endpoint: Endpoint) {
        let mut states = self.states.lock().await;
        states.insert(
            endpoint.id,
            EndpointState {
                status: EndpointStatus::Stopped,
                shutdown: None,
                task: None,
            },
        );
        self.endpoints.lock().await.insert(endpoint.id, endpoint);
    }

    pub async fn get(&self, id: Uuid) -> Option<Endpoint> {
        self.endpoints.lock().await.get(&id).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Endpoint> {
        self.endpoints
            .lock()
            .await
            .values()
            .find(|e| e.name == name)
            .cloned()
    }

    pub async fn list(&self) -> Vec<Endpoint> {
        self.endpoints.lock().await.values().cloned().collect()
    }

    pub async fn status(&self, id: Uuid) -> Option<EndpointStatus> {
        self.states.lock().await.get(&id).map(|s| s.status.clone())
    }

    /// 启动端点（监听器/轮询器派生后台任务, 其余类型置为Running）
    pub async fn start(&self, id: Uuid, handler: Arc<dyn InboundHandler>) -> Result<()> {
        let endpoint = self
            .get(id)
            .await
            .ok_or_else(|| BridgeError::NotFound(format!("endpoint {id}")))?;
        let mut states = self.states.lock().await;
        let state = states
            .get_mut(&id)
            .ok_or_else(|| BridgeError::NotFound(format!("endpoint {id}")))?;
        if state.status == EndpointStatus::Running {
            return Ok(());
        }

        let shutdown = CancellationToken::new();
        let task = match endpoint.kind {
            EndpointKind::MllpListener => {
                let listener = MllpListener::new(
                    endpoint.clone(),
                    handler,
                    self.max_frame_bytes,
                    self.read_timeout,
                );
                let token = shutdown.clone();
                let name = endpoint.name.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = listener.run(token).await {
                        warn!(endpoint = %name, error = %e, "MLLP监听器退出于错误");
                    }
                }))
            }
            EndpointKind::FileInbox => {
                let poller = FilePoller::new(endpoint.clone(), handler, self.poll_interval);
                let token = shutdown.clone();
                let name = endpoint.name.clone();
                Some(tokio::spawn(async move {
                    if let Err(e) = poller.run(token).await {
                        warn!(endpoint = %name, error = %e, "文件轮询器退出于错误");
                    }
                }))
            }
            // 发送端按需建连, 无后台任务
            EndpointKind::MllpSender | EndpointKind::FileOutbox | EndpointKind::FhirClient => None,
        };

        state.status = EndpointStatus::Running;
        state.shutdown = Some(shutdown);
        state.task = task;
        info!(endpoint = %endpoint.name, "端点已启动");
        Ok(())
    }

    /// 停止端点, 在途工作排空后关闭
    pub async fn stop(&self, id: Uuid) -> Result<()> {
        let mut states = self.states.lock().await;
        let state = states
            .get_mut(&id)
            .ok_or_else(|| BridgeError::NotFound(format!("endpoint {id}")))?;
        if let Some(shutdown) = state.shutdown.take() {
            shutdown.cancel();
        }
        if let Some(task) = state.task.take() {
            if tokio::time::timeout(Duration::from_secs(6), task).await.is_err() {
                warn!("端点停止等待超时");
            }
        }
        state.status = EndpointStatus::Stopped;
        Ok(())
    }

    /// 连通性探测
    pub async fn test(&self, id: Uuid) -> Result<()> {
        let endpoint = self
            .get(id)
            .await
            .ok_or_else(|| BridgeError::NotFound(format!("endpoint {id}")))?;
        match endpoint.kind {
            EndpointKind::MllpSender | EndpointKind::MllpListener => {
                let host = endpoint
                    .host
                    .clone()
                    .ok_or_else(|| BridgeError::Config("endpoint has no host".to_string()))?;
                let port = endpoint
                    .port
                    .ok_or_else(|| BridgeError::Config("endpoint has no port".to_string()))?;
                if endpoint.kind == EndpointKind::MllpSender {
                    tokio::time::timeout(
                        Duration::from_secs(5),
                        tokio::net::TcpStream::connect((host.as_str(), port)),
                    )
                    .await
                    .map_err(|_| BridgeError::ReadTimeout(format!("{host}:{port}")))?
                    .map_err(|e| BridgeError::ConnectionRefused(e.to_string()))?;
                }
                Ok(())
            }
            EndpointKind::FileInbox | EndpointKind::FileOutbox => {
                let path = endpoint
                    .inbox_path
                    .clone()
                    .or(endpoint.outbox_path.clone())
                    .ok_or_else(|| BridgeError::Config("endpoint has no path".to_string()))?;
                if tokio::fs::metadata(&path).await.is_ok() {
                    Ok(())
                } else {
                    Err(BridgeError::Config(format!("path {path:?} not accessible")))
                }
            }
            EndpointKind::FhirClient => {
                endpoint
                    .base_url
                    .as_ref()
                    .ok_or_else(|| BridgeError::Config("endpoint has no base_url".to_string()))?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl InboundHandler for NoopHandler {
        async fn handle(&self, _: &Endpoint, _: Vec<u8>) -> Vec<u8> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_register_and_lifecycle_of_sender() {
        let manager = EndpointManager::new(
            1024 * 1024,
            Duration::from_secs(30),
            Duration::from_secs(1),
        );
        let endpoint = Endpoint::new("target", EndpointKind::MllpSender);
        let id = endpoint.id;
        manager.register(endpoint).await;

        assert_eq!(manager.status(id).await, Some(EndpointStatus::Stopped));
        manager.start(id, Arc::new(NoopHandler)).await.unwrap();
        assert_eq!(manager.status(id).await, Some(EndpointStatus::Running));
        manager.stop(id).await.unwrap();
        assert_eq!(manager.status(id).await, Some(EndpointStatus::Stopped));
    }

    #[tokio::test]
    async fn test_listener_start_stop() {
        let manager = EndpointManager::new(
            1024 * 1024,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let mut endpoint = Endpoint::new("listener", EndpointKind::MllpListener);
        endpoint.host = Some("127.0.0.1".to_string());
        endpoint.port = Some(0); // 0 = 随机端口
        let id = endpoint.id;
        manager.register(endpoint).await;
        manager.start(id, Arc::new(NoopHandler)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.stop(id).await.unwrap();
        assert_eq!(manager.status(id).await, Some(EndpointStatus::Stopped));
    }

    #[tokio::test]
    async fn test_probe_unreachable_sender() {
        let manager = EndpointManager::new(
            1024 * 1024,
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let mut endpoint = Endpoint::new("dead", EndpointKind::MllpSender);
        endpoint.host = Some("127.0.0.1".to_string());
        endpoint.port = Some(1); // 几乎必然拒绝
        let id = endpoint.id;
        manager.register(endpoint).await;
        let err = manager.test(id).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::ConnectionRefused(_) | BridgeError::ReadTimeout(_)
        ));
    }
}
