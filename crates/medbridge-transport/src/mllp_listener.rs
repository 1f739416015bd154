//! MLLP监听器
//!
//! 绑定端口后的accept循环为每个连接派生一个专属worker, 连接内
//! 消息严格按接收顺序处理、ACK按同序回送（按序是契约, 不共享
//! worker池）。停止时在限期内排空在途连接再关闭。

use crate::endpoint::InboundHandler;
use futures::{SinkExt, StreamExt};
use medbridge_core::models::{Diagnostic, Endpoint};
use medbridge_core::{BridgeError, Result};
use medbridge_hl7::generator::{build_ack, fresh_control_id, AckCode};
use medbridge_hl7::MllpCodec;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 停止时的在途连接排空限期
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// MLLP监听器
pub struct MllpListener {
    endpoint: Endpoint,
    handler: Arc<dyn InboundHandler>,
    max_frame_bytes: usize,
    read_timeout: Duration,
}

impl MllpListener {
    pub fn new(
        endpoint: Endpoint,
        handler: Arc<dyn InboundHandler>,
        max_frame_bytes: usize,
        read_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            handler,
            max_frame_bytes,
            read_timeout,
        }
    }

    /// 监听主循环, 取消后排空在途连接
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let host = self.endpoint.host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
        let port = self
            .endpoint
            .port
            .ok_or_else(|| BridgeError::Config(format!("endpoint {} has no port", self.endpoint.name)))?;
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| BridgeError::Config(format!("invalid listen address: {e}")))?;
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(endpoint = %self.endpoint.name, %addr, "MLLP监听器启动");

        let mut workers = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, remote)) => {
                            debug!(%remote, "接受MLLP连接");
                            let endpoint = self.endpoint.clone();
                            let handler = self.handler.clone();
                            let codec = MllpCodec::with_max_frame(self.max_frame_bytes);
                            let read_timeout = self.read_timeout;
                            workers.spawn(async move {
                                if let Err(e) =
                                    handle_connection(stream, endpoint, handler, codec, read_timeout).await
                                {
                                    warn!(%remote, error = %e, "MLLP连接处理结束于错误");
                                }
                            });
                        }
                        Err(e) => error!(error = %e, "接受连接失败"),
                    }
                }
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
            }
        }

        // 排空在途连接
        info!(endpoint = %self.endpoint.name, "MLLP监听器停止, 排空在途连接");
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("排空超时, 中止剩余连接");
            workers.abort_all();
        }
        Ok(())
    }
}

/// 单连接worker: 串行处理该连接的每一帧
async fn handle_connection(
    stream: TcpStream,
    endpoint: Endpoint,
    handler: Arc<dyn InboundHandler>,
    codec: MllpCodec,
    read_timeout: Duration,
) -> Result<()> {
    let mut framed = Framed::new(stream, codec);
    loop {
        let frame = match tokio::time::timeout(read_timeout, framed.next()).await {
            Err(_) => {
                debug!("MLLP读超时, 关闭连接");
                break;
            }
            Ok(None) => break,
            Ok(Some(frame)) => frame,
        };
        match frame {
            Ok(payload) => {
                let ack = handler.handle(&endpoint, payload).await;
                framed.send(ack).await?;
            }
            Err(e) => {
                // 帧错误: 回AE后关闭（流已不可靠）
                warn!(error = %e, "MLLP帧错误");
                let diag = Diagnostic::error("FRAMING_ERROR", e.to_string());
                let ack = build_ack(
                    AckCode::Ae,
                    &fresh_control_id(),
                    "framing error",
                    &[diag],
                    "MedBridge",
                    "MEDBRIDGE",
                );
                framed.send(ack.into_bytes()).await?;
                break;
            }
        }
    }
    Ok(())
}
