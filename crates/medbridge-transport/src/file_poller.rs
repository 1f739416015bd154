//! 文件收件箱轮询与发件箱
//!
//! 轮询器按间隔扫描收件目录的匹配文件, 每个文件恰好处理一次
//! （处理后重命名为.processed）。发件箱将出站消息写为独立文件。

use crate::endpoint::InboundHandler;
use medbridge_core::models::Endpoint;
use medbridge_core::{BridgeError, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 文件收件箱轮询器
pub struct FilePoller {
    endpoint: Endpoint,
    handler: Arc<dyn InboundHandler>,
    interval: Duration,
}

impl FilePoller {
    pub fn new(endpoint: Endpoint, handler: Arc<dyn InboundHandler>, interval: Duration) -> Self {
        Self {
            endpoint,
            handler,
            interval,
        }
    }

    /// 轮询主循环
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(endpoint = %self.endpoint.name, "文件轮询器启动");
        loop {
            if let Err(e) = self.scan_once().await {
                warn!(error = %e, "收件箱扫描失败");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        Ok(())
    }

    /// 扫描一轮, 返回处理的文件数
    pub async fn scan_once(&self) -> Result<usize> {
        let inbox = self
            .endpoint
            .inbox_path
            .clone()
            .ok_or_else(|| BridgeError::Config(format!("endpoint {} has no inbox", self.endpoint.name)))?;
        let pattern = format!(
            "{}/{}",
            inbox.trim_end_matches('/'),
            self.endpoint.file_glob.as_deref().unwrap_or("*.hl7")
        );

        let paths: Vec<_> = glob::glob(&pattern)
            .map_err(|e| BridgeError::Config(format!("invalid glob {pattern:?}: {e}")))?
            .filter_map(|entry| entry.ok())
            .filter(|path| {
                path.extension().map(|ext| ext != "processed").unwrap_or(true)
            })
            .collect();

        let mut processed = 0;
        for path in paths {
            match self.process_file(&path).await {
                Ok(()) => processed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "文件处理失败"),
            }
        }
        if processed > 0 {
            debug!(processed, "收件箱处理完成");
        }
        Ok(processed)
    }

    async fn process_file(&self, path: &Path) -> Result<()> {
        let mut payload = tokio::fs::read(path).await?;
        // 允许文件内带MLLP帧字节
        if payload.first() == Some(&0x0B) {
            payload.remove(0);
        }
        while matches!(payload.last(), Some(&0x0D) | Some(&0x1C)) {
            payload.pop();
        }

        let _ack = self.handler.handle(&self.endpoint, payload).await;

        // 恰好一次: 处理后改名
        let processed_path = path.with_extension(format!(
            "{}.processed",
            path.extension().and_then(|e| e.to_str()).unwrap_or("hl7")
        ));
        tokio::fs::rename(path, &processed_path).await?;
        debug!(path = %path.display(), "文件已处理并归档");
        Ok(())
    }
}

/// 文件发件箱
pub struct FileOutbox {
    endpoint: Endpoint,
}

impl FileOutbox {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// 写出一条消息, 返回文件路径
    pub async fn write_message(&self, payload: &[u8]) -> Result<String> {
        let outbox = self
            .endpoint
            .outbox_path
            .clone()
            .ok_or_else(|| BridgeError::Config(format!("endpoint {} has no outbox", self.endpoint.name)))?;
        tokio::fs::create_dir_all(&outbox).await?;
        let file_path = format!(
            "{}/msg-{}.hl7",
            outbox.trim_end_matches('/'),
            Uuid::new_v4().simple()
        );
        tokio::fs::write(&file_path, payload).await?;
        Ok(file_path)
    }
}
