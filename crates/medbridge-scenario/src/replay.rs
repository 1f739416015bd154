//! 场景回放执行器
//!
//! 按计划时刻顺序发送各步消息, 等待ACK（MLLP）或HTTP应答（FHIR）,
//! 分级记录步骤结果与聚合状态 (success < partial < error)。取消在
//! 下一步之前生效, 剩余步骤标记skipped。单步失败不阻断后续步骤,
//! 除非配置stop-on-error。dry-run仅渲染与记录, 不发送。

use crate::materializer::{GeneratedIds, MaterializedStep};
use async_trait::async_trait;
use chrono::Utc;
use medbridge_core::models::{
    Direction, Endpoint, MessageLogEntry, MessageStatus, Protocol, RunStatus, RunStepLog,
    RunStepStatus, ScenarioRun,
};
use medbridge_core::{BridgeError, Result};
use medbridge_hl7::generator::fresh_control_id;
use medbridge_hl7::parser::Hl7Message;
use medbridge_store::Store;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// 步骤传输抽象（MLLP发送器 / FHIR客户端）
///
/// 返回分类码: "AA"|"AE"|"AR" 或HTTP状态码字符串。
#[async_trait]
pub trait StepTransport: Send + Sync {
    async fn send(&self, endpoint: &Endpoint, payload: &[u8], protocol: Protocol)
        -> Result<String>;
}

/// 回放选项
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    pub dry_run: bool,
    pub stop_on_error: bool,
}

/// 回放引擎
pub struct ReplayEngine {
    store: Arc<dyn Store>,
    transport: Arc<dyn StepTransport>,
}

impl ReplayEngine {
    pub fn new(store: Arc<dyn Store>, transport: Arc<dyn StepTransport>) -> Self {
        Self { store, transport }
    }

    /// 执行一次回放
    pub async fn run(
        &self,
        template_key: &str,
        endpoint: &Endpoint,
        steps: Vec<MaterializedStep>,
        ids: &GeneratedIds,
        options: &ReplayOptions,
        cancel: CancellationToken,
    ) -> Result<ScenarioRun> {
        let protocol = steps
            .first()
            .map(|s| s.protocol)
            .unwrap_or(Protocol::Hl7v2);
        let mut run = ScenarioRun {
            id: Uuid::new_v4(),
            template_key: template_key.to_string(),
            endpoint_id: endpoint.id,
            protocol,
            dry_run: options.dry_run,
            stop_on_error: options.stop_on_error,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            generated_ipp: Some(ids.ipp.clone()),
            generated_nda: Some(ids.nda.clone()),
            generated_vn: Some(ids.vn.clone()),
            steps: Vec::new(),
        };
        self.store.insert_run(run.clone()).await?;
        info!(run = %run.id, template_key, dry_run = options.dry_run, "场景回放开始");

        let mut aborted = false;
        for step in &steps {
            if aborted || cancel.is_cancelled() {
                run.steps.push(RunStepLog {
                    order_index: step.order_index,
                    trigger: step.trigger.clone(),
                    status: RunStepStatus::Skipped,
                    ack_code: None,
                    duration_ms: None,
                    error: if cancel.is_cancelled() {
                        Some("RUN_CANCELLED".to_string())
                    } else {
                        None
                    },
                });
                continue;
            }

            // 等到计划时刻（dry-run直接渲染）
            if !options.dry_run {
                let wait = step.scheduled_at - Utc::now();
                if wait > chrono::Duration::zero() {
                    let sleep = tokio::time::sleep(
                        wait.to_std().unwrap_or(std::time::Duration::ZERO),
                    );
                    tokio::select! {
                        _ = sleep => {}
                        _ = cancel.cancelled() => {
                            run.steps.push(RunStepLog {
                                order_index: step.order_index,
                                trigger: step.trigger.clone(),
                                status: RunStepStatus::Skipped,
                                ack_code: None,
                                duration_ms: None,
                                error: Some("RUN_CANCELLED".to_string()),
                            });
                            continue;
                        }
                    }
                }
            }

            let step_log = self.execute_step(step, endpoint, options).await;
            if step_log.status == RunStepStatus::Error && options.stop_on_error {
                aborted = true;
            }
            run.steps.push(step_log);
        }

        run.status = aggregate_status(&run.steps);
        run.finished_at = Some(Utc::now());
        self.store.update_run(run.clone()).await?;
        info!(run = %run.id, status = ?run.status, "场景回放结束");
        Ok(run)
    }

    async fn execute_step(
        &self,
        step: &MaterializedStep,
        endpoint: &Endpoint,
        options: &ReplayOptions,
    ) -> RunStepLog {
        let control_id = match step.protocol {
            Protocol::Hl7v2 => std::str::from_utf8(&step.payload)
                .ok()
                .and_then(|t| Hl7Message::parse(t).ok())
                .and_then(|m| m.control_id().map(String::from))
                .unwrap_or_else(fresh_control_id),
            Protocol::Fhir => fresh_control_id(),
        };
        let log_entry = MessageLogEntry {
            id: Uuid::new_v4(),
            control_id: control_id.clone(),
            trigger: Some(step.trigger.clone()),
            direction: Direction::Outbound,
            correlation_id: Some(control_id),
            raw: String::from_utf8_lossy(&step.payload).into_owned(),
            timestamp: Utc::now(),
            status: MessageStatus::Pending,
            diagnostics: Vec::new(),
            endpoint_id: Some(endpoint.id),
        };
        let log_id = log_entry.id;
        if let Err(e) = self.store.append_log(log_entry).await {
            warn!(error = %e, "出站日志写入失败");
        }

        if options.dry_run {
            let _ = self
                .store
                .set_log_status(log_id, MessageStatus::Success, Vec::new())
                .await;
            return RunStepLog {
                order_index: step.order_index,
                trigger: step.trigger.clone(),
                status: RunStepStatus::Success,
                ack_code: None,
                duration_ms: Some(0),
                error: None,
            };
        }

        let started = std::time::Instant::now();
        let outcome = self
            .transport
            .send(endpoint, &step.payload, step.protocol)
            .await
            .and_then(|code| classify(&code));
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(code) => {
                let _ = self
                    .store
                    .set_log_status(log_id, MessageStatus::Success, Vec::new())
                    .await;
                RunStepLog {
                    order_index: step.order_index,
                    trigger: step.trigger.clone(),
                    status: RunStepStatus::Success,
                    ack_code: Some(code),
                    duration_ms: Some(duration_ms),
                    error: None,
                }
            }
            Err(e) => {
                let _ = self
                    .store
                    .set_log_status(
                        log_id,
                        MessageStatus::Error,
                        vec![medbridge_core::models::Diagnostic::error(
                            e.diagnostic_code(),
                            e.to_string(),
                        )],
                    )
                    .await;
                warn!(step = step.order_index, error = %e, "回放步骤失败");
                RunStepLog {
                    order_index: step.order_index,
                    trigger: step.trigger.clone(),
                    status: RunStepStatus::Error,
                    ack_code: ack_code_of(&e),
                    duration_ms: Some(duration_ms),
                    error: Some(e.diagnostic_code().to_string()),
                }
            }
        }
    }
}

/// 应答分类: AA与HTTP 2xx为成功
fn classify(code: &str) -> Result<String> {
    match code {
        "AA" | "CA" => Ok("AA".to_string()),
        "AE" | "CE" => Err(BridgeError::AckRejected(code.to_string())),
        "AR" | "CR" => Err(BridgeError::AckError(code.to_string())),
        other => {
            let http_ok = other
                .parse::<u16>()
                .map(|status| (200..300).contains(&status))
                .unwrap_or(false);
            if http_ok {
                Ok(other.to_string())
            } else {
                Err(BridgeError::Http(other.to_string()))
            }
        }
    }
}

fn ack_code_of(error: &BridgeError) -> Option<String> {
    match error {
        BridgeError::AckRejected(_) => Some("AE".to_string()),
        BridgeError::AckError(_) => Some("AR".to_string()),
        BridgeError::Http(code) => Some(code.clone()),
        _ => None,
    }
}

/// 聚合状态: 全成success, 全败error, 其余partial
fn aggregate_status(steps: &[RunStepLog]) -> RunStatus {
    if steps.is_empty() {
        return RunStatus::Error;
    }
    let success = steps.iter().filter(|s| s.status == RunStepStatus::Success).count();
    if success == steps.len() {
        RunStatus::Success
    } else if success == 0 {
        RunStatus::Error
    } else {
        RunStatus::Partial
    }
}
