//! MedBridge服务器主程序
//!
//! 子命令:
//! - serve: 启动全部监听类端点（MLLP监听器/文件收件箱）
//! - ingest: 把一个文件当作指定端点收到的消息处理
//! - replay: 物化一个场景模板并回放到指定端点
//!
//! 退出码: 0成功, 1校验错误, 2传输错误, 3配置错误。

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use medbridge_core::models::{
    Endpoint, GenerationMode, IdentifierKind, IdentifierNamespace, NodeKind, StructureNode,
};
use medbridge_core::{BridgeConfig, BridgeError};
use medbridge_hl7::generator::AckCode;
use medbridge_scenario::{
    capture_dossier, compute_stats, MaterializationOptions, Materializer, ReplayEngine,
    ReplayOptions,
};
use medbridge_store::{MemoryStore, PgStore, Store, VenueLocks};
use medbridge_transport::{DefaultStepTransport, EndpointManager, InboundHandler};
use medbridge_workflow::{InboundPipeline, PipelineConfig};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

/// MedBridge命令行参数
#[derive(Parser, Debug)]
#[command(name = "medbridge-server")]
#[command(about = "MedBridge医院互操作桥 (HL7 v2.5 PAM / FHIR R4)")]
struct Args {
    /// 端点定义文件 (JSON数组)
    #[arg(short, long, default_value = "endpoints.json")]
    endpoints: String,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动全部监听类端点
    Serve,
    /// 把文件当作端点收到的消息处理
    Ingest {
        /// 端点名或UUID
        endpoint_id: String,
        /// 消息文件路径
        file: String,
    },
    /// 物化并回放场景模板
    Replay {
        /// 模板键
        template_key: String,
        /// 端点名或UUID
        endpoint_id: String,
        /// 仅渲染与记录, 不发送
        #[arg(long)]
        dry_run: bool,
        /// IPP前缀覆盖 (如 "9...")
        #[arg(long)]
        ipp_prefix: Option<String>,
        /// NDA前缀覆盖 (如 "501...")
        #[arg(long)]
        nda_prefix: Option<String>,
    },
    /// 捕获档案为场景模板
    Capture {
        /// 档案UUID
        dossier_id: Uuid,
    },
    /// 场景执行统计
    Stats {
        /// 限定模板键
        #[arg(long)]
        template_key: Option<String>,
    },
}

/// 运行时装配
struct App {
    store: Arc<dyn Store>,
    config: BridgeConfig,
    manager: EndpointManager,
    pipeline: Arc<InboundPipeline>,
}

/// 管线到传输层的入站适配
struct PipelineHandler {
    pipeline: Arc<InboundPipeline>,
}

#[async_trait]
impl InboundHandler for PipelineHandler {
    async fn handle(&self, endpoint: &Endpoint, payload: Vec<u8>) -> Vec<u8> {
        self.pipeline.process(&payload, endpoint).await.ack.into_bytes()
    }
}

/// 场景物化的默认命名空间
fn default_namespace(kind: IdentifierKind, pattern: &str) -> IdentifierNamespace {
    IdentifierNamespace {
        id: Uuid::new_v4(),
        name: format!("MEDBRIDGE-{}", kind.as_str()),
        system: format!("urn:medbridge:{}", kind.as_str().to_lowercase()),
        oid: None,
        kind,
        juridical_entity_id: None,
        mode: GenerationMode::FixedPrefix,
        prefix_pattern: Some(pattern.to_string()),
        range_min: None,
        range_max: None,
    }
}

impl App {
    async fn build(args: &Args) -> anyhow::Result<Self> {
        let config = BridgeConfig::from_env()?;

        let store: Arc<dyn Store> = match &config.database_url {
            Some(url) => {
                let pg = PgStore::connect(url, 20).await?;
                pg.create_tables().await?;
                Arc::new(pg)
            }
            None => Arc::new(MemoryStore::new()),
        };

        let manager = EndpointManager::new(
            config.mllp_max_frame_bytes,
            Duration::from_secs(config.mllp_read_timeout_seconds),
            Duration::from_secs(2),
        );
        for endpoint in load_endpoints(&args.endpoints).await? {
            ensure_juridical_entity(&store, &endpoint).await?;
            manager.register(endpoint).await;
        }

        let pipeline = Arc::new(InboundPipeline::new(
            store.clone(),
            Arc::new(VenueLocks::new()),
            PipelineConfig {
                strict_pam_fr: config.strict_pam_fr,
                auto_create_uf: config.pam_auto_create_uf,
                ..PipelineConfig::default()
            },
        ));

        Ok(Self {
            store,
            config,
            manager,
            pipeline,
        })
    }

    async fn endpoint(&self, id_or_name: &str) -> anyhow::Result<Endpoint> {
        if let Ok(id) = id_or_name.parse::<Uuid>() {
            if let Some(endpoint) = self.manager.get(id).await {
                return Ok(endpoint);
            }
        }
        self.manager
            .get_by_name(id_or_name)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown endpoint {id_or_name:?}"))
    }
}

/// 从JSON文件加载端点; 文件缺失时返回空表
async fn load_endpoints(path: &str) -> anyhow::Result<Vec<Endpoint>> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(serde_json::from_str(&text)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(%path, "端点文件不存在, 启动时无端点");
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}

/// 端点引用的法人实体缺失时补一个占位节点
async fn ensure_juridical_entity(
    store: &Arc<dyn Store>,
    endpoint: &Endpoint,
) -> anyhow::Result<()> {
    let Some(ej_id) = endpoint.juridical_entity_id else {
        return Ok(());
    };
    if store.get_node(ej_id).await?.is_none() {
        let mut node = StructureNode::new(NodeKind::JuridicalEntity, "EJ-DEFAULT", "EJ par défaut");
        node.id = ej_id;
        node.is_virtual = true;
        store.upsert_node(node).await?;
    }
    Ok(())
}

async fn run_serve(app: &App) -> anyhow::Result<ExitCode> {
    let handler: Arc<dyn InboundHandler> = Arc::new(PipelineHandler {
        pipeline: app.pipeline.clone(),
    });
    let mut started = 0;
    for endpoint in app.manager.list().await {
        use medbridge_core::models::EndpointKind::*;
        if matches!(endpoint.kind, MllpListener | FileInbox) {
            app.manager.start(endpoint.id, handler.clone()).await?;
            started += 1;
        }
    }
    info!(started, "监听类端点已启动, Ctrl-C退出");
    tokio::signal::ctrl_c().await?;
    info!("收到退出信号, 停止端点");
    for endpoint in app.manager.list().await {
        let _ = app.manager.stop(endpoint.id).await;
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_ingest(app: &App, endpoint_id: &str, file: &str) -> anyhow::Result<ExitCode> {
    let endpoint = app.endpoint(endpoint_id).await?;
    let mut payload = tokio::fs::read(file).await?;
    if payload.first() == Some(&0x0B) {
        payload.remove(0);
    }
    while matches!(payload.last(), Some(&0x0D) | Some(&0x1C)) {
        payload.pop();
    }

    let outcome = app.pipeline.process(&payload, &endpoint).await;
    println!("{}", outcome.ack.replace('\r', "\n"));
    Ok(match outcome.ack_code {
        AckCode::Aa => ExitCode::SUCCESS,
        _ => ExitCode::from(1),
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_replay(
    app: &App,
    template_key: &str,
    endpoint_id: &str,
    dry_run: bool,
    ipp_prefix: Option<String>,
    nda_prefix: Option<String>,
) -> anyhow::Result<ExitCode> {
    let endpoint = app.endpoint(endpoint_id).await?;
    let template = app
        .store
        .get_template(template_key)
        .await?
        .ok_or(BridgeError::TemplateNotFound(template_key.to_string()))?;

    let ej = match endpoint.juridical_entity_id {
        Some(id) => app
            .store
            .get_node(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("juridical entity {id} not found"))?,
        None => StructureNode::new(NodeKind::JuridicalEntity, "EJ-DEFAULT", "EJ par défaut"),
    };

    let materializer = Materializer::new(
        app.store.clone(),
        default_namespace(IdentifierKind::Ipp, "9..."),
        default_namespace(IdentifierKind::Nda, "501..."),
        default_namespace(IdentifierKind::Vn, "3....."),
        default_namespace(IdentifierKind::Mvt, "8......"),
    );
    let options = MaterializationOptions {
        protocol: template
            .protocols
            .first()
            .copied()
            .unwrap_or(medbridge_core::models::Protocol::Hl7v2),
        ipp_prefix,
        nda_prefix,
        ..MaterializationOptions::default()
    };
    let (steps, ids) = materializer
        .materialize(&template, &endpoint, &ej, &options)
        .await?;

    let transport = Arc::new(DefaultStepTransport::new(
        app.config.mllp_max_frame_bytes,
        Duration::from_secs(app.config.http_timeout_seconds),
    )?);
    let engine = ReplayEngine::new(app.store.clone(), transport);
    let run = engine
        .run(
            template_key,
            &endpoint,
            steps,
            &ids,
            &ReplayOptions {
                dry_run,
                stop_on_error: false,
            },
            CancellationToken::new(),
        )
        .await?;

    println!("run {} -> {:?}", run.id, run.status);
    for step in &run.steps {
        println!(
            "  step {} {} -> {:?}{}",
            step.order_index,
            step.trigger,
            step.status,
            step.ack_code
                .as_ref()
                .map(|c| format!(" ({c})"))
                .unwrap_or_default()
        );
    }

    let transport_failure = run.steps.iter().any(|s| {
        matches!(
            s.error.as_deref(),
            Some("CONNECTION_REFUSED") | Some("READ_TIMEOUT") | Some("HTTP_ERROR")
        )
    });
    Ok(match run.status {
        medbridge_core::models::RunStatus::Success => ExitCode::SUCCESS,
        _ if transport_failure => ExitCode::from(2),
        _ => ExitCode::from(1),
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_level.clone())
        .init();

    let app = match App::build(&args).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "启动失败");
            return ExitCode::from(3);
        }
    };

    let result = match &args.command {
        Command::Serve => run_serve(&app).await,
        Command::Ingest { endpoint_id, file } => run_ingest(&app, endpoint_id, file).await,
        Command::Replay {
            template_key,
            endpoint_id,
            dry_run,
            ipp_prefix,
            nda_prefix,
        } => {
            run_replay(
                &app,
                template_key,
                endpoint_id,
                *dry_run,
                ipp_prefix.clone(),
                nda_prefix.clone(),
            )
            .await
        }
        Command::Capture { dossier_id } => match capture_dossier(&app.store, *dossier_id, None, None).await
        {
            Ok(template) => {
                println!("captured as {}", template.key);
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => Err(e.into()),
        },
        Command::Stats { template_key } => {
            match compute_stats(&app.store, template_key.as_deref(), None).await {
                Ok(stats) => {
                    println!(
                        "runs: {} (success {}, partial {}, error {}), success rate {:.1}%",
                        stats.total_runs,
                        stats.success_runs,
                        stats.partial_runs,
                        stats.error_runs,
                        stats.success_rate * 100.0
                    );
                    for (code, count) in &stats.ack_distribution {
                        println!("  ack {code}: {count}");
                    }
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => Err(e.into()),
            }
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "命令执行失败");
            // 传输类错误退出码2, 其余按配置错误处理
            match e.downcast_ref::<BridgeError>() {
                Some(
                    BridgeError::ConnectionRefused(_)
                    | BridgeError::ReadTimeout(_)
                    | BridgeError::Network(_)
                    | BridgeError::Http(_),
                ) => ExitCode::from(2),
                Some(BridgeError::Validation(_)) => ExitCode::from(1),
                _ => ExitCode::from(3),
            }
        }
    }
}
