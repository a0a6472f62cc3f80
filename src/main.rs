//! Jotlin 命令行客户端
//!
//! 发送一条消息并实时打印回复；带 `--generate` 时同时驱动需求文档生成与创建。
//! `follow` 子命令跳过流，直接轮询已提交的任务。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use jotlin_stream::client::{ChatStreamClient, GenerationSession, SessionReport};
use jotlin_stream::config::{load_config, AppConfig};
use jotlin_stream::core::{
    CreationOrchestrator, GenerationMachine, GenerationPhase, LoggingObserver, MachineConfig,
    ShutdownManager,
};
use jotlin_stream::documents::HttpDocumentCreator;
use jotlin_stream::observability;
use jotlin_stream::requirements::{HttpRequirementClient, JobPoller, PollerConfig};

#[derive(Parser, Debug)]
#[command(name = "jotlin")]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// 聊天 id
    chat_id: Option<String>,

    /// 要发送的消息
    message: Option<String>,

    /// 同时生成需求文档
    #[arg(short, long)]
    generate: bool,

    /// 额外的配置文件
    #[arg(short, long, global = true, env = "JOTLIN_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 轮询已提交的任务并创建文档（不经流）
    Follow { chat_id: String, task_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.clone()).context("Failed to load configuration")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let machine = GenerationMachine::new(
        MachineConfig::from(&cfg.generation),
        Arc::new(LoggingObserver),
    );
    let creator = HttpDocumentCreator::from_config(&cfg.documents);
    let orchestrator = Arc::new(CreationOrchestrator::from_config(
        Arc::new(creator),
        &cfg.generation,
    ));

    let report = match cli.command {
        Some(Command::Follow { chat_id, task_id }) => {
            let session = GenerationSession::new(machine, orchestrator);
            follow(&cfg, &session, &chat_id, &task_id, &shutdown).await?
        }
        None => {
            let chat_id = cli.chat_id.context("chat id is required")?;
            let message = cli.message.context("message is required")?;
            let (tx, rx) = mpsc::unbounded_channel();
            let session = GenerationSession::new(machine, orchestrator).with_display_sink(tx);
            let printer = tokio::spawn(print_lines(rx));
            let report = tokio::select! {
                report = stream_chat(&cfg, &session, &chat_id, &message, cli.generate) => report,
                _ = shutdown.wait_for_shutdown() => Err(anyhow::anyhow!("Interrupted")),
            };
            drop(session);
            let _ = printer.await;
            report?
        }
    };

    print_outcome(&report);
    Ok(())
}

async fn stream_chat(
    cfg: &AppConfig,
    session: &GenerationSession,
    chat_id: &str,
    message: &str,
    generate: bool,
) -> anyhow::Result<SessionReport> {
    let client = ChatStreamClient::new(&cfg.client.server_url);
    tracing::info!(url = %client.stream_url(chat_id), generate, "Opening chat stream");
    let reader = client
        .open(chat_id, message, generate)
        .await
        .context("Failed to open chat stream")?;
    let report = session
        .consume(reader)
        .await
        .context("Chat stream failed")?;
    Ok(report)
}

async fn follow(
    cfg: &AppConfig,
    session: &GenerationSession,
    chat_id: &str,
    task_id: &str,
    shutdown: &ShutdownManager,
) -> anyhow::Result<SessionReport> {
    let client = HttpRequirementClient::new(
        cfg.requirements.base_url.as_deref(),
        Duration::from_secs(cfg.requirements.request_timeout_secs),
    );
    let poller = JobPoller::new(Arc::new(client), PollerConfig::from(&cfg.requirements));
    let report = session
        .follow_task(&poller, chat_id, task_id, &shutdown.token())
        .await
        .with_context(|| format!("Requirement task {} did not complete", task_id))?;
    Ok(report)
}

async fn print_lines(mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = rx.recv().await {
        println!("{}", line);
    }
}

fn print_outcome(report: &SessionReport) {
    let state = &report.final_state;
    match state.phase {
        GenerationPhase::Idle => {}
        GenerationPhase::Completed => {
            if let Some(creation) = &report.creation {
                println!(
                    "\nCreated {}/{} documents",
                    creation.created, creation.total
                );
            }
        }
        GenerationPhase::Failed => {
            eprintln!(
                "\nDocument generation failed: {}",
                state.error.as_deref().unwrap_or("unknown error")
            );
        }
        phase => println!("\nGeneration ended in phase {:?}", phase),
    }
    if report.malformed > 0 {
        tracing::warn!(malformed = report.malformed, "Some control signals could not be parsed");
    }
}
