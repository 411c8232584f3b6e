//! Meeple - 对话编排核心命令行驱动
//!
//! 入口：初始化日志、加载配置、组装执行器 / 线程映射 / Agent 轮次客户端 / 语音管线，然后逐行读取标准输入：
//! - 普通文本：在会话 "cli" 上跑一轮文本对话
//! - `:voice <path>`：把音频文件送入语音管线，回复音频写到同目录
//! - `:reset`：结束会话（删除线程映射）
//! - `:quit`：退出
//!
//! 参数：`--mock` 强制使用 mock 运行时与语音后端；`--config <path>` 追加配置文件。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use bytes::Bytes;
use meeple::agent::{
    AgentRuntime, AgentTurnClient, HttpAgentRuntime, MockAgentRuntime, TurnOutcome, TurnSettings,
};
use meeple::config::{load_config, AppConfig};
use meeple::core::ResilientExecutor;
use meeple::pipeline::{AudioPipeline, AudioRequest};
use meeple::speech::{AudioFormat, HttpSpeechBackend, MockSpeechBackend, SpeechBackend};
use meeple::store::create_thread_store;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

const CONVERSATION_ID: &str = "cli";

struct CliArgs {
    mock: bool,
    config_path: Option<PathBuf>,
}

fn parse_args() -> anyhow::Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let mut parsed = CliArgs {
        mock: false,
        config_path: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--mock" => parsed.mock = true,
            "--config" => {
                let path = args.next().context("--config requires a path")?;
                parsed.config_path = Some(PathBuf::from(path));
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(parsed)
}

fn build_runtime(cfg: &AppConfig, mock: bool) -> anyhow::Result<Arc<dyn AgentRuntime>> {
    if !mock {
        if let Some(runtime) = HttpAgentRuntime::from_config(&cfg.agent) {
            let runtime = runtime
                .with_connect_timeout(Duration::from_secs(10))
                .context("Failed to build agent HTTP client")?;
            tracing::info!("Using agent runtime at {:?}", cfg.agent.base_url);
            return Ok(Arc::new(runtime));
        }
    }
    tracing::info!("Using mock agent runtime");
    Ok(Arc::new(MockAgentRuntime::new()))
}

fn build_speech(cfg: &AppConfig, mock: bool) -> anyhow::Result<Arc<dyn SpeechBackend>> {
    if !mock {
        if let Some(backend) =
            HttpSpeechBackend::from_config(&cfg.speech).context("Failed to build speech client")?
        {
            return Ok(Arc::new(backend));
        }
    }
    tracing::info!("Using mock speech backend");
    Ok(Arc::new(MockSpeechBackend::new()))
}

async fn text_turn(turns: &AgentTurnClient, line: &str, cancel: &CancellationToken) {
    match turns.run_turn_cancellable(CONVERSATION_ID, line, cancel).await {
        Ok(TurnOutcome::Reply(reply)) => println!("{}", reply.text),
        Ok(TurnOutcome::EmptyResponse { .. }) => println!("(the assistant had nothing to say)"),
        Err(e) => {
            let hint = if e.is_retryable() { ", try again" } else { "" };
            println!("(turn failed: {}{hint})", e.kind());
        }
    }
}

async fn voice_turn(pipeline: &AudioPipeline, path: &Path) -> anyhow::Result<()> {
    let format = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(AudioFormat::from_extension)
        .with_context(|| format!("unsupported audio file: {}", path.display()))?;
    let audio = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let request = AudioRequest::new(CONVERSATION_ID, Bytes::from(audio), format);
    match pipeline.process(request).await {
        Ok(done) => {
            let out = path.with_extension("reply.mp3");
            tokio::fs::write(&out, &done.turn.audio_out)
                .await
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("you said: {}", done.turn.transcript);
            println!("{}", done.turn.response_text);
            println!(
                "(audio written to {}, {} ms total)",
                out.display(),
                done.timings.total.as_millis()
            );
        }
        Err(e) => println!("(voice turn failed: {})", e.stage_tag()),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    meeple::observability::init();

    let args = parse_args()?;
    let cfg = load_config(args.config_path).context("Failed to load configuration")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.cancel();
        }
    });

    let executor = Arc::new(ResilientExecutor::from_config(&cfg.resilience));
    let threads = create_thread_store(&cfg.threads, executor.clone(), shutdown.clone()).await;
    let turns = Arc::new(AgentTurnClient::new(
        build_runtime(&cfg, args.mock)?,
        threads,
        executor,
        TurnSettings::from_section(&cfg.agent),
    ));
    let pipeline = AudioPipeline::new(build_speech(&cfg, args.mock)?, turns.clone(), &cfg.speech.voice)
        .with_context_prefix(cfg.speech.context_prefix.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        let line = line.trim();

        match line {
            "" => continue,
            ":quit" => break,
            ":reset" => {
                turns.end_conversation(CONVERSATION_ID).await;
                println!("(conversation reset)");
            }
            _ if line.starts_with(":voice") => {
                let path = line.trim_start_matches(":voice").trim();
                if path.is_empty() {
                    println!("usage: :voice <path>");
                    continue;
                }
                if let Err(e) = voice_turn(&pipeline, Path::new(path)).await {
                    println!("({e:#})");
                }
            }
            _ => text_turn(&turns, line, &shutdown.child_token()).await,
        }
    }

    shutdown.cancel();
    let m = pipeline.metrics();
    tracing::info!(
        voice_requests = m.requests,
        voice_failures = m.failures,
        "Shutting down"
    );
    Ok(())
}
