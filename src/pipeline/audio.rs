//! 语音管线
//!
//! 单次顺序执行：speech_to_text →（可选固定上下文前缀）→ Agent 轮次 → text_to_speech。
//! 每个阶段单独计时并累计总时长；任一阶段失败即中止后续阶段，返回带阶段标签的错误。
//! 管线内部不重试（Agent 调用自身的重试由 ResilientExecutor 负责）。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;

use crate::agent::{AgentTurnClient, TurnOutcome};
use crate::core::{FailureKind, PolicyClass};
use crate::speech::{AudioFormat, SpeechBackend};

/// 管线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Transcription,
    Agent,
    Synthesis,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Transcription => "transcription",
            PipelineStage::Agent => "agent",
            PipelineStage::Synthesis => "synthesis",
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("no speech recognized")]
    TranscriptionEmpty,

    #[error("agent returned no response")]
    AgentEmptyResponse,

    /// kind 为 None 表示合成返回了零字节音频
    #[error("speech synthesis failed")]
    SynthesisFailure { kind: Option<FailureKind> },

    #[error("{stage} stage failed: {kind}")]
    Transport {
        stage: PipelineStage,
        kind: FailureKind,
        retryable: bool,
    },
}

impl PipelineError {
    /// 稳定的错误标签
    pub fn stage_tag(&self) -> &'static str {
        match self {
            PipelineError::TranscriptionEmpty => "transcription-empty",
            PipelineError::AgentEmptyResponse => "agent-empty-response",
            PipelineError::SynthesisFailure { .. } => "synthesis-failure",
            PipelineError::Transport { .. } => "transport",
        }
    }

    pub fn stage(&self) -> PipelineStage {
        match self {
            PipelineError::TranscriptionEmpty => PipelineStage::Transcription,
            PipelineError::AgentEmptyResponse => PipelineStage::Agent,
            PipelineError::SynthesisFailure { .. } => PipelineStage::Synthesis,
            PipelineError::Transport { stage, .. } => *stage,
        }
    }
}

/// 一次语音请求
#[derive(Debug, Clone)]
pub struct AudioRequest {
    pub conversation_id: String,
    pub audio: Bytes,
    pub format: AudioFormat,
    /// 覆盖默认音色
    pub voice: Option<String>,
}

impl AudioRequest {
    pub fn new(conversation_id: impl Into<String>, audio: Bytes, format: AudioFormat) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            audio,
            format,
            voice: None,
        }
    }
}

/// 一次语音轮次的全部数据（仅在本次调用内存在）
#[derive(Debug, Clone)]
pub struct AudioTurn {
    pub conversation_id: String,
    pub audio_in: Bytes,
    pub transcript: String,
    pub response_text: String,
    pub audio_out: Bytes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTimings {
    pub transcription: Duration,
    pub agent: Duration,
    pub synthesis: Duration,
    pub total: Duration,
}

#[derive(Debug, Clone)]
pub struct AudioTurnResult {
    pub turn: AudioTurn,
    pub timings: StageTimings,
}

/// 管线计数器（进程生命周期内单调递增）
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    requests: AtomicU64,
    failures: AtomicU64,
    transcription_ms: AtomicU64,
    agent_ms: AtomicU64,
    synthesis_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineMetricsSnapshot {
    pub requests: u64,
    pub failures: u64,
    pub transcription_ms: u64,
    pub agent_ms: u64,
    pub synthesis_ms: u64,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            transcription_ms: self.transcription_ms.load(Ordering::Relaxed),
            agent_ms: self.agent_ms.load(Ordering::Relaxed),
            synthesis_ms: self.synthesis_ms.load(Ordering::Relaxed),
        }
    }

    fn record_stage(&self, stage: PipelineStage, took: Duration) {
        let counter = match stage {
            PipelineStage::Transcription => &self.transcription_ms,
            PipelineStage::Agent => &self.agent_ms,
            PipelineStage::Synthesis => &self.synthesis_ms,
        };
        counter.fetch_add(took.as_millis() as u64, Ordering::Relaxed);
    }
}

/// 语音管线
pub struct AudioPipeline {
    speech: Arc<dyn SpeechBackend>,
    turns: Arc<AgentTurnClient>,
    voice: String,
    context_prefix: Option<String>,
    metrics: PipelineMetrics,
}

impl AudioPipeline {
    pub fn new(speech: Arc<dyn SpeechBackend>, turns: Arc<AgentTurnClient>, voice: &str) -> Self {
        Self {
            speech,
            turns,
            voice: voice.to_string(),
            context_prefix: None,
            metrics: PipelineMetrics::default(),
        }
    }

    /// 转写文本前附加的固定上下文
    pub fn with_context_prefix(mut self, prefix: Option<String>) -> Self {
        self.context_prefix = prefix.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn metrics(&self) -> PipelineMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn process(&self, request: AudioRequest) -> Result<AudioTurnResult, PipelineError> {
        self.metrics.requests.fetch_add(1, Ordering::Relaxed);
        let conversation_id = request.conversation_id.clone();

        let result = self.run_stages(request).await;
        match &result {
            Ok(done) => {
                let audit = serde_json::json!({
                    "event": "audio_turn",
                    "conversation_id": conversation_id,
                    "transcription_ms": done.timings.transcription.as_millis() as u64,
                    "agent_ms": done.timings.agent.as_millis() as u64,
                    "synthesis_ms": done.timings.synthesis.as_millis() as u64,
                    "total_ms": done.timings.total.as_millis() as u64,
                    "audio_out_bytes": done.turn.audio_out.len(),
                });
                tracing::info!(audit = %audit, "pipeline");
            }
            Err(e) => {
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    conversation_id = %conversation_id,
                    stage = e.stage().as_str(),
                    tag = e.stage_tag(),
                    "Audio turn aborted: {}",
                    e
                );
            }
        }
        result
    }

    async fn run_stages(&self, request: AudioRequest) -> Result<AudioTurnResult, PipelineError> {
        let started = Instant::now();
        let mut timings = StageTimings::default();

        // 1. 语音识别
        let stage_start = Instant::now();
        let transcribed = self
            .speech
            .speech_to_text(request.audio.clone(), request.format)
            .await;
        timings.transcription = self.finish_stage(PipelineStage::Transcription, stage_start);
        let transcript = match transcribed {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                tracing::debug!(detail = e.detail().unwrap_or(""), "Transcription call failed");
                return Err(PipelineError::Transport {
                    stage: PipelineStage::Transcription,
                    kind: e.kind(),
                    retryable: PolicyClass::AgentCall.is_transient(&e),
                });
            }
        };
        if transcript.is_empty() {
            return Err(PipelineError::TranscriptionEmpty);
        }

        // 2. Agent 轮次
        let prompt = match &self.context_prefix {
            Some(prefix) => format!("{prefix}\n\n{transcript}"),
            None => transcript.clone(),
        };
        let stage_start = Instant::now();
        let outcome = self.turns.run_turn(&request.conversation_id, &prompt).await;
        timings.agent = self.finish_stage(PipelineStage::Agent, stage_start);
        let response_text = match outcome {
            Ok(TurnOutcome::Reply(reply)) => reply.text,
            Ok(TurnOutcome::EmptyResponse { .. }) => return Err(PipelineError::AgentEmptyResponse),
            Err(e) => {
                return Err(PipelineError::Transport {
                    stage: PipelineStage::Agent,
                    kind: e.kind(),
                    retryable: e.is_retryable(),
                })
            }
        };

        // 3. 语音合成
        let voice = request.voice.as_deref().unwrap_or(&self.voice);
        let stage_start = Instant::now();
        let synthesized = self.speech.text_to_speech(&response_text, voice).await;
        timings.synthesis = self.finish_stage(PipelineStage::Synthesis, stage_start);
        let audio_out = match synthesized {
            Ok(audio) if !audio.is_empty() => audio,
            Ok(_) => return Err(PipelineError::SynthesisFailure { kind: None }),
            Err(e) => {
                tracing::debug!(detail = e.detail().unwrap_or(""), "Synthesis call failed");
                return Err(PipelineError::SynthesisFailure {
                    kind: Some(e.kind()),
                });
            }
        };

        timings.total = started.elapsed();
        Ok(AudioTurnResult {
            turn: AudioTurn {
                conversation_id: request.conversation_id,
                audio_in: request.audio,
                transcript,
                response_text,
                audio_out,
            },
            timings,
        })
    }

    fn finish_stage(&self, stage: PipelineStage, stage_start: Instant) -> Duration {
        let took = stage_start.elapsed();
        self.metrics.record_stage(stage, took);
        took
    }
}
