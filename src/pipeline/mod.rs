//! 语音轮次编排：语音识别 → Agent 轮次 → 语音合成

pub mod audio;

pub use audio::{
    AudioPipeline, AudioRequest, AudioTurn, AudioTurnResult, PipelineError, PipelineMetrics,
    PipelineMetricsSnapshot, PipelineStage, StageTimings,
};
