//! Meeple - 对话编排核心
//!
//! 把用户的自然语言请求（文本或语音）变成外部 Agent 运行时的一轮对话，并隔离外部服务的延迟与不稳定。
//!
//! 模块划分：
//! - **agent**: Agent 运行时协议、HTTP / Mock 运行时、单轮对话状态机
//! - **cache**: 查询归一化与两级（L1/L2）结果缓存
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 外部调用错误分类、弹性执行器（重试 + 悲观超时）
//! - **observability**: tracing 初始化
//! - **pipeline**: 语音管线（STT → Agent → TTS）
//! - **speech**: 语音识别 / 合成后端
//! - **store**: 键值后端与会话线程映射

pub mod agent;
pub mod cache;
pub mod config;
pub mod core;
pub mod observability;
pub mod pipeline;
pub mod speech;
pub mod store;

pub use agent::{AgentTurnClient, TurnError, TurnOutcome};
pub use cache::TieredCache;
pub use crate::core::{CallError, ResilientExecutor};
pub use pipeline::{AudioPipeline, PipelineError};
