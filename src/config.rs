//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MEEPLE__*` 覆盖（双下划线表示嵌套，如 `MEEPLE__AGENT__ASSISTANT_ID=asst_1`）。
//! 所有字段都有默认值，空配置也能启动（此时 Agent 与语音后端走 mock）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentSection,
    pub threads: ThreadsSection,
    pub cache: CacheSection,
    pub resilience: ResilienceSection,
    pub speech: SpeechSection,
}

/// [agent] 段：Agent 运行时地址、助手 ID、轮询参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 运行时根地址，如 https://api.openai.com/v1；未设置时使用 mock 运行时
    pub base_url: Option<String>,
    pub assistant_id: String,
    /// Azure 风格部署需要的 api-version 查询参数
    pub api_version: Option<String>,
    /// 单轮对话截止时间（秒）
    pub turn_deadline_secs: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    /// 取回消息时的条数上限
    pub message_page_size: u32,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            base_url: None,
            assistant_id: "asst_default".to_string(),
            api_version: None,
            turn_deadline_secs: 30,
            poll_initial_ms: 50,
            poll_max_ms: 500,
            message_page_size: 20,
        }
    }
}

impl AgentSection {
    /// API Key 只从环境变量读取，不进配置文件
    pub fn api_key(&self) -> Option<String> {
        std::env::var("MEEPLE_AGENT_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

/// [threads] 段：会话线程映射
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThreadsSection {
    pub ttl_minutes: u64,
    pub sweep_interval_minutes: u64,
    /// 共享 SQLite 文件；未设置时使用进程内存储（降级模式）
    pub store_path: Option<PathBuf>,
}

impl Default for ThreadsSection {
    fn default() -> Self {
        Self {
            ttl_minutes: 120,
            sweep_interval_minutes: 10,
            store_path: None,
        }
    }
}

impl ThreadsSection {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_minutes.max(1) * 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_minutes.max(1) * 60)
    }
}

/// [cache] 段：两级缓存
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub domain: String,
    pub environment: String,
    pub version: String,
    pub l1_ttl_secs: u64,
    pub l2_ttl_secs: u64,
    pub l1_capacity: usize,
    pub max_key_len: usize,
    /// 过期 L2 行的清理间隔
    pub purge_interval_secs: u64,
    /// L2 使用的 SQLite 文件；未设置时只有 L1
    pub store_path: Option<PathBuf>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            domain: "games".to_string(),
            environment: "development".to_string(),
            version: "v1".to_string(),
            l1_ttl_secs: 600,
            l2_ttl_secs: 1800,
            l1_capacity: 10_000,
            max_key_len: 200,
            purge_interval_secs: 600,
            store_path: None,
        }
    }
}

impl CacheSection {
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}

/// [resilience] 段：两类调用的重试策略，未填的字段使用内置默认
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ResilienceSection {
    pub agent: RetrySection,
    pub cache: RetrySection,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: Option<u32>,
    pub attempt_timeout_ms: Option<u64>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

/// [speech] 段：语音识别 / 合成
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechSection {
    /// OpenAI 兼容音频接口根地址；未设置时使用 mock
    pub base_url: Option<String>,
    pub stt_model: String,
    pub tts_model: String,
    pub voice: String,
    /// 转写文本前附加的固定上下文
    pub context_prefix: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for SpeechSection {
    fn default() -> Self {
        Self {
            base_url: None,
            stt_model: "whisper-1".to_string(),
            tts_model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            context_prefix: None,
            request_timeout_secs: 60,
        }
    }
}

impl SpeechSection {
    pub fn api_key(&self) -> Option<String> {
        std::env::var("MEEPLE_SPEECH_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

/// 从 config 目录加载配置，环境变量 MEEPLE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MEEPLE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MEEPLE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
