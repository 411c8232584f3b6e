//! 语音后端：语音识别（STT）与语音合成（TTS）
//!
//! - HttpSpeechBackend：OpenAI 兼容音频接口
//! - MockSpeechBackend：脚本化后端（测试 / 本地运行）

pub mod http;
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::core::CallError;

pub use http::HttpSpeechBackend;
pub use mock::{MockSpeechBackend, SynthesisMode};

/// 输入音频格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Wav,
    Mp3,
    Ogg,
    Webm,
    Flac,
}

impl AudioFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "wav",
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Ogg => "ogg",
            AudioFormat::Webm => "webm",
            AudioFormat::Flac => "flac",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Ogg => "audio/ogg",
            AudioFormat::Webm => "audio/webm",
            AudioFormat::Flac => "audio/flac",
        }
    }

    /// 按文件扩展名识别（大小写不敏感）
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" => Some(AudioFormat::Wav),
            "mp3" | "mpeg" => Some(AudioFormat::Mp3),
            "ogg" | "oga" => Some(AudioFormat::Ogg),
            "webm" => Some(AudioFormat::Webm),
            "flac" => Some(AudioFormat::Flac),
            _ => None,
        }
    }
}

/// 语音后端
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// 音频转文本；无法识别出内容时返回空字符串
    async fn speech_to_text(&self, audio: Bytes, format: AudioFormat) -> Result<String, CallError>;

    /// 文本转音频（mp3）
    async fn text_to_speech(&self, text: &str, voice: &str) -> Result<Bytes, CallError>;
}
