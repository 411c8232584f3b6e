//! Mock 语音后端
//!
//! 识别：默认把音频字节按 UTF-8 解码作为转写文本（便于用文本文件充当"录音"），也可固定转写结果。
//! 合成：默认把文本字节原样作为音频返回，可改为返回空音频或失败。

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use super::{AudioFormat, SpeechBackend};
use crate::core::CallError;

/// 合成行为
#[derive(Debug, Clone)]
pub enum SynthesisMode {
    /// 文本字节即音频
    Echo,
    /// 返回零字节音频
    Empty,
    Fail(CallError),
}

#[derive(Debug)]
pub struct MockSpeechBackend {
    transcript: Option<String>,
    transcription_failure: Option<CallError>,
    synthesis: SynthesisMode,
    stt_calls: AtomicUsize,
    tts_calls: AtomicUsize,
}

impl Default for MockSpeechBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSpeechBackend {
    pub fn new() -> Self {
        Self {
            transcript: None,
            transcription_failure: None,
            synthesis: SynthesisMode::Echo,
            stt_calls: AtomicUsize::new(0),
            tts_calls: AtomicUsize::new(0),
        }
    }

    /// 无论输入为何都返回该转写
    pub fn with_transcript(mut self, transcript: impl Into<String>) -> Self {
        self.transcript = Some(transcript.into());
        self
    }

    pub fn with_transcription_failure(mut self, err: CallError) -> Self {
        self.transcription_failure = Some(err);
        self
    }

    pub fn with_synthesis(mut self, mode: SynthesisMode) -> Self {
        self.synthesis = mode;
        self
    }

    pub fn stt_calls(&self) -> usize {
        self.stt_calls.load(Ordering::SeqCst)
    }

    pub fn tts_calls(&self) -> usize {
        self.tts_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechBackend for MockSpeechBackend {
    async fn speech_to_text(&self, audio: Bytes, _format: AudioFormat) -> Result<String, CallError> {
        self.stt_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.transcription_failure {
            return Err(err.clone());
        }
        match &self.transcript {
            Some(text) => Ok(text.clone()),
            None => Ok(String::from_utf8_lossy(&audio).trim().to_string()),
        }
    }

    async fn text_to_speech(&self, text: &str, _voice: &str) -> Result<Bytes, CallError> {
        self.tts_calls.fetch_add(1, Ordering::SeqCst);
        match &self.synthesis {
            SynthesisMode::Echo => Ok(Bytes::copy_from_slice(text.as_bytes())),
            SynthesisMode::Empty => Ok(Bytes::new()),
            SynthesisMode::Fail(err) => Err(err.clone()),
        }
    }
}
