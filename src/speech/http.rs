//! OpenAI 兼容音频接口：`/audio/transcriptions`（multipart）与 `/audio/speech`（JSON 请求，二进制响应）

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use super::{AudioFormat, SpeechBackend};
use crate::config::SpeechSection;
use crate::core::CallError;

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

/// HTTP 语音后端
#[derive(Debug, Clone)]
pub struct HttpSpeechBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    stt_model: String,
    tts_model: String,
}

impl HttpSpeechBackend {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        stt_model: &str,
        tts_model: &str,
        timeout: Duration,
    ) -> Result<Self, CallError> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            stt_model: stt_model.to_string(),
            tts_model: tts_model.to_string(),
        })
    }

    /// 从 [speech] 段构建；未配置 base_url 时返回 Ok(None)
    pub fn from_config(section: &SpeechSection) -> Result<Option<Self>, CallError> {
        let Some(base_url) = section.base_url.as_deref() else {
            return Ok(None);
        };
        Self::new(
            base_url,
            section.api_key(),
            &section.stt_model,
            &section.tts_model,
            Duration::from_secs(section.request_timeout_secs),
        )
        .map(Some)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

async fn ensure_success(response: Response) -> Result<Response, CallError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    tracing::debug!(status = status.as_u16(), "Speech service error response: {}", body);
    Err(CallError::status(status.as_u16(), body))
}

#[async_trait]
impl SpeechBackend for HttpSpeechBackend {
    async fn speech_to_text(&self, audio: Bytes, format: AudioFormat) -> Result<String, CallError> {
        let part = Part::bytes(audio.to_vec())
            .file_name(format!("audio.{}", format.extension()))
            .mime_str(format.mime())?;
        let form = Form::new()
            .part("file", part)
            .text("model", self.stt_model.clone());

        let request = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .multipart(form);
        let response = ensure_success(self.authorize(request).send().await?).await?;
        let bytes = response.bytes().await?;
        let decoded: TranscriptionResponse = serde_json::from_slice(&bytes)?;
        Ok(decoded.text)
    }

    async fn text_to_speech(&self, text: &str, voice: &str) -> Result<Bytes, CallError> {
        let request = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .json(&SpeechRequest {
                model: &self.tts_model,
                input: text,
                voice,
                response_format: "mp3",
            });
        let response = ensure_success(self.authorize(request).send().await?).await?;
        Ok(response.bytes().await?)
    }
}
