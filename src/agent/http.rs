//! Assistants 风格 REST 运行时客户端
//!
//! 通过 reqwest 调用 `{base}/threads` 系列接口；可选 api-version 查询参数（Azure 部署）与 Bearer 鉴权。
//! 非 2xx 响应映射为 CallError::status，响应体只进日志。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::protocol::{
    AgentRuntime, ListOrder, MessageList, MessageObject, MessageRole, RunObject, ThreadObject,
};
use crate::config::AgentSection;
use crate::core::CallError;

#[derive(Serialize)]
struct CreateMessageRequest<'a> {
    role: MessageRole,
    content: &'a str,
}

#[derive(Serialize)]
struct CreateRunRequest<'a> {
    assistant_id: &'a str,
}

/// HTTP Agent 运行时
#[derive(Debug, Clone)]
pub struct HttpAgentRuntime {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    api_version: Option<String>,
}

impl HttpAgentRuntime {
    pub fn new(base_url: &str, api_key: Option<String>, api_version: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_version,
        }
    }

    /// 从 [agent] 段构建；未配置 base_url 时返回 None
    pub fn from_config(section: &AgentSection) -> Option<Self> {
        let base_url = section.base_url.as_deref()?;
        Some(Self::new(
            base_url,
            section.api_key(),
            section.api_version.clone(),
        ))
    }

    /// 替换底层 HTTP 客户端（如设置连接超时）
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_connect_timeout(self, timeout: Duration) -> Result<Self, CallError> {
        let client = Client::builder().connect_timeout(timeout).build()?;
        Ok(self.with_client(client))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn prepare(&self, request: RequestBuilder) -> RequestBuilder {
        let mut request = request.header("OpenAI-Beta", "assistants=v2");
        if let Some(version) = &self.api_version {
            request = request.query(&[("api-version", version.as_str())]);
        }
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        request
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, CallError> {
        let response = self.prepare(request).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, CallError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::debug!(status = status.as_u16(), "Agent runtime error response: {}", body);
        return Err(CallError::status(status.as_u16(), body));
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[async_trait]
impl AgentRuntime for HttpAgentRuntime {
    async fn create_thread(&self) -> Result<ThreadObject, CallError> {
        let request = self
            .client
            .post(self.url("threads"))
            .json(&serde_json::json!({}));
        self.send(request).await
    }

    async fn post_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<MessageObject, CallError> {
        let request = self
            .client
            .post(self.url(&format!("threads/{thread_id}/messages")))
            .json(&CreateMessageRequest { role, content });
        self.send(request).await
    }

    async fn create_run(
        &self,
        thread_id: &str,
        assistant_id: &str,
    ) -> Result<RunObject, CallError> {
        let request = self
            .client
            .post(self.url(&format!("threads/{thread_id}/runs")))
            .json(&CreateRunRequest { assistant_id });
        self.send(request).await
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<RunObject, CallError> {
        let request = self
            .client
            .get(self.url(&format!("threads/{thread_id}/runs/{run_id}")));
        self.send(request).await
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        order: ListOrder,
        limit: u32,
    ) -> Result<Vec<MessageObject>, CallError> {
        let limit = limit.to_string();
        let request = self
            .client
            .get(self.url(&format!("threads/{thread_id}/messages")))
            .query(&[("order", order.as_str()), ("limit", limit.as_str())]);
        let list: MessageList = self.send(request).await?;
        Ok(list.data)
    }
}
