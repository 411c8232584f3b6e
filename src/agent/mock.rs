//! Mock Agent 运行时（用于测试与本地运行，无需外部服务）
//!
//! 每个 Run 按脚本依次上报状态（脚本末项之后一直重复末项）；Run 第一次报告 completed 时，
//! 向线程追加一条助手回复。默认回复为 "Echo from Mock: {最后一条用户消息}"。
//! 可按操作注入失败（一次一个），并记录每种操作的调用次数。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use super::protocol::{
    AgentRuntime, ListOrder, MessageContent, MessageObject, MessageRole, RunLastError, RunObject,
    RunStatus, TextContent, ThreadObject,
};
use crate::core::CallError;

/// 可注入失败 / 计数的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateThread,
    PostMessage,
    CreateRun,
    GetRun,
    ListMessages,
}

impl MockOp {
    fn index(self) -> usize {
        match self {
            MockOp::CreateThread => 0,
            MockOp::PostMessage => 1,
            MockOp::CreateRun => 2,
            MockOp::GetRun => 3,
            MockOp::ListMessages => 4,
        }
    }
}

/// 助手回复方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// 回显最后一条用户消息
    Echo,
    Text(String),
    /// 完成但不写任何助手消息
    Silent,
}

/// Run 脚本
#[derive(Debug, Clone)]
pub struct RunScript {
    pub statuses: Vec<RunStatus>,
    pub reply: ScriptedReply,
    /// 状态为 failed / expired 等时附带的错误码
    pub error_code: Option<String>,
}

impl Default for RunScript {
    fn default() -> Self {
        Self {
            statuses: vec![RunStatus::Queued, RunStatus::InProgress, RunStatus::Completed],
            reply: ScriptedReply::Echo,
            error_code: None,
        }
    }
}

impl RunScript {
    pub fn completes_with(reply: impl Into<String>) -> Self {
        Self {
            reply: ScriptedReply::Text(reply.into()),
            ..Self::default()
        }
    }

    pub fn silent() -> Self {
        Self {
            reply: ScriptedReply::Silent,
            ..Self::default()
        }
    }

    pub fn fails_with(code: impl Into<String>) -> Self {
        Self {
            statuses: vec![RunStatus::Queued, RunStatus::Failed],
            reply: ScriptedReply::Silent,
            error_code: Some(code.into()),
        }
    }

    /// 永远停在 in_progress
    pub fn never_finishes() -> Self {
        Self {
            statuses: vec![RunStatus::Queued, RunStatus::InProgress],
            reply: ScriptedReply::Silent,
            error_code: None,
        }
    }

    pub fn with_statuses(mut self, statuses: Vec<RunStatus>) -> Self {
        self.statuses = statuses;
        self
    }

    fn status_at(&self, poll: usize) -> RunStatus {
        match self.statuses.len() {
            0 => RunStatus::Completed,
            n => self.statuses[poll.min(n - 1)],
        }
    }
}

#[derive(Debug)]
struct MockRun {
    thread_id: String,
    polls: usize,
    replied: bool,
    script: RunScript,
}

/// Mock 运行时
#[derive(Debug)]
pub struct MockAgentRuntime {
    threads: DashMap<String, Vec<MessageObject>>,
    runs: DashMap<String, MockRun>,
    script: RwLock<RunScript>,
    latency: Option<Duration>,
    failures: DashMap<MockOp, VecDeque<CallError>>,
    calls: [AtomicUsize; 5],
}

impl Default for MockAgentRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAgentRuntime {
    pub fn new() -> Self {
        Self {
            threads: DashMap::new(),
            runs: DashMap::new(),
            script: RwLock::new(RunScript::default()),
            latency: None,
            failures: DashMap::new(),
            calls: Default::default(),
        }
    }

    /// 之后创建的所有 Run 使用该脚本
    pub fn with_script(self, script: RunScript) -> Self {
        self.set_script(script);
        self
    }

    /// 运行中替换脚本；只影响之后创建的 Run
    pub fn set_script(&self, script: RunScript) {
        let mut current = self.script.write().unwrap_or_else(|e| e.into_inner());
        *current = script;
    }

    fn current_script(&self) -> RunScript {
        self.script.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 每次调用前等待的时长
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// 让 op 的下一次调用返回 err（可多次调用排队）
    pub fn fail_next(&self, op: MockOp, err: CallError) {
        self.failures.entry(op).or_default().push_back(err);
    }

    pub fn calls(&self, op: MockOp) -> usize {
        self.calls[op.index()].load(Ordering::SeqCst)
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn messages(&self, thread_id: &str) -> Vec<MessageObject> {
        self.threads
            .get(thread_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    async fn enter(&self, op: MockOp) -> Result<(), CallError> {
        self.calls[op.index()].fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let injected = self.failures.get_mut(&op).and_then(|mut q| q.pop_front());
        match injected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn unknown_thread(thread_id: &str) -> CallError {
        CallError::status(404, format!("No thread found with id '{thread_id}'"))
    }

    fn append_reply(&self, thread_id: &str, run_id: &str, reply: &ScriptedReply) {
        let Some(mut messages) = self.threads.get_mut(thread_id) else {
            return;
        };
        let text = match reply {
            ScriptedReply::Silent => return,
            ScriptedReply::Text(text) => text.clone(),
            ScriptedReply::Echo => {
                let last_user = messages
                    .iter()
                    .rev()
                    .find(|m| m.role == MessageRole::User)
                    .map(|m| m.text())
                    .unwrap_or_else(|| "(no input)".to_string());
                format!("Echo from Mock: {last_user}")
            }
        };
        messages.push(MessageObject {
            id: new_id("msg"),
            role: MessageRole::Assistant,
            run_id: Some(run_id.to_string()),
            content: vec![MessageContent::Text {
                text: TextContent { value: text },
            }],
        });
    }
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

#[async_trait]
impl AgentRuntime for MockAgentRuntime {
    async fn create_thread(&self) -> Result<ThreadObject, CallError> {
        self.enter(MockOp::CreateThread).await?;
        let id = new_id("thread");
        self.threads.insert(id.clone(), Vec::new());
        Ok(ThreadObject { id })
    }

    async fn post_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<MessageObject, CallError> {
        self.enter(MockOp::PostMessage).await?;
        let mut messages = self
            .threads
            .get_mut(thread_id)
            .ok_or_else(|| Self::unknown_thread(thread_id))?;
        let message = MessageObject {
            id: new_id("msg"),
            role,
            run_id: None,
            content: vec![MessageContent::Text {
                text: TextContent {
                    value: content.to_string(),
                },
            }],
        };
        messages.push(message.clone());
        Ok(message)
    }

    async fn create_run(
        &self,
        thread_id: &str,
        _assistant_id: &str,
    ) -> Result<RunObject, CallError> {
        self.enter(MockOp::CreateRun).await?;
        if !self.threads.contains_key(thread_id) {
            return Err(Self::unknown_thread(thread_id));
        }
        let id = new_id("run");
        let script = self.current_script();
        let status = script.status_at(0);
        self.runs.insert(
            id.clone(),
            MockRun {
                thread_id: thread_id.to_string(),
                polls: 0,
                replied: false,
                script,
            },
        );
        Ok(RunObject {
            id,
            thread_id: thread_id.to_string(),
            status,
            last_error: None,
        })
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<RunObject, CallError> {
        self.enter(MockOp::GetRun).await?;

        let (status, error_code, pending_reply) = {
            let mut run = self
                .runs
                .get_mut(run_id)
                .filter(|r| r.thread_id == thread_id)
                .ok_or_else(|| CallError::status(404, format!("No run found with id '{run_id}'")))?;
            run.polls += 1;
            let status = run.script.status_at(run.polls);
            let pending_reply = if status == RunStatus::Completed && !run.replied {
                run.replied = true;
                Some(run.script.reply.clone())
            } else {
                None
            };
            (status, run.script.error_code.clone(), pending_reply)
        };

        if let Some(reply) = pending_reply {
            self.append_reply(thread_id, run_id, &reply);
        }

        let last_error = match status {
            RunStatus::Failed | RunStatus::Expired | RunStatus::Incomplete | RunStatus::Cancelled => {
                error_code.map(|code| RunLastError {
                    code,
                    message: "scripted failure".to_string(),
                })
            }
            _ => None,
        };
        Ok(RunObject {
            id: run_id.to_string(),
            thread_id: thread_id.to_string(),
            status,
            last_error,
        })
    }

    async fn list_messages(
        &self,
        thread_id: &str,
        order: ListOrder,
        limit: u32,
    ) -> Result<Vec<MessageObject>, CallError> {
        self.enter(MockOp::ListMessages).await?;
        let messages = self
            .threads
            .get(thread_id)
            .map(|m| m.clone())
            .ok_or_else(|| Self::unknown_thread(thread_id))?;
        let ordered: Vec<MessageObject> = match order {
            ListOrder::Asc => messages,
            ListOrder::Desc => messages.into_iter().rev().collect(),
        };
        Ok(ordered.into_iter().take(limit as usize).collect())
    }
}
