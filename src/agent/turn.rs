//! 单轮对话客户端
//!
//! 状态流转：NEW → 解析线程 → 发送消息 → 创建 Run → 轮询{Queued|InProgress} → {Completed | Failed | TimedOut}
//!
//! - 线程解析：先查 ThreadMappingStore，未命中则向运行时新建线程
//! - 每一次运行时调用都经 ResilientExecutor（AgentCall 策略）
//! - 轮询间隔从 poll_initial 起每次翻倍，封顶 poll_max；整轮受 deadline 约束，超时为 TimedOut（可重试）
//! - Completed 后取最近一条助手消息；文本为空是质量失败（EmptyResponse），不是错误
//! - 只有成功拿到回复时才写回线程映射
//!
//! 创建线程与创建 Run 不是幂等操作：上层对 Run 创建之后的失败盲目重试，可能产生重复 Run（至少一次语义）。
//! 同一会话的并发轮次不加锁，可能各自创建线程，映射以最后写入者为准。

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::protocol::{AgentRuntime, ListOrder, MessageRole, RunLastError, RunObject, RunStatus};
use crate::config::AgentSection;
use crate::core::{CallError, FailureKind, PolicyClass, ResilientExecutor};
use crate::store::ThreadMappingStore;

/// 轮次所处阶段（用于错误标注与日志）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStage {
    ResolveThread,
    PostMessage,
    CreateRun,
    Poll,
    FetchReply,
}

impl TurnStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStage::ResolveThread => "resolve-thread",
            TurnStage::PostMessage => "post-message",
            TurnStage::CreateRun => "create-run",
            TurnStage::Poll => "poll",
            TurnStage::FetchReply => "fetch-reply",
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            TurnStage::ResolveThread => "agent.create_thread",
            TurnStage::PostMessage => "agent.post_message",
            TurnStage::CreateRun => "agent.create_run",
            TurnStage::Poll => "agent.get_run",
            TurnStage::FetchReply => "agent.list_messages",
        }
    }
}

impl fmt::Display for TurnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Run 在本系统中的状态（只前进不后退）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Queued,
    InProgress,
    Completed,
    Failed,
    TimedOut,
}

impl RunPhase {
    /// requires_action / cancelling 继续轮询；cancelled / expired / incomplete / failed 视为失败
    pub fn from_status(status: RunStatus) -> Self {
        match status {
            RunStatus::Queued => RunPhase::Queued,
            RunStatus::InProgress | RunStatus::RequiresAction | RunStatus::Cancelling => {
                RunPhase::InProgress
            }
            RunStatus::Completed => RunPhase::Completed,
            RunStatus::Failed | RunStatus::Cancelled | RunStatus::Expired | RunStatus::Incomplete => {
                RunPhase::Failed
            }
        }
    }

    fn rank(&self) -> u8 {
        match self {
            RunPhase::Queued => 0,
            RunPhase::InProgress => 1,
            RunPhase::Completed | RunPhase::Failed | RunPhase::TimedOut => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }
}

/// 一次轮次中的 Run
#[derive(Debug, Clone)]
pub struct AgentRun {
    pub run_id: String,
    pub thread_id: String,
    pub phase: RunPhase,
    pub last_error: Option<RunLastError>,
}

impl AgentRun {
    pub fn new(created: &RunObject) -> Self {
        Self {
            run_id: created.id.clone(),
            thread_id: created.thread_id.clone(),
            phase: RunPhase::from_status(created.status),
            last_error: created.last_error.clone(),
        }
    }

    /// 应用一次状态观测；后退或终态之后的观测被忽略。返回是否发生了状态前进
    pub fn observe(&mut self, run: &RunObject) -> bool {
        let next = RunPhase::from_status(run.status);
        if self.phase.is_terminal() || next.rank() <= self.phase.rank() {
            return false;
        }
        self.phase = next;
        if run.last_error.is_some() {
            self.last_error = run.last_error.clone();
        }
        true
    }

    pub fn time_out(&mut self) {
        if !self.phase.is_terminal() {
            self.phase = RunPhase::TimedOut;
        }
    }
}

/// 轮询间隔：每次翻倍，封顶 max，且不超过剩余时间
#[derive(Debug, Clone)]
pub struct PollSchedule {
    next: Duration,
    max: Duration,
}

impl PollSchedule {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            next: initial.min(max),
            max,
        }
    }

    pub fn next_delay(&mut self, remaining: Duration) -> Duration {
        let delay = self.next.min(remaining);
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// 轮次参数
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub assistant_id: String,
    pub deadline: Duration,
    pub poll_initial: Duration,
    pub poll_max: Duration,
    pub message_page_size: u32,
}

impl TurnSettings {
    pub fn from_section(section: &AgentSection) -> Self {
        Self {
            assistant_id: section.assistant_id.clone(),
            deadline: Duration::from_secs(section.turn_deadline_secs),
            poll_initial: Duration::from_millis(section.poll_initial_ms),
            poll_max: Duration::from_millis(section.poll_max_ms),
            message_page_size: section.message_page_size.max(1),
        }
    }
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self::from_section(&AgentSection::default())
    }
}

/// 成功回复
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReply {
    pub text: String,
    pub thread_id: String,
    pub run_id: String,
    /// get_run 调用次数
    pub polls: u32,
    pub elapsed: Duration,
}

/// 轮次结果：回复，或 Run 完成但没有可用文本（质量失败）
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Reply(TurnReply),
    EmptyResponse { thread_id: String, run_id: String },
}

impl TurnOutcome {
    pub fn reply(&self) -> Option<&TurnReply> {
        match self {
            TurnOutcome::Reply(reply) => Some(reply),
            TurnOutcome::EmptyResponse { .. } => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum TurnError {
    #[error("empty user input")]
    EmptyInput,

    #[error("agent call failed during {stage}: {source}")]
    Transport {
        stage: TurnStage,
        #[source]
        source: CallError,
    },

    /// code 只进日志，不展示给最终用户
    #[error("agent run failed")]
    RunFailed { run_id: String, code: Option<String> },

    #[error("agent run did not finish within {after:?}")]
    TimedOut { run_id: String, after: Duration },

    #[error("turn cancelled")]
    Cancelled,
}

impl TurnError {
    /// 超时与瞬时传输错误可由接受至少一次语义的上层重试
    pub fn is_retryable(&self) -> bool {
        match self {
            TurnError::TimedOut { .. } => true,
            TurnError::Transport { source, .. } => PolicyClass::AgentCall.is_transient(source),
            TurnError::EmptyInput | TurnError::RunFailed { .. } | TurnError::Cancelled => false,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            TurnError::EmptyInput => FailureKind::Rejected,
            TurnError::Transport { source, .. } => source.kind(),
            TurnError::RunFailed { .. } => FailureKind::Unavailable,
            TurnError::TimedOut { .. } => FailureKind::Timeout,
            TurnError::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// 单轮对话客户端，可在所有请求间共享
pub struct AgentTurnClient {
    runtime: Arc<dyn AgentRuntime>,
    threads: Arc<dyn ThreadMappingStore>,
    executor: Arc<ResilientExecutor>,
    settings: TurnSettings,
}

impl AgentTurnClient {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        threads: Arc<dyn ThreadMappingStore>,
        executor: Arc<ResilientExecutor>,
        settings: TurnSettings,
    ) -> Self {
        Self {
            runtime,
            threads,
            executor,
            settings,
        }
    }

    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    pub async fn run_turn(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<TurnOutcome, TurnError> {
        self.drive(conversation_id, text).await
    }

    /// 同 run_turn；cancel 触发时中止进行中的调用或轮询等待
    pub async fn run_turn_cancellable(
        &self,
        conversation_id: &str,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(conversation_id, "Turn cancelled by caller");
                Err(TurnError::Cancelled)
            }
            result = self.drive(conversation_id, text) => result,
        }
    }

    /// 显式结束会话：删除线程映射
    pub async fn end_conversation(&self, conversation_id: &str) {
        self.threads.remove(conversation_id).await;
        tracing::info!(conversation_id, "Conversation ended");
    }

    async fn drive(&self, conversation_id: &str, text: &str) -> Result<TurnOutcome, TurnError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TurnError::EmptyInput);
        }
        let started = Instant::now();
        let deadline = started + self.settings.deadline;

        let thread_id = self.resolve_thread(conversation_id).await?;

        let (tid, body) = (thread_id.clone(), text.to_string());
        self.call(TurnStage::PostMessage, move |rt| {
            let (tid, body) = (tid.clone(), body.clone());
            async move { rt.post_message(&tid, MessageRole::User, &body).await }
        })
        .await?;

        let (tid, assistant) = (thread_id.clone(), self.settings.assistant_id.clone());
        let created = self
            .call(TurnStage::CreateRun, move |rt| {
                let (tid, assistant) = (tid.clone(), assistant.clone());
                async move { rt.create_run(&tid, &assistant).await }
            })
            .await?;
        tracing::debug!(conversation_id, run_id = %created.id, "Run created");

        let mut run = AgentRun::new(&created);
        let polls = self.poll_until_terminal(&mut run, started, deadline).await?;

        if run.phase == RunPhase::Failed {
            let code = run.last_error.as_ref().map(|e| e.code.clone());
            tracing::warn!(
                conversation_id,
                run_id = %run.run_id,
                code = code.as_deref().unwrap_or("unknown"),
                "Agent run failed"
            );
            return Err(TurnError::RunFailed {
                run_id: run.run_id,
                code,
            });
        }

        let reply_text = self.latest_assistant_text(&thread_id, &run.run_id).await?;
        let Some(reply_text) = reply_text.filter(|t| !t.trim().is_empty()) else {
            tracing::warn!(conversation_id, run_id = %run.run_id, "Run completed without assistant text");
            return Ok(TurnOutcome::EmptyResponse {
                thread_id,
                run_id: run.run_id,
            });
        };

        self.threads.set(conversation_id, &thread_id).await;
        let elapsed = started.elapsed();
        tracing::info!(
            conversation_id,
            run_id = %run.run_id,
            polls,
            elapsed_ms = elapsed.as_millis() as u64,
            "Turn completed"
        );
        Ok(TurnOutcome::Reply(TurnReply {
            text: reply_text,
            thread_id,
            run_id: run.run_id,
            polls,
            elapsed,
        }))
    }

    async fn resolve_thread(&self, conversation_id: &str) -> Result<String, TurnError> {
        if let Some(thread_id) = self.threads.get(conversation_id).await {
            return Ok(thread_id);
        }
        let thread = self
            .call(TurnStage::ResolveThread, |rt| async move {
                rt.create_thread().await
            })
            .await?;
        tracing::debug!(conversation_id, thread_id = %thread.id, "Created new thread");
        Ok(thread.id)
    }

    async fn poll_until_terminal(
        &self,
        run: &mut AgentRun,
        started: Instant,
        deadline: Instant,
    ) -> Result<u32, TurnError> {
        let mut schedule = PollSchedule::new(self.settings.poll_initial, self.settings.poll_max);
        let mut polls: u32 = 0;

        while !run.phase.is_terminal() {
            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(run, started));
            }
            tokio::time::sleep(schedule.next_delay(deadline - now)).await;

            let (tid, rid) = (run.thread_id.clone(), run.run_id.clone());
            let poll = self.call(TurnStage::Poll, move |rt| {
                let (tid, rid) = (tid.clone(), rid.clone());
                async move { rt.get_run(&tid, &rid).await }
            });
            let observed = match tokio::time::timeout_at(deadline, poll).await {
                Ok(result) => result?,
                Err(_) => return Err(self.timed_out(run, started)),
            };
            polls += 1;

            if run.observe(&observed) {
                tracing::debug!(run_id = %run.run_id, status = observed.status.as_str(), "Run advanced");
            }
        }
        Ok(polls)
    }

    fn timed_out(&self, run: &mut AgentRun, started: Instant) -> TurnError {
        run.time_out();
        let after = started.elapsed();
        tracing::warn!(run_id = %run.run_id, after_ms = after.as_millis() as u64, "Run polling deadline exceeded");
        TurnError::TimedOut {
            run_id: run.run_id.clone(),
            after,
        }
    }

    /// 本次 Run 写入的最新助手消息
    ///
    /// 按 desc 扫描到第一条用户消息为止（更早的内容属于之前的轮次）；
    /// 带 run_id 的助手消息必须属于本次 Run
    async fn latest_assistant_text(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<Option<String>, TurnError> {
        let (tid, limit) = (thread_id.to_string(), self.settings.message_page_size);
        let messages = self
            .call(TurnStage::FetchReply, move |rt| {
                let tid = tid.clone();
                async move { rt.list_messages(&tid, ListOrder::Desc, limit).await }
            })
            .await?;
        Ok(messages
            .iter()
            .take_while(|m| m.role != MessageRole::User)
            .find(|m| {
                m.role == MessageRole::Assistant
                    && m.run_id.as_deref().map_or(true, |id| id == run_id)
            })
            .map(|m| m.text()))
    }

    async fn call<T, F, Fut>(&self, stage: TurnStage, mut make_call: F) -> Result<T, TurnError>
    where
        F: FnMut(Arc<dyn AgentRuntime>) -> Fut,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
        T: Send + 'static,
    {
        let runtime = self.runtime.clone();
        self.executor
            .execute(PolicyClass::AgentCall, stage.operation(), move || {
                make_call(runtime.clone())
            })
            .await
            .map_err(|source| TurnError::Transport { stage, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::mock::{MockAgentRuntime, MockOp, RunScript};
    use crate::agent::protocol::{MessageContent, MessageObject, TextContent, ThreadObject};
    use crate::core::RetryPolicy;
    use crate::store::InMemoryThreadStore;
    use async_trait::async_trait;

    struct Fixture {
        runtime: Arc<MockAgentRuntime>,
        threads: Arc<InMemoryThreadStore>,
        client: AgentTurnClient,
    }

    fn fixture(runtime: MockAgentRuntime) -> Fixture {
        fixture_with(runtime, TurnSettings::default())
    }

    fn fixture_with(runtime: MockAgentRuntime, settings: TurnSettings) -> Fixture {
        let runtime = Arc::new(runtime);
        let threads = Arc::new(InMemoryThreadStore::new(Duration::from_secs(120 * 60)));
        let client = AgentTurnClient::new(
            runtime.clone(),
            threads.clone(),
            Arc::new(ResilientExecutor::default()),
            settings,
        );
        Fixture {
            runtime,
            threads,
            client,
        }
    }

    fn created(status: RunStatus) -> RunObject {
        RunObject {
            id: "run_1".into(),
            thread_id: "thread_1".into(),
            status,
            last_error: None,
        }
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(RunPhase::from_status(RunStatus::RequiresAction), RunPhase::InProgress);
        assert_eq!(RunPhase::from_status(RunStatus::Cancelling), RunPhase::InProgress);
        assert_eq!(RunPhase::from_status(RunStatus::Expired), RunPhase::Failed);
        assert_eq!(RunPhase::from_status(RunStatus::Incomplete), RunPhase::Failed);
        assert_eq!(RunPhase::from_status(RunStatus::Cancelled), RunPhase::Failed);
    }

    #[test]
    fn test_run_observations_only_move_forward() {
        let mut run = AgentRun::new(&created(RunStatus::Queued));
        assert!(run.observe(&created(RunStatus::InProgress)));
        assert!(!run.observe(&created(RunStatus::Queued)));
        assert_eq!(run.phase, RunPhase::InProgress);
        assert!(run.observe(&created(RunStatus::Completed)));
        assert!(!run.observe(&created(RunStatus::Failed)));
        assert_eq!(run.phase, RunPhase::Completed);
        run.time_out();
        assert_eq!(run.phase, RunPhase::Completed);
    }

    #[test]
    fn test_poll_schedule_doubles_to_ceiling_and_clips() {
        let mut s = PollSchedule::new(Duration::from_millis(50), Duration::from_millis(500));
        let delays: Vec<u64> = (0..6)
            .map(|_| s.next_delay(Duration::from_secs(30)).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![50, 100, 200, 400, 500, 500]);
        assert_eq!(s.next_delay(Duration::from_millis(30)), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_returns_assistant_text_and_saves_mapping() {
        let f = fixture(MockAgentRuntime::new().with_script(RunScript::completes_with("Try Cascadia.")));
        let outcome = f.client.run_turn("conv-1", "a relaxing tile game").await.unwrap();

        let reply = outcome.reply().unwrap();
        assert_eq!(reply.text, "Try Cascadia.");
        assert_eq!(reply.polls, 2);
        assert_eq!(
            f.threads.mapping("conv-1").unwrap().thread_id,
            reply.thread_id
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_turn_reuses_thread() {
        let f = fixture(MockAgentRuntime::new());
        let first = f.client.run_turn("conv-1", "hello").await.unwrap();
        let second = f.client.run_turn("conv-1", "again").await.unwrap();

        assert_eq!(f.runtime.calls(MockOp::CreateThread), 1);
        let (a, b) = (first.reply().unwrap(), second.reply().unwrap());
        assert_eq!(a.thread_id, b.thread_id);
        assert_eq!(b.text, "Echo from Mock: again");
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_without_assistant_text_is_quality_failure() {
        let f = fixture(MockAgentRuntime::new().with_script(RunScript::silent()));
        let outcome = f.client.run_turn("conv-1", "anything").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::EmptyResponse { .. }));
        assert!(f.threads.mapping("conv-1").is_none());

        let f = fixture(MockAgentRuntime::new().with_script(RunScript::completes_with("   ")));
        let outcome = f.client.run_turn("conv-1", "anything").await.unwrap();
        assert!(matches!(outcome, TurnOutcome::EmptyResponse { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_run_on_reused_thread_ignores_older_reply() {
        let f = fixture(MockAgentRuntime::new());
        let first = f.client.run_turn("conv-1", "hello").await.unwrap();
        let thread_id = first.reply().unwrap().thread_id.clone();

        f.runtime.set_script(RunScript::silent());
        let outcome = f.client.run_turn("conv-1", "anything else?").await.unwrap();

        assert!(matches!(outcome, TurnOutcome::EmptyResponse { .. }));
        let history = f.runtime.messages(&thread_id);
        assert_eq!(history.len(), 3);
        assert_eq!(history[1].text(), "Echo from Mock: hello");
    }

    /// 线程里只有属于别的 Run 的助手消息
    struct ForeignReplyRuntime;

    fn text_message(role: MessageRole, run_id: Option<&str>, text: &str) -> MessageObject {
        MessageObject {
            id: "msg_x".into(),
            role,
            run_id: run_id.map(str::to_string),
            content: vec![MessageContent::Text {
                text: TextContent { value: text.into() },
            }],
        }
    }

    #[async_trait]
    impl AgentRuntime for ForeignReplyRuntime {
        async fn create_thread(&self) -> Result<ThreadObject, CallError> {
            Ok(ThreadObject { id: "thread_1".into() })
        }
        async fn post_message(
            &self,
            _thread_id: &str,
            role: MessageRole,
            content: &str,
        ) -> Result<MessageObject, CallError> {
            Ok(text_message(role, None, content))
        }
        async fn create_run(&self, _thread_id: &str, _assistant_id: &str) -> Result<RunObject, CallError> {
            Ok(created(RunStatus::Queued))
        }
        async fn get_run(&self, _thread_id: &str, _run_id: &str) -> Result<RunObject, CallError> {
            Ok(created(RunStatus::Completed))
        }
        async fn list_messages(
            &self,
            _thread_id: &str,
            _order: ListOrder,
            _limit: u32,
        ) -> Result<Vec<MessageObject>, CallError> {
            Ok(vec![
                text_message(MessageRole::Assistant, Some("run_previous"), "OLD ANSWER"),
                text_message(MessageRole::User, None, "second question"),
            ])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_from_another_run_is_not_used() {
        let threads = Arc::new(InMemoryThreadStore::new(Duration::from_secs(7200)));
        let client = AgentTurnClient::new(
            Arc::new(ForeignReplyRuntime),
            threads.clone(),
            Arc::new(ResilientExecutor::default()),
            TurnSettings::default(),
        );
        let outcome = client.run_turn("conv-1", "second question").await.unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::EmptyResponse {
                thread_id: "thread_1".into(),
                run_id: "run_1".into(),
            }
        );
        assert!(threads.mapping("conv-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_runtime_hits_attempt_timeout() {
        let agent = RetryPolicy::agent_call()
            .with_max_retries(2)
            .with_attempt_timeout(Duration::from_millis(100))
            .with_backoff(Duration::from_millis(10), Duration::from_millis(20));
        let runtime = Arc::new(MockAgentRuntime::new().with_latency(Duration::from_millis(250)));
        let client = AgentTurnClient::new(
            runtime.clone(),
            Arc::new(InMemoryThreadStore::new(Duration::from_secs(7200))),
            Arc::new(ResilientExecutor::new(agent, RetryPolicy::cache_op())),
            TurnSettings::default(),
        );

        let err = client.run_turn("conv-1", "hi").await.unwrap_err();
        assert!(matches!(
            err,
            TurnError::Transport {
                stage: TurnStage::ResolveThread,
                source: CallError::Timeout
            }
        ));
        assert!(err.is_retryable());
        assert_eq!(runtime.calls(MockOp::CreateThread), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_run_is_not_retryable() {
        let f = fixture(MockAgentRuntime::new().with_script(RunScript::fails_with("server_error")));
        let err = f.client.run_turn("conv-1", "hi").await.unwrap_err();
        match &err {
            TurnError::RunFailed { code, .. } => assert_eq!(code.as_deref(), Some("server_error")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "agent run failed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_run_maps_to_failure() {
        let script = RunScript::fails_with("expired").with_statuses(vec![
            RunStatus::Queued,
            RunStatus::RequiresAction,
            RunStatus::Expired,
        ]);
        let f = fixture(MockAgentRuntime::new().with_script(script));
        let err = f.client.run_turn("conv-1", "hi").await.unwrap_err();
        assert!(matches!(err, TurnError::RunFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_retryable_timeout() {
        let settings = TurnSettings {
            deadline: Duration::from_secs(2),
            ..TurnSettings::default()
        };
        let f = fixture_with(
            MockAgentRuntime::new().with_script(RunScript::never_finishes()),
            settings,
        );
        let started = Instant::now();
        let err = f.client.run_turn("conv-1", "hi").await.unwrap_err();

        assert!(matches!(err, TurnError::TimedOut { .. }));
        assert!(err.is_retryable());
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert!(f.threads.mapping("conv-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_inside_turn() {
        let runtime = MockAgentRuntime::new();
        runtime.fail_next(MockOp::CreateRun, CallError::status(503, "overloaded"));
        let f = fixture(runtime);
        assert!(f.client.run_turn("conv-1", "hi").await.is_ok());
        assert_eq!(f.runtime.calls(MockOp::CreateRun), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_surfaces_with_stage() {
        let runtime = MockAgentRuntime::new();
        runtime.fail_next(MockOp::PostMessage, CallError::status(401, "bad key"));
        let f = fixture(runtime);
        let err = f.client.run_turn("conv-1", "hi").await.unwrap_err();

        assert!(matches!(
            err,
            TurnError::Transport {
                stage: TurnStage::PostMessage,
                source: CallError::Auth(_)
            }
        ));
        assert_eq!(err.kind(), FailureKind::Auth);
        assert!(!err.is_retryable());
        assert_eq!(f.runtime.calls(MockOp::PostMessage), 1);
        assert_eq!(f.runtime.calls(MockOp::CreateRun), 0);
    }

    #[tokio::test]
    async fn test_empty_input_makes_no_calls() {
        let f = fixture(MockAgentRuntime::new());
        let err = f.client.run_turn("conv-1", "  \n ").await.unwrap_err();
        assert!(matches!(err, TurnError::EmptyInput));
        assert_eq!(f.runtime.calls(MockOp::CreateThread), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let f = fixture(MockAgentRuntime::new().with_script(RunScript::never_finishes()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let err = f
            .client
            .run_turn_cancellable("conv-1", "hi", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::Cancelled));
        assert!(f.runtime.calls(MockOp::GetRun) < 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_turns_race_last_writer_wins() {
        let f = fixture(MockAgentRuntime::new());
        let (a, b) = tokio::join!(
            f.client.run_turn("conv-1", "first"),
            f.client.run_turn("conv-1", "second"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        let (a, b) = (a.reply().unwrap(), b.reply().unwrap());

        assert_eq!(f.runtime.thread_count(), 2);
        assert_ne!(a.thread_id, b.thread_id);
        let saved = f.threads.mapping("conv-1").unwrap().thread_id;
        assert!(saved == a.thread_id || saved == b.thread_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_conversation_forgets_thread() {
        let f = fixture(MockAgentRuntime::new());
        f.client.run_turn("conv-1", "hi").await.unwrap();
        f.client.end_conversation("conv-1").await;
        assert!(f.threads.mapping("conv-1").is_none());

        f.client.run_turn("conv-1", "hi again").await.unwrap();
        assert_eq!(f.runtime.calls(MockOp::CreateThread), 2);
    }
}
