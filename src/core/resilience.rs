//! 弹性调用执行器
//!
//! 重试（外层）包裹超时（内层）：每次尝试独立计时；尝试超时或返回被策略判定为瞬时的错误时，
//! 按指数退避等待后再发起下一次尝试，直到用完最大重试次数。
//!
//! 超时是悲观的：被包裹的 future 在独立任务中运行，到期后执行器只放弃等待，
//! 原调用可能仍在后台跑完，其结果被丢弃。调用方自己 drop 掉等待（取消）时，则会中止该任务。

use std::future::Future;
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::config::{ResilienceSection, RetrySection};
use crate::core::error::CallError;

/// 策略类别：Agent 运行时调用 / 缓存与键值存储操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyClass {
    AgentCall,
    CacheOp,
}

impl PolicyClass {
    /// 该类别下错误是否属于可重试的瞬时错误
    pub fn is_transient(&self, err: &CallError) -> bool {
        match self {
            PolicyClass::AgentCall => match err {
                CallError::Timeout => true,
                CallError::Status { code, .. } => matches!(code, 408 | 429 | 502 | 503 | 504),
                _ => false,
            },
            PolicyClass::CacheOp => {
                matches!(err, CallError::Timeout | CallError::Connectivity(_))
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyClass::AgentCall => "agent_call",
            PolicyClass::CacheOp => "cache_op",
        }
    }
}

/// 重试 + 单次超时策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub class: PolicyClass,
    /// 首次尝试之外允许的重试次数
    pub max_retries: u32,
    pub attempt_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn agent_call() -> Self {
        Self {
            class: PolicyClass::AgentCall,
            max_retries: 3,
            attempt_timeout: Duration::from_secs(10),
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(4),
        }
    }

    pub fn cache_op() -> Self {
        Self {
            class: PolicyClass::CacheOp,
            max_retries: 2,
            attempt_timeout: Duration::from_millis(500),
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }

    pub fn for_class(class: PolicyClass) -> Self {
        match class {
            PolicyClass::AgentCall => Self::agent_call(),
            PolicyClass::CacheOp => Self::cache_op(),
        }
    }

    /// 以类别默认值为底，叠加配置中出现的字段
    pub fn from_section(class: PolicyClass, section: &RetrySection) -> Self {
        let mut policy = Self::for_class(class);
        if let Some(n) = section.max_retries {
            policy.max_retries = n;
        }
        if let Some(ms) = section.attempt_timeout_ms {
            policy.attempt_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = section.base_delay_ms {
            policy.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = section.max_delay_ms {
            policy.max_delay = Duration::from_millis(ms);
        }
        policy
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    pub fn is_retryable(&self, err: &CallError) -> bool {
        self.class.is_transient(err)
    }

    /// 第 retry 次重试（从 1 开始）前的等待：min(base * 2^(retry-1), max)
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let factor = 1u32
            .checked_shl(retry.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// 成功结果及实际使用的尝试次数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// 弹性调用执行器：持有 AgentCall 与 CacheOp 两套策略，可在所有请求间共享
#[derive(Debug, Clone)]
pub struct ResilientExecutor {
    agent: RetryPolicy,
    cache: RetryPolicy,
}

impl ResilientExecutor {
    pub fn new(agent: RetryPolicy, cache: RetryPolicy) -> Self {
        Self { agent, cache }
    }

    pub fn from_config(section: &ResilienceSection) -> Self {
        Self::new(
            RetryPolicy::from_section(PolicyClass::AgentCall, &section.agent),
            RetryPolicy::from_section(PolicyClass::CacheOp, &section.cache),
        )
    }

    pub fn policy(&self, class: PolicyClass) -> &RetryPolicy {
        match class {
            PolicyClass::AgentCall => &self.agent,
            PolicyClass::CacheOp => &self.cache,
        }
    }

    /// 执行 operation，按 class 对应策略重试；只返回值
    pub async fn execute<F, Fut, T>(
        &self,
        class: PolicyClass,
        operation: &str,
        make_call: F,
    ) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
        T: Send + 'static,
    {
        self.execute_traced(class, operation, make_call)
            .await
            .map(|attempted| attempted.value)
    }

    /// 同 execute，额外返回尝试次数。非瞬时错误立即返回；重试用尽后返回最后一次的错误
    pub async fn execute_traced<F, Fut, T>(
        &self,
        class: PolicyClass,
        operation: &str,
        mut make_call: F,
    ) -> Result<Attempted<T>, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>> + Send + 'static,
        T: Send + 'static,
    {
        let policy = self.policy(class);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match run_with_deadline(policy.attempt_timeout, make_call()).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "Call succeeded after retry");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(err) => err,
            };

            if !policy.is_retryable(&err) {
                tracing::debug!(
                    operation,
                    attempt,
                    kind = %err.kind(),
                    detail = err.detail().unwrap_or(""),
                    "Terminal failure, not retrying"
                );
                return Err(err);
            }
            if attempt > policy.max_retries {
                tracing::warn!(
                    operation,
                    attempts = attempt,
                    policy = policy.class.as_str(),
                    kind = %err.kind(),
                    "Retries exhausted"
                );
                return Err(err);
            }

            let delay = policy.backoff_delay(attempt);
            tracing::warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                kind = %err.kind(),
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for ResilientExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::agent_call(), RetryPolicy::cache_op())
    }
}

/// 等待被放弃时：调用方 drop 则中止任务；超时到期则先解除，任务留在后台
struct AbortOnDrop(Option<AbortHandle>);

impl AbortOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

/// 在独立任务中运行 call，并与 limit 竞速
async fn run_with_deadline<T, Fut>(limit: Duration, call: Fut) -> Result<T, CallError>
where
    Fut: Future<Output = Result<T, CallError>> + Send + 'static,
    T: Send + 'static,
{
    let mut handle = tokio::spawn(call);
    let mut guard = AbortOnDrop(Some(handle.abort_handle()));

    match tokio::time::timeout(limit, &mut handle).await {
        Ok(joined) => {
            guard.disarm();
            match joined {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => std::panic::resume_unwind(join_err.into_panic()),
                Err(_) => Err(CallError::Cancelled),
            }
        }
        Err(_) => {
            // 到期：放弃等待，drop JoinHandle 只会分离任务
            guard.disarm();
            Err(CallError::Timeout)
        }
    }
}
