//! 核心层：外部调用错误分类与弹性执行器（重试 + 悲观超时）

pub mod error;
pub mod resilience;

pub use error::{CallError, FailureKind};
pub use resilience::{Attempted, PolicyClass, ResilientExecutor, RetryPolicy};
