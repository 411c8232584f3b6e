//! Agent 运行时对接：协议类型、HTTP / Mock 运行时、单轮对话客户端

pub mod http;
pub mod mock;
pub mod protocol;
pub mod turn;

pub use http::HttpAgentRuntime;
pub use mock::{MockAgentRuntime, MockOp, RunScript, ScriptedReply};
pub use protocol::{
    AgentRuntime, ListOrder, MessageContent, MessageList, MessageObject, MessageRole,
    RunLastError, RunObject, RunStatus, ThreadObject,
};
pub use turn::{
    AgentRun, AgentTurnClient, PollSchedule, RunPhase, TurnError, TurnOutcome, TurnReply,
    TurnSettings, TurnStage,
};
