//! Agent runtime - LLM orchestration over remotely discovered tools
//!
//! This crate is the engine behind every `/chat` request:
//! - Holds the conversation transcript and loop budget (`conversation`)
//! - Executes tool-call batches with dependency ordering, dedup and timeouts (`dispatcher`)
//! - Classifies tool failures and plans corrective actions (`recovery`)
//! - Rejects LLM text that leaks protocol or internal vocabulary (`guardrails`)
//! - Short-circuits name lookups from a shared reference cache (`cache`, `prefetch`)
//! - Reassembles streamed LLM output and relays progress (`streaming`, `notify`)
//!
//! # Architecture
//!
//! ```text
//! request → AgentRuntime ─┬─ LlmClient (turn)
//!                         ├─ Dispatcher → ToolRegistry → Tool::invoke
//!                         ├─ RecoveryPlanner
//!                         └─ ResponseValidator
//! ```
//!
//! The runtime never lets a tool failure escape as an error; only LLM provider
//! failures surface as `AgentError`.

pub mod cache;
pub mod conversation;
pub mod dispatcher;
pub mod guardrails;
pub mod llm;
pub mod notify;
pub mod prefetch;
pub mod prompt;
pub mod recovery;
pub mod runtime;
pub mod streaming;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;
