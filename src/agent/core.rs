//! Core agent loop implementation.
//!
//! The loop is written once against `ChatProvider` and `ToolInvoker`; vendor
//! response shapes are already folded into `ModelTurn` by the time they get
//! here. Tool calls are resolved one at a time in the order the model emitted
//! them, and every call gets its result appended before the model is asked
//! again.

use crate::agent::conversation::{Conversation, Message};
use crate::config::DEFAULT_MAX_TURNS;
use crate::error::Result;
use crate::mcp::ToolInvoker;
use crate::vendors::{ChatProvider, ModelTurn, ToolCall, Usage};
use tracing::{debug, info, warn};

/// Configuration for the agent loop
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    /// Maximum model requests before a forced stop
    pub max_turns: usize,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
        }
    }
}

impl AgentLoopConfig {
    pub fn with_max_turns(mut self, n: usize) -> Self {
        self.max_turns = n;
        self
    }
}

/// Why the run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The model produced a final answer
    Answered,
    /// The model stopped for another reason (length, safety, ...); answer is empty
    SoftStop { reason: String },
    /// `max_turns` model requests were spent while tools were still being requested
    TurnLimit,
}

/// Request and token counters for one run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub model_requests: usize,
    pub tool_calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl RunStats {
    fn record_usage(&mut self, usage: Option<Usage>) {
        if let Some(usage) = usage {
            self.input_tokens += usage.input_tokens;
            self.output_tokens += usage.output_tokens;
        }
    }
}

/// Result of a complete agent run
#[derive(Debug, Clone)]
pub struct AgentOutcome<D> {
    pub answer: String,
    pub stop: StopReason,
    pub conversation: Conversation<D>,
    pub stats: RunStats,
}

enum LoopState {
    AwaitingModel,
    ResolvingTools(Vec<ToolCall>),
    Done { stop: StopReason, answer: String },
}

/// Run the agent loop for one user query.
///
/// Fetches the tool catalogue once, adapts it for the provider, then alternates
/// between model requests and tool resolution until the model answers, stops
/// for another reason, or `max_turns` is reached.
pub fn run_loop<P, T>(
    provider: &mut P,
    tools: &mut T,
    config: &AgentLoopConfig,
    user_input: &str,
) -> Result<AgentOutcome<P::Declaration>>
where
    P: ChatProvider,
    T: ToolInvoker,
{
    let catalogue = tools.list_tools()?;
    let declarations = provider.adapt_tools(&catalogue);
    info!(
        provider = provider.name(),
        tools = declarations.len(),
        max_turns = config.max_turns,
        "starting agent run"
    );

    let mut conversation = Conversation::new(user_input, declarations);
    let mut stats = RunStats::default();
    let mut state = LoopState::AwaitingModel;

    loop {
        state = match state {
            LoopState::AwaitingModel if stats.model_requests >= config.max_turns => {
                warn!(
                    max_turns = config.max_turns,
                    "turn limit reached with tool calls still being requested"
                );
                LoopState::Done {
                    stop: StopReason::TurnLimit,
                    answer: String::new(),
                }
            }

            LoopState::AwaitingModel => {
                debug_assert!(conversation.unresolved_calls().is_empty());
                stats.model_requests += 1;
                debug!(turn = stats.model_requests, "requesting model turn");

                let reply = provider.complete(&conversation)?;
                stats.record_usage(reply.usage);

                match reply.turn {
                    ModelTurn::Stop { text } => {
                        conversation.push(Message::Assistant {
                            text: Some(text.clone()),
                            tool_calls: Vec::new(),
                        });
                        LoopState::Done {
                            stop: StopReason::Answered,
                            answer: text,
                        }
                    }
                    ModelTurn::ToolCalls { text, calls } => {
                        if let Some(text) = text.as_deref().filter(|t| !t.is_empty()) {
                            debug!(content = %text, "model text alongside tool calls");
                        }
                        conversation.push(Message::Assistant {
                            text,
                            tool_calls: calls.clone(),
                        });
                        LoopState::ResolvingTools(calls)
                    }
                    ModelTurn::Halted { reason } => {
                        warn!(reason = %reason, "model stopped without an answer");
                        LoopState::Done {
                            stop: StopReason::SoftStop { reason },
                            answer: String::new(),
                        }
                    }
                }
            }

            LoopState::ResolvingTools(calls) => {
                for call in calls {
                    let arguments = call.arguments.parse(&call.name)?;
                    info!(tool = %call.name, call_id = %call.id, "calling tool");

                    let content = tools.call_tool(&call.name, &arguments)?;
                    stats.tool_calls += 1;
                    debug!(tool = %call.name, bytes = content.len(), "tool result");

                    conversation.push(Message::ToolResult {
                        call_id: call.id,
                        name: call.name,
                        content,
                    });
                }
                LoopState::AwaitingModel
            }

            LoopState::Done { stop, answer } => {
                info!(
                    model_requests = stats.model_requests,
                    tool_calls = stats.tool_calls,
                    "agent run finished"
                );
                return Ok(AgentOutcome {
                    answer,
                    stop,
                    conversation,
                    stats,
                });
            }
        };
    }
}
