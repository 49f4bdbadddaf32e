//! Conversation state for one agent run.

use crate::vendors::ToolCall;
use std::collections::HashSet;

/// Speaker of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    User {
        text: String,
    },
    Assistant {
        text: Option<String>,
        tool_calls: Vec<ToolCall>,
    },
    /// Output of one tool call, correlated by the call id
    ToolResult {
        call_id: String,
        name: String,
        content: String,
    },
}

impl Message {
    pub fn role(&self) -> Role {
        match self {
            Message::User { .. } => Role::User,
            Message::Assistant { .. } => Role::Assistant,
            Message::ToolResult { .. } => Role::Tool,
        }
    }
}

/// Append-only message history plus the declarations offered to the model.
#[derive(Debug, Clone)]
pub struct Conversation<D> {
    messages: Vec<Message>,
    tools: Vec<D>,
}

impl<D> Conversation<D> {
    pub fn new(user_input: &str, tools: Vec<D>) -> Self {
        Self {
            messages: vec![Message::User {
                text: user_input.to_string(),
            }],
            tools,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn tools(&self) -> &[D] {
        &self.tools
    }

    /// Ids of tool calls that have no result message yet
    pub fn unresolved_calls(&self) -> Vec<&str> {
        let resolved: HashSet<&str> = self
            .messages
            .iter()
            .filter_map(|m| match m {
                Message::ToolResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();

        self.messages
            .iter()
            .filter_map(|m| match m {
                Message::Assistant { tool_calls, .. } => Some(tool_calls),
                _ => None,
            })
            .flatten()
            .map(|call| call.id.as_str())
            .filter(|id| !resolved.contains(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vendors::ToolArguments;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: "foo".to_string(),
            arguments: ToolArguments::Raw("{}".to_string()),
            synthesized_id: false,
        }
    }

    #[test]
    fn test_new_starts_with_user_message() {
        let conversation: Conversation<()> = Conversation::new("hello", vec![]);
        assert_eq!(conversation.messages().len(), 1);
        assert_eq!(conversation.messages()[0].role(), Role::User);
    }

    #[test]
    fn test_unresolved_calls() {
        let mut conversation: Conversation<()> = Conversation::new("hi", vec![]);
        conversation.push(Message::Assistant {
            text: None,
            tool_calls: vec![call("a"), call("b")],
        });
        assert_eq!(conversation.unresolved_calls(), vec!["a", "b"]);

        conversation.push(Message::ToolResult {
            call_id: "a".to_string(),
            name: "foo".to_string(),
            content: "1".to_string(),
        });
        assert_eq!(conversation.unresolved_calls(), vec!["b"]);
    }
}
