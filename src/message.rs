use serde::{Deserialize, Serialize};

/// A single role-tagged entry in a conversation transcript.
///
/// Messages are the append-only unit of the workflow state: user input,
/// assistant output, system instructions, and tool feedback all travel
/// through the same shape so steps and persistence never need to special-case
/// them.
///
/// # Examples
///
/// ```
/// use turnloom::message::Message;
///
/// let user = Message::user("What's on my schedule today?");
/// let assistant = Message::assistant("Let me check your tasks.");
///
/// assert!(user.has_role(Message::USER));
/// assert!(!assistant.has_role(Message::USER));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// Role of the sender: `"user"`, `"assistant"`, `"system"`, or `"tool"`.
    pub role: String,
    /// Text content of the message.
    pub content: String,
}

impl Message {
    /// User input message role.
    pub const USER: &'static str = "user";
    /// Assistant response message role.
    pub const ASSISTANT: &'static str = "assistant";
    /// System prompt or instruction message role.
    pub const SYSTEM: &'static str = "system";
    /// Tool execution feedback message role.
    pub const TOOL: &'static str = "tool";

    /// Creates a new message with the specified role and content.
    #[must_use]
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    /// Creates a user message.
    #[must_use]
    pub fn user(content: &str) -> Self {
        Self::new(Self::USER, content)
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(content: &str) -> Self {
        Self::new(Self::ASSISTANT, content)
    }

    /// Creates a system message.
    #[must_use]
    pub fn system(content: &str) -> Self {
        Self::new(Self::SYSTEM, content)
    }

    /// Creates a tool-feedback message.
    #[must_use]
    pub fn tool(content: &str) -> Self {
        Self::new(Self::TOOL, content)
    }

    /// Returns true if this message has the given role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.role == role
    }
}
