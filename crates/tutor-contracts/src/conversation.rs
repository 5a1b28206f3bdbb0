use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    Student,
    Tutor,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Student => "student",
            Self::Tutor => "tutor",
        }
    }
}

/// One role-tagged utterance kept in session history. Text only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn student(text: impl Into<String>) -> Self {
        Self {
            role: Role::Student,
            text: text.into(),
        }
    }

    pub fn tutor(text: impl Into<String>) -> Self {
        Self {
            role: Role::Tutor,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    /// Set on the message the reference image belongs to.
    #[serde(default)]
    pub attaches_image: bool,
}

/// Ordered prompt handed to a generator: directive, prior turns, then the
/// new student question carrying the image reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    messages: Vec<ConversationMessage>,
}

impl Conversation {
    pub fn new(directive: &str, history: &[Turn], question: &str) -> Self {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ConversationMessage {
            role: Role::System,
            content: directive.to_string(),
            attaches_image: false,
        });
        messages.extend(history.iter().map(|turn| ConversationMessage {
            role: turn.role,
            content: turn.text.clone(),
            attaches_image: false,
        }));
        messages.push(ConversationMessage {
            role: Role::Student,
            content: question.to_string(),
            attaches_image: true,
        });
        Self { messages }
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn directive(&self) -> Option<&str> {
        self.messages
            .first()
            .filter(|message| message.role == Role::System)
            .map(|message| message.content.as_str())
    }

    pub fn question(&self) -> Option<&str> {
        self.messages
            .last()
            .filter(|message| message.attaches_image)
            .map(|message| message.content.as_str())
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
