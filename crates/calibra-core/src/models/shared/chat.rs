//! Chat message types rendered through checkpoint chat templates.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_prompt_role(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One entry of a structured message's `content` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    /// Placeholder for the `index`-th image of the sample
    Image { index: usize },
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    /// A user turn showing one image followed by a question about it.
    pub fn image_question(question: &str) -> Self {
        Self {
            role: ChatRole::User,
            content: vec![
                ContentPart::Image { index: 0 },
                ContentPart::Text {
                    text: question.to_string(),
                },
            ],
        }
    }

    pub fn image_count(&self) -> usize {
        self.content
            .iter()
            .filter(|part| matches!(part, ContentPart::Image { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_question_serializes_as_typed_parts() {
        let message = ChatMessage::image_question("What is shown?");
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "role": "user",
                "content": [
                    {"type": "image", "index": 0},
                    {"type": "text", "text": "What is shown?"}
                ]
            })
        );
        assert_eq!(message.image_count(), 1);
    }
}
