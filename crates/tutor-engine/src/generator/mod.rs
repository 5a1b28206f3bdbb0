use image::DynamicImage;
use tutor_contracts::conversation::{Conversation, Role};

use crate::error::GenerationError;

mod openai;

pub use openai::{OpenAiGenerator, DEFAULT_MODEL as DEFAULT_OPENAI_MODEL};

/// Produces one tutor reply for a conversation about one image.
///
/// Implementations are shared by every session (`Arc<dyn Generator>`) and
/// called from worker threads, so they must be safe for concurrent calls.
/// `generate` may block for seconds.
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(
        &self,
        conversation: &Conversation,
        image: &DynamicImage,
    ) -> Result<String, GenerationError>;
}

/// Offline generator that answers every question with a fixed guiding
/// prompt. Useful for wiring checks without a model.
#[derive(Debug, Clone, Default)]
pub struct DryrunGenerator;

impl Generator for DryrunGenerator {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(
        &self,
        conversation: &Conversation,
        image: &DynamicImage,
    ) -> Result<String, GenerationError> {
        let question = conversation
            .question()
            .ok_or_else(|| GenerationError::failed("conversation has no question"))?;
        let prior_tutor_turns = conversation
            .messages()
            .iter()
            .filter(|message| message.role == Role::Tutor)
            .count();
        let opener = if prior_tutor_turns == 0 {
            "Let's work through it together."
        } else {
            "Good, keep going."
        };
        Ok(format!(
            "{opener} You asked: \"{question}\". Looking at the {}x{} image, what is the first \
thing you notice that could help?",
            image.width(),
            image.height()
        ))
    }
}
