use crate::config::prompt::{ build_batch_prompt, build_chat_instruction };
use crate::config::template::ConversationTemplate;
use crate::console::ChatIo;
use crate::llm::generation::{ extract_response, GenerationRequest, LanguageModel };
use crate::models::chat::{ echo_skip_len, Role };
use crate::rag::{ retrieve_top_document, VectorStore };

use log::{ debug, info };
use serde_json::json;
use std::error::Error;
use std::sync::Arc;

pub const EXIT_NOTICE: &str = "exit...";

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub temperature: f64,
    pub max_new_tokens: usize,
    pub debug: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_new_tokens: 700,
            debug: false,
        }
    }
}

/// Grounds every request in the closest API document before handing it to the model.
#[derive(Clone)]
pub struct CodeAgent {
    model: Arc<dyn LanguageModel>,
    vector_store: Arc<dyn VectorStore>,
    template: ConversationTemplate,
    settings: ChatSettings,
}

impl CodeAgent {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        vector_store: Arc<dyn VectorStore>,
        template: ConversationTemplate,
        settings: ChatSettings
    ) -> Self {
        Self {
            model,
            vector_store,
            template,
            settings,
        }
    }

    /// Interactive session; returns when the user submits an empty line or input ends.
    pub async fn chat_loop<I>(&self, io: &mut I) -> Result<(), Box<dyn Error + Send + Sync>>
        where I: ChatIo + ?Sized
    {
        let mut conversation = self.template.start()?;
        info!("Chat session started with template '{}'", self.template.name);

        loop {
            let input = io.prompt_for_input(conversation.role_label(Role::User)).await?;
            if input.is_empty() {
                io.notify(EXIT_NOTICE).await?;
                info!("Chat session ended after {} turns", conversation.turns.len());
                return Ok(());
            }

            let document = retrieve_top_document(self.vector_store.as_ref(), &input).await?;
            let instruction = build_chat_instruction(&input, &document.page_content)?;
            conversation.append(Role::User, Some(instruction))?;
            conversation.append(Role::Assistant, None)?;

            let prompt = conversation.render();
            let skip_echo_len = echo_skip_len(&prompt);
            let request = GenerationRequest::chat(prompt.as_str(), conversation.stop_sequence())
                .with_temperature(self.settings.temperature)
                .with_max_new_tokens(self.settings.max_new_tokens);

            io.prompt_for_output(conversation.role_label(Role::Assistant)).await?;
            let stream = self.model.generate_stream(request).await?;
            let outputs = io.stream_output(stream, skip_echo_len).await?;
            // the model was tuned on stripped replies
            conversation.close_last_turn(&outputs)?;

            if self.settings.debug {
                debug!("{}", json!({ "prompt": prompt, "outputs": outputs }));
            }
        }
    }

    /// One-shot generation without conversation history.
    pub async fn batch_inference(&self, query: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let document = retrieve_top_document(self.vector_store.as_ref(), query).await?;
        let prompt = build_batch_prompt(query, &document.page_content)?;
        if self.settings.debug {
            debug!("--- Batch Prompt ---\n{}\n--------------------", prompt);
        }
        let decoded = self.model.generate(GenerationRequest::batch(prompt)).await?;
        Ok(extract_response(&decoded)?)
    }
}
