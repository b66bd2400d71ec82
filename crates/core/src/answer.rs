use crate::context::{build_context, numbered_sources, source_labels};
use crate::generation::{ChatMessage, ChatModel, ChatRequest};
use crate::retrieval::Retriever;
use crate::structured::{parse_answer, ParsedAnswer};
use crate::{RetrievalHit, ServiceError};
use async_stream::try_stream;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tracing::info;

pub const SYSTEM_PROMPT: &str = concat!(
    "You are the official assistant for this organization's documents.\n",
    "Answer ONLY using the provided context.\n\n",
    "Return ONLY valid JSON in this exact shape:\n",
    "{\n",
    "  \"answer_markdown\": \"string (markdown)\",\n",
    "  \"citations\": [\"[1]\", \"[2]\"]\n",
    "}\n\n",
    "FORMATTING RULES:\n",
    "- If the answer is short (one person, one fact, one sentence), respond in a clean natural sentence.\n",
    "- Do NOT use bullet points for simple answers.\n",
    "- If the answer contains multiple items (pricing, features, steps, services, policies), use clean markdown bullets.\n",
    "- Use section headers ONLY when helpful.\n",
    "- Keep responses human, natural, and professional.\n",
    "- Do NOT mention chunks or sources inside the answer text.\n",
    "- Always include citations at the end like [1][2], numbered as in the context.\n",
    "- If the answer is not in the context, say you don't have that information.\n",
    "- Never invent information.\n",
);

pub const DEFAULT_TEMPERATURE: f32 = 0.2;

#[derive(Debug, Clone)]
pub struct AnswerOptions {
    pub temperature: f32,
    pub system_prompt: String,
}

impl Default for AnswerOptions {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            system_prompt: SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Raw model output of a blocking call together with the hits it was grounded on.
#[derive(Debug, Clone)]
pub struct Answer {
    pub raw: String,
    pub hits: Vec<RetrievalHit>,
}

impl Answer {
    pub fn parsed(&self) -> ParsedAnswer {
        parse_answer(&self.raw)
    }

    /// `<source> (chunk <n>)` per hit.
    pub fn sources(&self) -> Vec<String> {
        source_labels(&self.hits)
    }
}

/// Events of a streamed answer: tokens, then exactly one `Sources`, then `Done`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token(String),
    Sources(Vec<String>),
    Done,
}

pub struct AnswerGenerator {
    retriever: Retriever,
    model: Arc<dyn ChatModel>,
    options: AnswerOptions,
}

impl AnswerGenerator {
    pub fn new(retriever: Retriever, model: Arc<dyn ChatModel>, options: AnswerOptions) -> Self {
        Self {
            retriever,
            model,
            options,
        }
    }

    pub fn build_request(&self, question: &str, hits: &[RetrievalHit]) -> ChatRequest {
        let context = build_context(hits);
        ChatRequest {
            messages: vec![
                ChatMessage::system(self.options.system_prompt.clone()),
                ChatMessage::user(format!("Question: {question}\n\nContext:\n{context}")),
            ],
            temperature: self.options.temperature,
        }
    }

    pub async fn answer(&self, question: &str, k: usize) -> Result<Answer, ServiceError> {
        let hits = self.retriever.retrieve(question, k).await?;
        let request = self.build_request(question, &hits);

        let raw = self.model.complete(&request).await?;
        info!(hits = hits.len(), chars = raw.len(), "answer generated");
        Ok(Answer { raw, hits })
    }

    /// Retrieves and opens the generation stream eagerly; failures there are
    /// returned directly, failures mid-stream arrive as `Err` items.
    ///
    /// Dropping the stream is the only way to cancel it.
    pub async fn stream_answer(
        &self,
        question: &str,
        k: usize,
    ) -> Result<impl Stream<Item = Result<StreamEvent, ServiceError>> + Send + 'static, ServiceError> {
        let hits = self.retriever.retrieve(question, k).await?;
        let request = self.build_request(question, &hits);
        let mut tokens = self.model.stream(&request).await?;

        Ok(try_stream! {
            while let Some(token) = tokens.next().await {
                yield StreamEvent::Token(token?);
            }
            yield StreamEvent::Sources(numbered_sources(&hits));
            yield StreamEvent::Done;
        })
    }
}
