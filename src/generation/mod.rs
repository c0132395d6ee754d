//! Generation module - prompt construction, model client and the ask pipeline

pub mod answer;
pub mod llm;
pub mod prompt;

pub use answer::{
    AnswerGenerator, AnswerOptions, AnswerResult, AnswerStatus, AskError, AskFailure, DegradedStage,
    Stage,
};
pub use llm::{Generation, GenerationClient, GenerationConfig, OllamaGenerator};
pub use prompt::{format_prompt, INSUFFICIENT_CONTEXT_ANSWER, SYSTEM_PROMPT};
