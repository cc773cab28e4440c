pub mod client;
pub mod prompts;

pub use client::{ChatTurn, LanguageModel, LlmError, OpenAiChat, Role};
