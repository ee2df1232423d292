pub mod batch;
pub mod export;
pub mod generation;
pub mod llm;
pub mod prompts;
pub mod schema;
pub mod setup;
pub mod studio;
