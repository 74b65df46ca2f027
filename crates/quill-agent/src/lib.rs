pub mod model;
pub mod prompt;
pub mod worker;

pub use model::{ChatMessage, ChatModel, OpenAiCompatClient, Sampling};
pub use worker::{WorkOutcome, Worker};
