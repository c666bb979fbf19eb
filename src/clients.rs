pub mod chat;

pub use chat::ChatCompletionsClient;
