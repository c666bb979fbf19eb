pub mod error;
pub mod retry;
pub mod similarity;
pub mod text;
