#![allow(clippy::module_name_repetitions)]

pub mod clients;
pub mod config;
pub mod dataset;
pub mod model;
pub mod observability;
pub mod pipeline;
pub mod util;
