pub mod analysis;
pub mod api;
pub mod config;
pub mod database;
pub mod errors;
pub mod fallback;
pub mod grouping;
pub mod llm_gateway;
pub mod llm_providers;
pub mod logging;
pub mod models;
pub mod result_cache;
pub mod sanitize;
pub mod transcription;

#[cfg(test)]
mod tests {
    mod api_endpoints_test;
}

pub use config::Config;
pub use database::Database;
pub use errors::{classify_database_error, ApiError, ErrorContext};
pub use grouping::GroupingEngine;
pub use llm_gateway::{ModelGateway, RetryPolicy};
pub use llm_providers::{extract_json_object, GenerationProvider};
pub use models::*;
pub use result_cache::ResultCache;
pub use transcription::TranscriptionEngine;
