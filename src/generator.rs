use async_trait::async_trait;

use crate::db::DatabaseType;
use crate::error::Result;

/// Natural-language to SQL translation supplied by the AI layer.
///
/// The returned text is untrusted: the engine analyzes it and runs it
/// through the normal execution path.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    /// Service identifier, part of the prompt cache key.
    fn service_name(&self) -> &str;

    fn model(&self) -> &str;

    async fn generate_sql(&self, prompt: &str, schema: &str, dialect: DatabaseType) -> Result<String>;
}

/// Prompt size classification used in prompt cache keys.
pub fn complexity_level(prompt: &str) -> &'static str {
    let words = prompt.split_whitespace().count();
    match words {
        0..=12 => "simple",
        13..=40 => "moderate",
        _ => "complex",
    }
}
