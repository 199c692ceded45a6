use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::ModelClient;
use trellis_core::types::{GenerateRequest, Generation, Role, Usage};
use trellis_engine::profile::estimate_tokens;

/// Model that replays canned responses in order.
///
/// A script is a JSON array. String items come back as text, anything else
/// as structured output. Once the script runs out, the model echoes the
/// prompt it was given.
pub struct ReplayModel {
    responses: Mutex<VecDeque<serde_json::Value>>,
}

impl ReplayModel {
    pub fn new(responses: Vec<serde_json::Value>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let responses: Vec<serde_json::Value> = serde_json::from_str(&content)?;
        debug!(path = %path.display(), responses = responses.len(), "Loaded replay script");
        Ok(Self::new(responses))
    }
}

impl ModelClient for ReplayModel {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<Generation>> {
        Box::pin(async move {
            let prompt = request
                .context
                .messages
                .iter()
                .rev()
                .find(|m| m.role == Role::User)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let input_tokens = estimate_tokens(&request.context.system)
                + request
                    .context
                    .messages
                    .iter()
                    .map(|m| estimate_tokens(&m.content))
                    .sum::<usize>();

            let next = self
                .responses
                .lock()
                .map_err(|e| TrellisError::ModelRequest(e.to_string()))?
                .pop_front();
            let generation = match next {
                Some(serde_json::Value::String(text)) => {
                    let usage = Usage::new(input_tokens as u64, estimate_tokens(&text) as u64);
                    Generation::text(text, usage)
                }
                Some(value) => {
                    let usage = Usage::new(input_tokens as u64, estimate_tokens(&value.to_string()) as u64);
                    Generation::structured(value, usage)
                }
                None => {
                    debug!("Replay script exhausted, echoing prompt");
                    let usage = Usage::new(input_tokens as u64, estimate_tokens(&prompt) as u64);
                    Generation::text(prompt, usage)
                }
            };
            Ok(generation)
        })
    }
}
