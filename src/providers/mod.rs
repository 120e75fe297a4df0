//! Concrete provider adapters.
//!
//! Each adapter turns one vendor's streaming wire dialect into the
//! [`crate::model::StreamEvent`] sequence the scheduler consumes, and
//! classifies that vendor's errors into the crate error taxonomy.

pub mod anthropic;

use crate::error::{Error, Result};
use crate::provider::{ModelSpec, Provider};
use std::sync::Arc;

/// Build a provider for a catalog entry.
pub fn create_provider(spec: &ModelSpec) -> Result<Arc<dyn Provider>> {
    match spec.provider {
        "anthropic" => Ok(Arc::new(anthropic::AnthropicProvider::new(spec))),
        other => Err(Error::config(format!("unknown provider: {other}"))),
    }
}
