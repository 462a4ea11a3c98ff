use crate::extract::ImageBatch;
use crate::storage::{join_key, ObjectStore};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};

pub const BATCH_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedBatch {
    pub order: usize,
    pub key: String,
    pub urls: Vec<String>,
}

/// `<prefix>/<request_id>-<order>.json`
pub fn batch_object_key(prefix: &str, request_id: &str, order: usize) -> String {
    join_key(prefix, &format!("{request_id}-{order}.json"))
}

/// Writes each batch as a JSON array of URL strings. Stops at the first
/// storage failure.
pub fn stage_batches(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    request_id: &str,
    batches: &[ImageBatch],
) -> Result<Vec<StagedBatch>> {
    let request_id = validate_request_id(request_id)?;

    let mut staged = Vec::with_capacity(batches.len());
    for batch in batches {
        let key = batch_object_key(prefix, request_id, batch.order);
        let body = serde_json::to_vec(&batch.urls)?;
        store
            .put_object(bucket, &key, &body, BATCH_CONTENT_TYPE)
            .map_err(|e| match e {
                EngineError::Upload { .. } => e,
                other => EngineError::Upload {
                    key: key.clone(),
                    message: other.to_string(),
                },
            })?;
        tracing::info!(
            bucket,
            key = %key,
            order = batch.order,
            count = batch.urls.len(),
            "batch_staged"
        );
        staged.push(StagedBatch {
            order: batch.order,
            key,
            urls: batch.urls.clone(),
        });
    }
    Ok(staged)
}

/// Parses a staged batch object back into its URL list.
pub fn parse_batch_object(body: &[u8]) -> Result<Vec<String>> {
    serde_json::from_slice::<Vec<String>>(body)
        .map_err(|e| EngineError::Parse(format!("batch object is not a JSON array of URLs: {e}")))
}

fn validate_request_id(request_id: &str) -> Result<&str> {
    let trimmed = request_id.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation("request id is empty".to_string()));
    }
    if trimmed.contains('/') || trimmed.contains('\\') {
        return Err(EngineError::Validation(format!(
            "request id must not contain path separators: {trimmed:?}"
        )));
    }
    Ok(trimmed)
}
