use crate::config::PipelineConfig;
use crate::extract::{extract, PageSource};
use crate::http::redact_url_for_log;
use crate::recognition::{ImageOutcome, Recognizer};
use crate::staging::stage_batches;
use crate::storage::ObjectStore;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub const CORS_HEADERS: &[(&str, &str)] = &[
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "POST, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type"),
];

const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// HTTP-proxy style response: status, CORS headers and a JSON string body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl InvocationResponse {
    pub fn body_json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

pub fn generate_response(body: &Value, status_code: u16) -> InvocationResponse {
    InvocationResponse {
        status_code,
        headers: CORS_HEADERS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        body: body.to_string(),
    }
}

pub fn preflight_response() -> InvocationResponse {
    generate_response(&json!({}), 200)
}

/// Runtime facts about the current invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    pub request_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpEvent {
    #[serde(default)]
    http_method: Option<String>,
    #[serde(default)]
    request_context: Option<RequestContext>,
    #[serde(default)]
    body: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestContext {
    #[serde(default)]
    http: Option<HttpDescription>,
}

#[derive(Debug, Default, Deserialize)]
struct HttpDescription {
    #[serde(default)]
    method: Option<String>,
}

impl HttpEvent {
    fn method(&self) -> Option<&str> {
        self.request_context
            .as_ref()
            .and_then(|ctx| ctx.http.as_ref())
            .and_then(|http| http.method.as_deref())
            .or(self.http_method.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CrawlRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub max_images: Option<usize>,
    #[serde(default)]
    pub batch_size: Option<usize>,
}

/// Collaborators for the crawl entry point.
pub struct CrawlService<'a> {
    pub pages: &'a dyn PageSource,
    pub store: &'a dyn ObjectStore,
    pub config: &'a PipelineConfig,
}

/// Extracts images from the requested page and stages them as batches.
pub fn handle_crawl_request(
    event: &Value,
    ctx: &InvocationContext,
    service: &CrawlService<'_>,
) -> InvocationResponse {
    let parsed: HttpEvent = match serde_json::from_value(event.clone()) {
        Ok(v) => v,
        Err(e) => return validation_response(&format!("malformed event: {e}")),
    };
    tracing::info!(
        method = parsed.method().unwrap_or("-"),
        has_body = parsed.body.is_some(),
        "crawl_request_received"
    );
    if parsed
        .method()
        .is_some_and(|m| m.eq_ignore_ascii_case("OPTIONS"))
    {
        return preflight_response();
    }

    match run_crawl(parsed, ctx, service) {
        Ok(body) => generate_response(&body, 200),
        Err(err) => error_response(err),
    }
}

fn run_crawl(event: HttpEvent, ctx: &InvocationContext, service: &CrawlService<'_>) -> Result<Value> {
    let request = parse_crawl_body(event.body)?;
    let target_url = request
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| {
            EngineError::Validation("URL data is required in the request body".to_string())
        })?;

    let mut options = service.config.extract_options();
    if let Some(max_images) = request.max_images {
        options.max_images = max_images;
    }
    if let Some(batch_size) = request.batch_size {
        options.batch_size = batch_size;
    }

    let request_id = request
        .request_id
        .clone()
        .or_else(|| ctx.request_id.clone())
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let batches = extract(service.pages, target_url, &options)?;
    let staged = stage_batches(
        service.store,
        &service.config.bucket,
        &service.config.batch_prefix,
        &request_id,
        &batches,
    )?;
    tracing::info!(
        url = %redact_url_for_log(target_url),
        request_id = %request_id,
        batches = staged.len(),
        "crawl_request_staged"
    );

    let image_count: usize = staged.iter().map(|s| s.urls.len()).sum();
    Ok(json!({
        "request_id": request_id,
        "image_count": image_count,
        "batches": staged
            .iter()
            .map(|s| json!({"order": s.order, "key": s.key, "count": s.urls.len()}))
            .collect::<Vec<_>>(),
    }))
}

fn parse_crawl_body(body: Option<Value>) -> Result<CrawlRequest> {
    let value = match body {
        None | Some(Value::Null) => {
            return Err(EngineError::Validation(
                "request body is required".to_string(),
            ))
        }
        Some(Value::String(raw)) => {
            if raw.trim().is_empty() {
                return Err(EngineError::Validation(
                    "request body is required".to_string(),
                ));
            }
            serde_json::from_str::<Value>(&raw).map_err(|e| {
                EngineError::Validation(format!("request body is not valid JSON: {e}"))
            })?
        }
        Some(other) => other,
    };
    serde_json::from_value(value)
        .map_err(|e| EngineError::Validation(format!("invalid request body: {e}")))
}

#[derive(Debug, Deserialize)]
struct StorageEvent {
    #[serde(rename = "Records", default)]
    records: Vec<StorageRecord>,
}

#[derive(Debug, Deserialize)]
struct StorageRecord {
    s3: StorageEntity,
}

#[derive(Debug, Deserialize)]
struct StorageEntity {
    bucket: BucketRef,
    object: ObjectRef,
}

#[derive(Debug, Deserialize)]
struct BucketRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectRef {
    key: String,
}

/// Collaborators for the storage-notification entry point.
pub struct NotificationService<'a> {
    pub store: &'a dyn ObjectStore,
    pub recognizer: &'a Recognizer<'a>,
    pub recognized_prefix: &'a str,
}

/// Runs recognition over every batch object named in a storage-write event.
pub fn handle_storage_notification(
    event: &Value,
    service: &NotificationService<'_>,
) -> InvocationResponse {
    let parsed: StorageEvent = match serde_json::from_value(event.clone()) {
        Ok(v) => v,
        Err(e) => return validation_response(&format!("malformed storage event: {e}")),
    };
    tracing::info!(
        records = parsed.records.len(),
        "storage_notification_received"
    );
    if parsed.records.is_empty() {
        return validation_response("storage event has no records");
    }

    let mut processed = 0_usize;
    let mut stored: Vec<String> = Vec::new();
    let mut skipped = 0_usize;
    for record in parsed.records {
        let bucket = record.s3.bucket.name;
        let key = match decode_object_key(&record.s3.object.key) {
            Ok(key) => key,
            Err(err) => return error_response(err),
        };
        tracing::info!(bucket = %bucket, key = %key, "batch_object_notified");

        let outcomes = match service.recognizer.process_batch_object(
            service.store,
            &bucket,
            &key,
            service.recognized_prefix,
        ) {
            Ok(v) => v,
            Err(err) => return error_response(err),
        };
        for outcome in &outcomes {
            processed += 1;
            if let Some(key) = outcome.stored_key() {
                stored.push(key.to_string());
            } else if !matches!(outcome, ImageOutcome::NoMatch { .. }) {
                skipped += 1;
            }
        }
    }

    generate_response(
        &json!({
            "processed": processed,
            "stored": stored,
            "skipped": skipped,
        }),
        200,
    )
}

/// Notification keys arrive form-encoded (`+` for space, `%XX` escapes).
fn decode_object_key(raw: &str) -> Result<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|key| key.into_owned())
        .map_err(|_| EngineError::Validation(format!("object key is not valid UTF-8: {raw:?}")))
}

fn validation_response(message: &str) -> InvocationResponse {
    tracing::warn!(error = %message, "validation_error");
    generate_response(&json!({ "error": message }), 400)
}

fn error_response(err: EngineError) -> InvocationResponse {
    match err {
        EngineError::Validation(message) => validation_response(&message),
        other => {
            tracing::error!(kind = other.kind(), error = %other, "processing_error");
            generate_response(&json!({ "error": INTERNAL_ERROR_MESSAGE }), 500)
        }
    }
}
