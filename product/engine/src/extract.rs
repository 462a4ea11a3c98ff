use crate::http::redact_url_for_log;
use crate::{EngineError, Result};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_BATCH_SIZE: usize = 3;
pub const DEFAULT_MAX_IMAGES: usize = 9;
pub const DEFAULT_IMAGE_EXTENSIONS: &[&str] = &[".jpg", ".png", ".jpeg"];

/// Checked in priority order; the first non-empty value wins.
const IMAGE_SOURCE_ATTRS: &[&str] = &["src", "data-src", "data-lazy-src"];

/// Anything that can hand back the HTML of a page.
pub trait PageSource {
    fn fetch_html(&self, url: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtensionFilterMode {
    Off,
    #[default]
    CaseSensitive,
    CaseInsensitive,
}

impl ExtensionFilterMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtensionFilterMode::Off => "off",
            ExtensionFilterMode::CaseSensitive => "case_sensitive",
            ExtensionFilterMode::CaseInsensitive => "case_insensitive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionFilter {
    pub mode: ExtensionFilterMode,
    pub extensions: Vec<String>,
}

impl Default for ExtensionFilter {
    fn default() -> Self {
        Self {
            mode: ExtensionFilterMode::default(),
            extensions: DEFAULT_IMAGE_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
        }
    }
}

impl ExtensionFilter {
    pub fn off() -> Self {
        Self {
            mode: ExtensionFilterMode::Off,
            ..Self::default()
        }
    }

    /// Suffix test against the URL path, so query strings and fragments never
    /// hide an extension.
    pub fn accepts(&self, url: &str) -> bool {
        if self.mode == ExtensionFilterMode::Off {
            return true;
        }
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let path = parsed.path();
        match self.mode {
            ExtensionFilterMode::Off => true,
            ExtensionFilterMode::CaseSensitive => {
                self.extensions.iter().any(|ext| path.ends_with(ext.as_str()))
            }
            ExtensionFilterMode::CaseInsensitive => {
                let lowered = path.to_ascii_lowercase();
                self.extensions
                    .iter()
                    .any(|ext| lowered.ends_with(&ext.to_ascii_lowercase()))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractOptions {
    pub max_images: usize,
    pub batch_size: usize,
    pub filter: ExtensionFilter,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            max_images: DEFAULT_MAX_IMAGES,
            batch_size: DEFAULT_BATCH_SIZE,
            filter: ExtensionFilter::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBatch {
    pub order: usize,
    pub urls: Vec<String>,
}

/// Fetch `page_url` and turn its images into ordered, fixed-size batches of
/// absolute URLs.
pub fn extract<S>(source: &S, page_url: &str, options: &ExtractOptions) -> Result<Vec<ImageBatch>>
where
    S: PageSource + ?Sized,
{
    validate_options(options)?;
    let base_url = parse_page_url(page_url)?;
    let html = source.fetch_html(base_url.as_str())?;
    tracing::debug!(
        url = %redact_url_for_log(base_url.as_str()),
        bytes = html.len(),
        "extract_page_fetched"
    );
    Ok(extract_from_document_html(&html, &base_url, options))
}

/// Same as [`extract`] but over HTML already in hand.
pub fn extract_from_html(
    html: &str,
    page_url: &str,
    options: &ExtractOptions,
) -> Result<Vec<ImageBatch>> {
    validate_options(options)?;
    let base_url = parse_page_url(page_url)?;
    Ok(extract_from_document_html(html, &base_url, options))
}

fn extract_from_document_html(
    html: &str,
    base_url: &Url,
    options: &ExtractOptions,
) -> Vec<ImageBatch> {
    let document = Html::parse_document(html);
    let candidates = extract_candidate_urls(&document, base_url);
    let candidate_count = candidates.len();

    let mut filtered: Vec<String> = candidates
        .into_iter()
        .filter(|url| options.filter.accepts(url))
        .collect();
    let filtered_count = filtered.len();
    filtered.truncate(options.max_images);

    let batches = batch_urls(filtered, options.batch_size);
    tracing::info!(
        url = %redact_url_for_log(base_url.as_str()),
        candidates = candidate_count,
        filtered = filtered_count,
        kept = batches.iter().map(|b| b.urls.len()).sum::<usize>(),
        batches = batches.len(),
        filter = options.filter.mode.as_str(),
        "extract_images_batched"
    );
    batches
}

/// Every `img` element in document order, resolved to an absolute URL.
pub fn extract_candidate_urls(document: &Html, base_url: &Url) -> Vec<String> {
    let selector_img = match Selector::parse("img") {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    let mut out: Vec<String> = Vec::new();
    for img in document.select(&selector_img) {
        let Some(raw) = select_image_source(img) else {
            continue;
        };
        let Some(resolved) = resolve_image_url(raw, base_url) else {
            continue;
        };
        out.push(resolved);
    }
    out
}

pub fn select_image_source<'a>(element: ElementRef<'a>) -> Option<&'a str> {
    IMAGE_SOURCE_ATTRS.iter().find_map(|attr| {
        element
            .value()
            .attr(attr)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    })
}

/// Absolute http(s) sources pass through untouched; everything else is joined
/// onto `base_url` and must land on http(s).
pub fn resolve_image_url(raw: &str, base_url: &Url) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return Some(raw.to_string());
    }
    let joined = base_url.join(raw).ok()?;
    if !matches!(joined.scheme(), "http" | "https") {
        return None;
    }
    Some(joined.to_string())
}

/// Batch `k` covers positions `[k * batch_size, (k + 1) * batch_size)`.
pub fn batch_urls(urls: Vec<String>, batch_size: usize) -> Vec<ImageBatch> {
    let batch_size = batch_size.max(1);
    urls.chunks(batch_size)
        .enumerate()
        .map(|(order, chunk)| ImageBatch {
            order,
            urls: chunk.to_vec(),
        })
        .collect()
}

fn validate_options(options: &ExtractOptions) -> Result<()> {
    if options.batch_size == 0 {
        return Err(EngineError::Validation(
            "batch size must be a positive integer".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn parse_page_url(page_url: &str) -> Result<Url> {
    let trimmed = page_url.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation("empty URL provided".to_string()));
    }
    let parsed = Url::parse(trimmed)
        .map_err(|_| EngineError::Validation("invalid URL format".to_string()))?;
    match parsed.scheme() {
        "http" | "https" => {}
        _ => {
            return Err(EngineError::Validation(format!(
                "unsupported URL scheme for {}; only http/https are allowed",
                redact_url_for_log(trimmed)
            )));
        }
    }
    if parsed.host_str().is_none() {
        return Err(EngineError::Validation(format!(
            "URL is missing host: {}",
            redact_url_for_log(trimmed)
        )));
    }
    Ok(parsed)
}
