use crate::http::redact_url_for_log;
use crate::staging::parse_batch_object;
use crate::storage::{join_key, ObjectStore};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;

pub const RECOGNIZED_IMAGE_CONTENT_TYPE: &str = "image/jpeg";
const MAX_DETECTOR_RESPONSE_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub label: String,
    /// 0-100, as reported by the detector.
    pub confidence: f32,
}

pub trait SubjectDetector {
    /// Subjects in the order the service reports them.
    fn detect_subjects(&self, image: &[u8]) -> Result<Vec<Subject>>;
}

pub trait ImageSource {
    fn fetch_image(&self, url: &str) -> Result<Vec<u8>>;
}

/// Names an image after its subjects when exactly `required_subjects` were
/// detected, e.g. `A_B.jpg` for the default pair rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingRule {
    pub required_subjects: usize,
    pub separator: String,
    pub extension: String,
}

impl Default for NamingRule {
    fn default() -> Self {
        Self {
            required_subjects: 2,
            separator: "_".to_string(),
            extension: ".jpg".to_string(),
        }
    }
}

impl NamingRule {
    pub fn file_name(&self, subjects: &[Subject]) -> Option<String> {
        if self.required_subjects == 0 || subjects.len() != self.required_subjects {
            return None;
        }
        let stem = subjects
            .iter()
            .map(|s| s.label.as_str())
            .collect::<Vec<_>>()
            .join(&self.separator);
        Some(format!("{stem}{}", self.extension))
    }
}

/// Talks to a recognition endpoint that accepts raw image bytes and answers
/// with `{"CelebrityFaces": [{"Name": .., "MatchConfidence": ..}]}`.
#[derive(Clone)]
pub struct HttpSubjectDetector {
    agent: ureq::Agent,
    endpoint: String,
    token: Option<String>,
}

impl HttpSubjectDetector {
    pub fn new(agent: ureq::Agent, endpoint: &str, token: Option<String>) -> Result<Self> {
        let endpoint = endpoint.trim();
        let parsed = url::Url::parse(endpoint).map_err(|_| {
            EngineError::Validation("detector endpoint is not a valid URL".to_string())
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(EngineError::Validation(
                "detector endpoint must be http(s)".to_string(),
            ));
        }
        Ok(Self {
            agent,
            endpoint: endpoint.to_string(),
            token,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RecognizeResponse {
    #[serde(default)]
    celebrity_faces: Vec<CelebrityFace>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CelebrityFace {
    name: String,
    #[serde(default)]
    match_confidence: f32,
}

impl SubjectDetector for HttpSubjectDetector {
    fn detect_subjects(&self, image: &[u8]) -> Result<Vec<Subject>> {
        let mut request = self
            .agent
            .post(self.endpoint.as_str())
            .header("Content-Type", "application/octet-stream");
        if let Some(token) = self.token.as_deref() {
            request = request.header("Authorization", format!("Bearer {token}"));
        }
        let mut response = request
            .send(image)
            .map_err(|e| EngineError::Recognition(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Recognition(format!(
                "detector at {} returned status {}",
                redact_url_for_log(&self.endpoint),
                status.as_u16()
            )));
        }

        let mut buf = Vec::new();
        response
            .body_mut()
            .as_reader()
            .take(MAX_DETECTOR_RESPONSE_BYTES)
            .read_to_end(&mut buf)
            .map_err(|e| EngineError::Recognition(format!("failed to read detector body: {e}")))?;
        parse_detector_response(&buf)
    }
}

fn parse_detector_response(body: &[u8]) -> Result<Vec<Subject>> {
    let parsed: RecognizeResponse = serde_json::from_slice(body)
        .map_err(|e| EngineError::Recognition(format!("malformed detector response: {e}")))?;
    Ok(parsed
        .celebrity_faces
        .into_iter()
        .map(|face| Subject {
            label: face.name,
            confidence: face.match_confidence,
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageOutcome {
    Stored {
        url: String,
        key: String,
        subjects: Vec<Subject>,
    },
    NoMatch {
        url: String,
        subjects: Vec<Subject>,
    },
    FetchFailed {
        url: String,
        error: String,
    },
    DetectFailed {
        url: String,
        error: String,
    },
    UploadFailed {
        url: String,
        key: String,
        error: String,
    },
}

impl ImageOutcome {
    pub fn stored_key(&self) -> Option<&str> {
        match self {
            ImageOutcome::Stored { key, .. } => Some(key.as_str()),
            _ => None,
        }
    }
}

/// Per-image outcome of a direct (unstaged) recognition run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizedImage {
    pub url: String,
    pub subjects: Option<Vec<Subject>>,
    pub error: Option<String>,
}

/// Fetch, detect and name images one at a time.
pub struct Recognizer<'a> {
    images: &'a dyn ImageSource,
    detector: &'a dyn SubjectDetector,
    naming: NamingRule,
}

impl<'a> Recognizer<'a> {
    pub fn new(
        images: &'a dyn ImageSource,
        detector: &'a dyn SubjectDetector,
        naming: NamingRule,
    ) -> Self {
        Self {
            images,
            detector,
            naming,
        }
    }

    /// Reads a staged batch object and stores a renamed copy of every image
    /// that satisfies the naming rule under `recognized_prefix` in the same
    /// bucket. Per-image failures are logged and skipped.
    pub fn process_batch_object(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        key: &str,
        recognized_prefix: &str,
    ) -> Result<Vec<ImageOutcome>> {
        let body = store.get_object(bucket, key)?;
        let urls = parse_batch_object(&body)?;
        tracing::info!(bucket, key, count = urls.len(), "batch_object_loaded");

        let mut outcomes = Vec::with_capacity(urls.len());
        for url in urls {
            let outcome = self.process_url(store, bucket, recognized_prefix, url);
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn process_url(
        &self,
        store: &dyn ObjectStore,
        bucket: &str,
        recognized_prefix: &str,
        url: String,
    ) -> ImageOutcome {
        let image = match self.images.fetch_image(&url) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(
                    url = %redact_url_for_log(&url),
                    error = %err,
                    "image_fetch_failed"
                );
                return ImageOutcome::FetchFailed {
                    url,
                    error: err.to_string(),
                };
            }
        };

        let subjects = match self.detector.detect_subjects(&image) {
            Ok(subjects) => subjects,
            Err(err) => {
                tracing::warn!(
                    url = %redact_url_for_log(&url),
                    error = %err,
                    "subject_detection_failed"
                );
                return ImageOutcome::DetectFailed {
                    url,
                    error: err.to_string(),
                };
            }
        };
        let labels: Vec<&str> = subjects.iter().map(|s| s.label.as_str()).collect();
        tracing::info!(
            url = %redact_url_for_log(&url),
            labels = ?labels,
            "subjects_detected"
        );

        let Some(name) = self.naming.file_name(&subjects) else {
            tracing::info!(
                url = %redact_url_for_log(&url),
                count = subjects.len(),
                required = self.naming.required_subjects,
                "naming_rule_not_met"
            );
            return ImageOutcome::NoMatch { url, subjects };
        };

        let key = join_key(recognized_prefix, &name);
        if let Err(err) = store.put_object(bucket, &key, &image, RECOGNIZED_IMAGE_CONTENT_TYPE) {
            tracing::warn!(bucket, key = %key, error = %err, "recognized_image_upload_failed");
            return ImageOutcome::UploadFailed {
                url,
                key,
                error: err.to_string(),
            };
        }
        tracing::info!(bucket, key = %key, "recognized_image_stored");
        ImageOutcome::Stored { url, key, subjects }
    }

    /// Direct mode: detect subjects for each URL without touching storage.
    pub fn recognize_urls(&self, urls: &[String]) -> Vec<RecognizedImage> {
        urls.iter()
            .map(|url| {
                let result = self
                    .images
                    .fetch_image(url)
                    .and_then(|bytes| self.detector.detect_subjects(&bytes));
                match result {
                    Ok(subjects) => RecognizedImage {
                        url: url.clone(),
                        subjects: Some(subjects),
                        error: None,
                    },
                    Err(err) => {
                        tracing::warn!(
                            url = %redact_url_for_log(url),
                            kind = err.kind(),
                            error = %err,
                            "image_recognition_skipped"
                        );
                        RecognizedImage {
                            url: url.clone(),
                            subjects: None,
                            error: Some(err.to_string()),
                        }
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::build_http_agent;
    use crate::storage::MemoryObjectStore;
    use crate::test_server::{http_response, serve_once};
    use std::collections::HashMap;

    fn subject(label: &str) -> Subject {
        Subject {
            label: label.to_string(),
            confidence: 99.0,
        }
    }

    struct MapImages(HashMap<String, Vec<u8>>);

    impl ImageSource for MapImages {
        fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
            self.0.get(url).cloned().ok_or_else(|| EngineError::Fetch {
                url: url.to_string(),
                message: "status 404".to_string(),
            })
        }
    }

    /// Image bytes are the comma-separated labels to "detect".
    struct EchoDetector;

    impl SubjectDetector for EchoDetector {
        fn detect_subjects(&self, image: &[u8]) -> Result<Vec<Subject>> {
            let text = String::from_utf8_lossy(image);
            if text == "boom" {
                return Err(EngineError::Recognition("service unavailable".to_string()));
            }
            Ok(text
                .split(',')
                .filter(|s| !s.is_empty())
                .map(subject)
                .collect())
        }
    }

    fn images(pairs: &[(&str, &str)]) -> MapImages {
        MapImages(
            pairs
                .iter()
                .map(|(u, b)| (u.to_string(), b.as_bytes().to_vec()))
                .collect(),
        )
    }

    #[test]
    fn exactly_two_subjects_name_the_file() {
        let rule = NamingRule::default();
        assert_eq!(
            rule.file_name(&[subject("A"), subject("B")]).as_deref(),
            Some("A_B.jpg")
        );
        assert_eq!(rule.file_name(&[]), None);
        assert_eq!(rule.file_name(&[subject("A")]), None);
        assert_eq!(
            rule.file_name(&[subject("A"), subject("B"), subject("C")]),
            None
        );
    }

    #[test]
    fn naming_rule_is_configurable() {
        let rule = NamingRule {
            required_subjects: 3,
            separator: "-".to_string(),
            extension: ".png".to_string(),
        };
        assert_eq!(
            rule.file_name(&[subject("A"), subject("B"), subject("C")]).as_deref(),
            Some("A-B-C.png")
        );
        let never = NamingRule {
            required_subjects: 0,
            ..NamingRule::default()
        };
        assert_eq!(never.file_name(&[]), None);
    }

    #[test]
    fn detector_response_keeps_service_order() {
        let body = br#"{"CelebrityFaces":[
            {"Name":"Zed","MatchConfidence":55.5,"Id":"1"},
            {"Name":"Amy","MatchConfidence":99.1}
        ],"UnrecognizedFaces":[]}"#;
        let subjects = parse_detector_response(body).expect("parse");
        assert_eq!(
            subjects.iter().map(|s| s.label.as_str()).collect::<Vec<_>>(),
            vec!["Zed", "Amy"]
        );
        assert!((subjects[0].confidence - 55.5).abs() < f32::EPSILON);
        assert!(parse_detector_response(b"{}").expect("empty").is_empty());
        assert!(matches!(
            parse_detector_response(b"not json"),
            Err(EngineError::Recognition(_))
        ));
    }

    #[test]
    fn batch_object_stores_only_pair_matches() {
        let store = MemoryObjectStore::new();
        let urls = vec![
            "https://example.com/pair.jpg",
            "https://example.com/solo.jpg",
            "https://example.com/trio.jpg",
            "https://example.com/missing.jpg",
            "https://example.com/broken.jpg",
        ];
        store
            .put_object(
                "bucket",
                "url-path/r-0.json",
                serde_json::to_string(&urls).expect("json").as_bytes(),
                "application/json",
            )
            .expect("seed");

        let source = images(&[
            ("https://example.com/pair.jpg", "A,B"),
            ("https://example.com/solo.jpg", "A"),
            ("https://example.com/trio.jpg", "A,B,C"),
            ("https://example.com/broken.jpg", "boom"),
        ]);
        let recognizer = Recognizer::new(&source, &EchoDetector, NamingRule::default());
        let outcomes = recognizer
            .process_batch_object(&store, "bucket", "url-path/r-0.json", "")
            .expect("process");

        assert_eq!(outcomes.len(), 5);
        assert_eq!(outcomes[0].stored_key(), Some("A_B.jpg"));
        assert!(matches!(outcomes[1], ImageOutcome::NoMatch { .. }));
        assert!(matches!(outcomes[2], ImageOutcome::NoMatch { .. }));
        assert!(matches!(outcomes[3], ImageOutcome::FetchFailed { .. }));
        assert!(matches!(outcomes[4], ImageOutcome::DetectFailed { .. }));

        let stored = store.get("bucket", "A_B.jpg").expect("renamed copy");
        assert_eq!(stored.body, b"A,B".to_vec());
        assert_eq!(stored.content_type, RECOGNIZED_IMAGE_CONTENT_TYPE);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn recognized_prefix_is_applied_to_stored_key() {
        let store = MemoryObjectStore::new();
        store
            .put_object("b", "k.json", br#"["https://example.com/x.jpg"]"#, "application/json")
            .expect("seed");
        let source = images(&[("https://example.com/x.jpg", "Ann,Bob")]);
        let recognizer = Recognizer::new(&source, &EchoDetector, NamingRule::default());
        let outcomes = recognizer
            .process_batch_object(&store, "b", "k.json", "matches")
            .expect("process");
        assert_eq!(outcomes[0].stored_key(), Some("matches/Ann_Bob.jpg"));
    }

    #[test]
    fn unreadable_batch_object_is_an_error() {
        let store = MemoryObjectStore::new();
        store
            .put_object("b", "k.json", b"{}", "application/json")
            .expect("seed");
        let source = images(&[]);
        let recognizer = Recognizer::new(&source, &EchoDetector, NamingRule::default());
        assert!(matches!(
            recognizer.process_batch_object(&store, "b", "k.json", ""),
            Err(EngineError::Parse(_))
        ));
        assert!(matches!(
            recognizer.process_batch_object(&store, "b", "absent.json", ""),
            Err(EngineError::Fetch { .. })
        ));
    }

    #[test]
    fn direct_recognition_skips_failures() {
        let source = images(&[("https://example.com/a.jpg", "A")]);
        let recognizer = Recognizer::new(&source, &EchoDetector, NamingRule::default());
        let out = recognizer.recognize_urls(&[
            "https://example.com/a.jpg".to_string(),
            "https://example.com/gone.jpg".to_string(),
        ]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].subjects.as_ref().map(|s| s.len()), Some(1));
        assert!(out[1].subjects.is_none());
        assert!(out[1].error.is_some());
    }

    #[test]
    fn http_detector_rejects_non_http_endpoints() {
        let agent = crate::http::build_http_agent(crate::http::DEFAULT_USER_AGENT, 5);
        assert!(HttpSubjectDetector::new(agent.clone(), "file:///tmp/x", None).is_err());
        assert!(HttpSubjectDetector::new(agent, "http://127.0.0.1:9/recognize", None).is_ok());
    }

    /// Rejects writes to one key and passes everything else through.
    struct RejectingStore {
        inner: MemoryObjectStore,
        rejected_key: &'static str,
    }

    impl ObjectStore for RejectingStore {
        fn put_object(&self, bucket: &str, key: &str, body: &[u8], content_type: &str) -> Result<()> {
            if key == self.rejected_key {
                return Err(EngineError::Upload {
                    key: key.to_string(),
                    message: "access denied".to_string(),
                });
            }
            self.inner.put_object(bucket, key, body, content_type)
        }

        fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
            self.inner.get_object(bucket, key)
        }
    }

    #[test]
    fn upload_failure_skips_the_image_and_keeps_going() {
        let store = RejectingStore {
            inner: MemoryObjectStore::new(),
            rejected_key: "A_B.jpg",
        };
        store
            .put_object(
                "b",
                "k.json",
                br#"["https://example.com/1.jpg","https://example.com/2.jpg"]"#,
                "application/json",
            )
            .expect("seed");
        let source = images(&[
            ("https://example.com/1.jpg", "A,B"),
            ("https://example.com/2.jpg", "Cy,Dee"),
        ]);
        let recognizer = Recognizer::new(&source, &EchoDetector, NamingRule::default());

        let outcomes = recognizer
            .process_batch_object(&store, "b", "k.json", "")
            .expect("process");

        assert_eq!(outcomes.len(), 2);
        assert!(
            matches!(&outcomes[0], ImageOutcome::UploadFailed { key, .. } if key == "A_B.jpg"),
            "outcome={:?}",
            outcomes[0]
        );
        assert_eq!(outcomes[1].stored_key(), Some("Cy_Dee.jpg"));
        assert!(store.inner.get("b", "A_B.jpg").is_none());
        assert!(store.inner.get("b", "Cy_Dee.jpg").is_some());
    }

    fn detector_for(base: &str, token: Option<&str>) -> HttpSubjectDetector {
        HttpSubjectDetector::new(
            build_http_agent("findconnections-test", 5),
            &format!("{base}/recognize"),
            token.map(str::to_string),
        )
        .expect("detector")
    }

    #[test]
    fn http_detector_posts_bytes_with_bearer_token() {
        let reply = br#"{"CelebrityFaces":[{"Name":"Ann","MatchConfidence":98.5}]}"#;
        let (base, server) = serve_once(http_response("200 OK", "application/json", reply));

        let subjects = detector_for(&base, Some("s3cret"))
            .detect_subjects(b"JPEGDATA")
            .expect("detect");
        assert_eq!(subjects.len(), 1);
        assert_eq!(subjects[0].label, "Ann");

        let request = server.join().expect("server thread");
        let lowered = request.to_ascii_lowercase();
        assert!(lowered.starts_with("post /recognize"), "request={request}");
        assert!(lowered.contains("authorization: bearer s3cret"), "request={request}");
        assert!(
            lowered.contains("content-type: application/octet-stream"),
            "request={request}"
        );
        assert!(request.contains("JPEGDATA"), "request={request}");
    }

    #[test]
    fn http_detector_without_token_sends_no_authorization() {
        let (base, server) = serve_once(http_response(
            "200 OK",
            "application/json",
            br#"{"CelebrityFaces":[]}"#,
        ));
        let subjects = detector_for(&base, None)
            .detect_subjects(b"x")
            .expect("detect");
        assert!(subjects.is_empty());
        let request = server.join().expect("server thread");
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
    }

    #[test]
    fn http_detector_error_status_is_a_recognition_error() {
        let (base, server) =
            serve_once(http_response("503 Service Unavailable", "text/plain", b"busy"));
        let err = detector_for(&base, None)
            .detect_subjects(b"x")
            .expect_err("503");
        match err {
            EngineError::Recognition(message) => {
                assert!(message.contains("503"), "message={message}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        server.join().expect("server thread");
    }

    #[test]
    fn http_detector_transport_failure_is_a_recognition_error() {
        let err = detector_for("http://127.0.0.1:9", None)
            .detect_subjects(b"x")
            .expect_err("closed port");
        assert!(matches!(err, EngineError::Recognition(_)), "err={err:?}");
    }
}
