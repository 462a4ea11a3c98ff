use crate::{EngineError, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Bucket/key object storage.
pub trait ObjectStore {
    fn put_object(&self, bucket: &str, key: &str, body: &[u8], content_type: &str) -> Result<()>;

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
}

/// Objects live at `<root>/<bucket>/<key>`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        Ok(self.root.join(bucket).join(key))
    }
}

impl ObjectStore for FsObjectStore {
    fn put_object(&self, bucket: &str, key: &str, body: &[u8], content_type: &str) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        let upload_err = |e: std::io::Error| EngineError::Upload {
            key: format!("{bucket}/{key}"),
            message: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(upload_err)?;
        }
        std::fs::write(&path, body).map_err(upload_err)?;
        tracing::debug!(
            bucket,
            key,
            bytes = body.len(),
            content_type,
            "object_written"
        );
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let path = self.object_path(bucket, key)?;
        std::fs::read(&path).map_err(|e| EngineError::Fetch {
            url: format!("{bucket}/{key}"),
            message: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// In-process store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RefCell<BTreeMap<(String, String), StoredObject>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .borrow()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .borrow()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.borrow().is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put_object(&self, bucket: &str, key: &str, body: &[u8], content_type: &str) -> Result<()> {
        validate_bucket(bucket)?;
        validate_key(key)?;
        self.objects.borrow_mut().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                body: body.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.get(bucket, key)
            .map(|obj| obj.body)
            .ok_or_else(|| EngineError::Fetch {
                url: format!("{bucket}/{key}"),
                message: "no such object".to_string(),
            })
    }
}

/// Joins a key prefix and a name without doubling or leading slashes.
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn validate_bucket(bucket: &str) -> Result<()> {
    let trimmed = bucket.trim();
    if trimmed.is_empty() || trimmed.contains('/') || trimmed.contains('\\') || trimmed == ".." {
        return Err(EngineError::Validation(format!(
            "invalid bucket name: {bucket:?}"
        )));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(EngineError::Validation("object key is empty".to_string()));
    }
    let path = Path::new(key);
    let safe = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe {
        return Err(EngineError::Validation(format!(
            "object key escapes its bucket: {key:?}"
        )));
    }
    Ok(())
}
