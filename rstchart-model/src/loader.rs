//! Resource loading for external scripts, data and document sources.

use crate::error::LoadError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Fetches the text behind a URI.
#[async_trait]
pub trait ResourceLoader: Send + Sync {
    async fn fetch(&self, uri: &str) -> Result<String, LoadError>;
}

/// Loads plain paths and `file://` URIs from the local file system.
///
/// Relative paths are resolved against the configured base directory, or
/// the working directory when none is set.
#[derive(Debug, Clone, Default)]
pub struct FileResourceLoader {
    base: Option<PathBuf>,
}

impl FileResourceLoader {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: Some(base.into()),
        }
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf, LoadError> {
        let path = match uri.split_once("://") {
            Some(("file", rest)) => PathBuf::from(rest),
            Some(_) => return Err(LoadError::UnsupportedScheme(uri.to_string())),
            None => PathBuf::from(uri),
        };
        Ok(match &self.base {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        })
    }

    pub fn base(&self) -> Option<&Path> {
        self.base.as_deref()
    }
}

#[async_trait]
impl ResourceLoader for FileResourceLoader {
    async fn fetch(&self, uri: &str) -> Result<String, LoadError> {
        let path = self.resolve(uri)?;
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| LoadError::Io {
                uri: uri.to_string(),
                source,
            })
    }
}
