//! Document loading.

use crate::error::HostError;
use rstchart_model::{Document, ResourceLoader};
use std::sync::Arc;

/// Where a session's document comes from.
#[derive(Debug, Clone)]
pub enum DocumentSource {
    /// JSON document text.
    Inline(String),
    /// A path or URI fetched through the resource loader. `.yaml` and
    /// `.yml` sources are parsed as YAML, everything else as JSON.
    Uri(String),
    /// An already parsed JSON value.
    Json(serde_json::Value),
    /// A pre-built document tree.
    Document(Document),
}

impl DocumentSource {
    /// Name used in log lines.
    pub fn describe(&self) -> String {
        match self {
            DocumentSource::Inline(_) => "inline document".to_string(),
            DocumentSource::Uri(uri) => uri.clone(),
            DocumentSource::Json(_) => "json document".to_string(),
            DocumentSource::Document(doc) => match &doc.name {
                Some(name) => format!("document '{}'", name),
                None => "document".to_string(),
            },
        }
    }
}

impl From<Document> for DocumentSource {
    fn from(doc: Document) -> Self {
        DocumentSource::Document(doc)
    }
}

impl From<serde_json::Value> for DocumentSource {
    fn from(value: serde_json::Value) -> Self {
        DocumentSource::Json(value)
    }
}

/// Turns a [`DocumentSource`] into a document tree.
#[derive(Clone)]
pub struct DocumentProvider {
    loader: Arc<dyn ResourceLoader>,
}

impl DocumentProvider {
    pub fn new(loader: Arc<dyn ResourceLoader>) -> Self {
        Self { loader }
    }

    pub async fn load(&self, source: DocumentSource) -> Result<Document, HostError> {
        match source {
            DocumentSource::Inline(text) => parse_json(&text),
            DocumentSource::Uri(uri) => {
                let text = self.loader.fetch(&uri).await?;
                tracing::debug!("Fetched document {} ({} bytes)", uri, text.len());
                if is_yaml(&uri) {
                    serde_yaml::from_str(&text)
                        .map_err(|e| HostError::Document(format!("{}: {}", uri, e)))
                } else {
                    parse_json(&text).map_err(|e| HostError::Document(format!("{}: {}", uri, e)))
                }
            }
            DocumentSource::Json(value) => {
                Document::from_json(&value).map_err(|e| HostError::Document(e.to_string()))
            }
            DocumentSource::Document(doc) => Ok(doc),
        }
    }
}

impl std::fmt::Debug for DocumentProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentProvider").finish_non_exhaustive()
    }
}

fn parse_json(text: &str) -> Result<Document, HostError> {
    Document::from_json_str(text).map_err(|e| HostError::Document(e.to_string()))
}

fn is_yaml(uri: &str) -> bool {
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    path.ends_with(".yaml") || path.ends_with(".yml")
}
