use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::TokenSource;
use crate::chat_api::ChatApi;
use crate::error::{ChatStreamError, CoreResult};
use crate::model::{Document, DocumentRef};

/// Looks up documents referenced by messages, for display only.
#[async_trait]
pub trait DocumentResolver: Send + Sync {
    async fn resolve(&self, doc: &DocumentRef) -> CoreResult<Document>;
}

/// Fixed set of known documents.
#[derive(Debug, Default, Clone)]
pub struct DocumentDirectory {
    docs: HashMap<DocumentRef, Document>,
}

impl DocumentDirectory {
    pub fn new(docs: impl IntoIterator<Item = Document>) -> Self {
        Self {
            docs: docs.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }
}

#[async_trait]
impl DocumentResolver for DocumentDirectory {
    async fn resolve(&self, doc: &DocumentRef) -> CoreResult<Document> {
        self.docs
            .get(doc)
            .cloned()
            .ok_or_else(|| ChatStreamError::NotFound(format!("document {doc}")))
    }
}

/// Resolves documents through the backend's document endpoint.
pub struct ApiDocuments {
    api: ChatApi,
    auth: Arc<dyn TokenSource>,
}

impl ApiDocuments {
    pub fn new(api: ChatApi, auth: Arc<dyn TokenSource>) -> Self {
        Self { api, auth }
    }
}

#[async_trait]
impl DocumentResolver for ApiDocuments {
    async fn resolve(&self, doc: &DocumentRef) -> CoreResult<Document> {
        let token = self.auth.bearer_token().ok_or(ChatStreamError::Unauthorized)?;
        self.api.get_document(doc, &token).await
    }
}
