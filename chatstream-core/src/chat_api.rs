//! HTTP client for the chat backend.

use async_trait::async_trait;
use secrecy::SecretString;

use crate::config::{ApiCfg, CompletionCfg, Config};
use crate::error::{ChatStreamError, CoreResult};
use crate::http_client::{HttpClient, RequestCtx};
use crate::model::{
    CompletionRequest, CompletionResponse, Document, DocumentRef, PromptRequest, Role, WireMessage,
};
use crate::stream::ByteStream;
use crate::transport::CompletionTransport;

#[derive(Debug, Clone)]
pub struct ChatApi {
    http: HttpClient,
    api: ApiCfg,
    completion: CompletionCfg,
}

impl ChatApi {
    pub fn new(http: HttpClient, api: ApiCfg, completion: CompletionCfg) -> Self {
        Self {
            http,
            api,
            completion,
        }
    }

    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        let http = HttpClient::new(&cfg.http)?;
        Ok(Self::new(http, cfg.api.clone(), cfg.completion.clone()))
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        let api = ApiCfg {
            base_url: server_base.to_string(),
            ..ApiCfg::default()
        };
        ChatApi::new(HttpClient::new_default().unwrap(), api, CompletionCfg::default())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, prompt: &PromptRequest, stream: bool) -> CompletionRequest {
        CompletionRequest {
            model: self.completion.model.clone(),
            messages: vec![WireMessage {
                role: Role::User,
                content: prompt.text.clone(),
            }],
            stream,
            max_tokens: self.completion.max_tokens,
            temperature: self.completion.temperature,
            document_ids: prompt.document_refs.clone(),
        }
    }

    /// Non-streaming completion.
    pub async fn create_chat_completion(
        &self,
        prompt: &PromptRequest,
        bearer: &SecretString,
    ) -> CoreResult<CompletionResponse> {
        let ctx = RequestCtx {
            request_id: None,
            bearer: Some(bearer),
        };
        self.http
            .post_json(&self.url(&self.api.completions_path), &self.request(prompt, false), &ctx)
            .await
    }

    pub async fn get_document(
        &self,
        doc: &DocumentRef,
        bearer: &SecretString,
    ) -> CoreResult<Document> {
        let ctx = RequestCtx {
            request_id: None,
            bearer: Some(bearer),
        };
        let url = self.document_url(doc)?;
        self.http.get_json(url.as_str(), &ctx).await
    }

    /// `{documents_path}/{id}` with the id as one encoded path segment.
    fn document_url(&self, doc: &DocumentRef) -> CoreResult<reqwest::Url> {
        let base = self.url(&self.api.documents_path);
        let invalid =
            |why: &str| ChatStreamError::Validation(format!("documents url {base:?}: {why}"));
        let mut url = reqwest::Url::parse(&base).map_err(|e| invalid(&e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| invalid("cannot be a base"))?
            .pop_if_empty()
            .push(doc.as_str());
        Ok(url)
    }
}

#[async_trait]
impl CompletionTransport for ChatApi {
    fn name(&self) -> &str {
        "chat-api"
    }

    async fn submit_prompt(
        &self,
        prompt: &PromptRequest,
        bearer: &SecretString,
    ) -> CoreResult<ByteStream> {
        let ctx = RequestCtx {
            request_id: None,
            bearer: Some(bearer),
        };
        tracing::debug!(docs = prompt.document_refs.len(), "submitting streaming prompt");
        self.http
            .post_stream(&self.url(&self.api.stream_path), &self.request(prompt, true), &ctx)
            .await
    }
}
