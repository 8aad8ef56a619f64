use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};

use crate::error::{ChatStreamError, CoreResult};
use crate::model::PromptRequest;
use crate::stream::ByteStream;

/// Issues a streaming completion request and returns the response body.
///
/// Implementations resolve once the backend has accepted the request (status
/// and headers received) and must map a rejected request to an error rather
/// than a body. Dropping the returned stream must release the connection.
#[async_trait]
pub trait CompletionTransport: Send + Sync {
    fn name(&self) -> &str;
    async fn submit_prompt(
        &self,
        prompt: &PromptRequest,
        bearer: &SecretString,
    ) -> CoreResult<ByteStream>;
}

/// One step of a scripted response body.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Chunk(Bytes),
    /// Pause before the next step; the read stays pending meanwhile.
    Delay(Duration),
    /// Mid-stream read failure; the body ends after it.
    Fail(String),
    /// Never yields again (a backend that hangs mid-answer).
    Stall,
}

impl ScriptStep {
    pub fn chunk(s: impl Into<Bytes>) -> Self {
        Self::Chunk(s.into())
    }
}

#[derive(Debug, Clone)]
enum Reply {
    Body(Vec<ScriptStep>),
    Reject { code: u16, message: String },
    Hang,
}

/// Transport that plays back canned response bodies, one per request, and
/// records every request it receives. Used for tests and offline replay.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    seen: Mutex<Vec<(PromptRequest, String)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response body for the next request.
    pub fn then_body(self, steps: Vec<ScriptStep>) -> Self {
        self.push(Reply::Body(steps));
        self
    }

    /// Convenience: queue a body made of the given lines, each `\n`-terminated,
    /// delivered as one chunk per line.
    pub fn then_lines(self, lines: &[&str]) -> Self {
        let steps = lines
            .iter()
            .map(|l| ScriptStep::Chunk(Bytes::from(format!("{l}\n"))))
            .collect();
        self.then_body(steps)
    }

    /// Queue a rejection (non-2xx before streaming) for the next request.
    pub fn then_reject(self, code: u16, message: impl Into<String>) -> Self {
        self.push(Reply::Reject {
            code,
            message: message.into(),
        });
        self
    }

    /// Queue a request that never gets a response.
    pub fn then_hang(self) -> Self {
        self.push(Reply::Hang);
        self
    }

    fn push(&self, reply: Reply) {
        self.replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(reply);
    }

    /// Requests received so far with the bearer token each carried.
    pub fn requests(&self) -> Vec<(PromptRequest, String)> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl CompletionTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn submit_prompt(
        &self,
        prompt: &PromptRequest,
        bearer: &SecretString,
    ) -> CoreResult<ByteStream> {
        self.seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((prompt.clone(), bearer.expose_secret().to_string()));
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();

        match reply {
            Some(Reply::Body(steps)) => Ok(play(steps)),
            Some(Reply::Reject { code, message }) => Err(ChatStreamError::Upstream {
                code: code.to_string(),
                message,
            }),
            Some(Reply::Hang) => futures::future::pending().await,
            None => Err(ChatStreamError::Unavailable {
                endpoint: "scripted".into(),
            }),
        }
    }
}

fn play(steps: Vec<ScriptStep>) -> ByteStream {
    Box::pin(futures::stream::unfold(
        steps.into_iter(),
        |mut steps| async move {
            loop {
                match steps.next()? {
                    ScriptStep::Chunk(b) => return Some((Ok(b), steps)),
                    ScriptStep::Delay(d) => tokio::time::sleep(d).await,
                    ScriptStep::Fail(msg) => {
                        return Some((Err(ChatStreamError::Transport(msg)), Vec::new().into_iter()));
                    }
                    ScriptStep::Stall => futures::future::pending::<()>().await,
                }
            }
        },
    ))
}
