//! Model provider contract
//!
//! A provider turns a prompt into reply text. Wire protocols live behind
//! this trait; the chamber only sees `send`.

use crate::error::{ProviderError, ProviderErrorKind};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Token accounting for one reply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub tokens_in: u64,
    pub tokens_out: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReply {
    pub text: String,
    pub usage: Usage,
}

pub trait ModelProvider: Send + Sync {
    /// Send one prompt to `model_id`, giving up after `timeout`
    fn send<'a>(
        &'a self,
        prompt: &'a str,
        model_id: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderReply, ProviderError>> + Send + 'a>>;
}

/// One increment of a streamed reply. Usage usually arrives with the last chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub usage: Option<Usage>,
}

/// A provider that yields replies incrementally
pub trait ChunkSource: Send + Sync {
    fn open<'a>(
        &'a self,
        prompt: &'a str,
        model_id: &'a str,
    ) -> Pin<
        Box<
            dyn Future<Output = Result<BoxStream<'a, Result<Chunk, ProviderError>>, ProviderError>>
                + Send
                + 'a,
        >,
    >;
}

/// Adapts a [`ChunkSource`] to [`ModelProvider`] by collecting every chunk
pub struct StreamingProvider<S> {
    source: S,
}

impl<S: ChunkSource> StreamingProvider<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

impl<S: ChunkSource> ModelProvider for StreamingProvider<S> {
    fn send<'a>(
        &'a self,
        prompt: &'a str,
        model_id: &'a str,
        timeout: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<ProviderReply, ProviderError>> + Send + 'a>> {
        Box::pin(async move {
            let collect = async {
                let mut stream = self.source.open(prompt, model_id).await?;
                let mut text = String::new();
                let mut usage = Usage::default();
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk?;
                    text.push_str(&chunk.text);
                    if let Some(u) = chunk.usage {
                        usage = u;
                    }
                }
                if text.trim().is_empty() {
                    return Err(ProviderError::new(
                        ProviderErrorKind::MalformedReply,
                        format!("{} streamed an empty reply", model_id),
                    ));
                }
                Ok(ProviderReply { text, usage })
            };
            match tokio::time::timeout(timeout, collect).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::timeout(model_id, timeout.as_secs())),
            }
        })
    }
}
