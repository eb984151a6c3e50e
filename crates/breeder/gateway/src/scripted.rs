//! Offline transports for tests and provider-less runs.

use crate::transport::{ChatRequest, ChatTransport, EmbeddingTransport};
use crate::{GatewayError, GatewayResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Responder = dyn Fn(&ChatRequest) -> GatewayResult<String> + Send + Sync;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Chat transport answering from a closure or a fixed queue of replies.
///
/// Every request is recorded so tests can inspect the exact conversation.
pub struct ScriptedChatTransport {
    responder: Arc<Responder>,
    queued_failures: Mutex<VecDeque<GatewayError>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChatTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ChatRequest) -> GatewayResult<String> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            queued_failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replies handed out in order; once exhausted every call is `Upstream`.
    pub fn from_replies(replies: Vec<String>) -> Self {
        let queue = Mutex::new(VecDeque::from(replies));
        Self::new(move |_| {
            lock(&queue)
                .pop_front()
                .ok_or_else(|| GatewayError::Upstream("scripted replies exhausted".into()))
        })
    }

    /// Make the next call fail with `error` before the responder is consulted.
    pub fn fail_next(&self, error: GatewayError) {
        lock(&self.queued_failures).push_back(error);
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedChatTransport {
    async fn complete(&self, request: &ChatRequest) -> GatewayResult<String> {
        lock(&self.requests).push(request.clone());
        if let Some(error) = lock(&self.queued_failures).pop_front() {
            return Err(error);
        }
        (self.responder)(request)
    }
}

/// Chat transport that always fails with the same error.
pub struct FailingChatTransport {
    error: GatewayError,
    calls: AtomicUsize,
}

impl FailingChatTransport {
    pub fn new(error: GatewayError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatTransport for FailingChatTransport {
    async fn complete(&self, _request: &ChatRequest) -> GatewayResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Deterministic feature-hashing embedder.
///
/// Lower-cased alphanumeric tokens and their bigrams are hashed into signed
/// buckets and the result is L2-normalised. Texts sharing vocabulary land
/// close together, which is enough for density clustering offline.
#[derive(Debug, Clone, Default)]
pub struct HashEmbeddingTransport;

impl HashEmbeddingTransport {
    pub fn new() -> Self {
        Self
    }

    pub fn embed_sync(text: &str, dimensions: usize) -> Vec<f32> {
        let mut vector = vec![0f32; dimensions];
        if dimensions == 0 {
            return vector;
        }

        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();

        let mut add = |feature: &str, weight: f32| {
            let h = fnv1a(feature.as_bytes());
            let bucket = (h % dimensions as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign * weight;
        };
        for token in &tokens {
            add(token, 1.0);
        }
        for pair in tokens.windows(2) {
            add(&format!("{} {}", pair[0], pair[1]), 0.5);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingTransport for HashEmbeddingTransport {
    async fn embed(&self, text: &str, dimensions: usize) -> GatewayResult<Vec<f32>> {
        Ok(Self::embed_sync(text, dimensions))
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
