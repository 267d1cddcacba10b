//! Scripted adapters for failover and coordinator tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::StreamExt;

use crate::models::chat::{ChatMessage, ChatParams, ChatResponse, StreamEvent, TokenUsage};
use crate::models::provider::{ModelEntry, ProviderKind};
use crate::services::adapters::{AdapterFactory, ChunkStream, ProviderAdapter, ProviderError};

#[derive(Clone)]
pub enum Step {
    Text(&'static str),
    Usage(u32, u32),
    Fail(ProviderError),
    /// Never yields again.
    Hang,
}

#[derive(Clone)]
pub enum Script {
    OpenFails(ProviderError),
    Stream(Vec<Step>),
}

pub struct ScriptedAdapter {
    name: String,
    script: Script,
    healthy: bool,
    opened: AtomicUsize,
    closed: AtomicBool,
    /// Set once a stream handed out by this adapter has been dropped.
    pub stream_dropped: Arc<AtomicBool>,
}

impl ScriptedAdapter {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiCompatible
    }

    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _params: &ChatParams,
    ) -> Result<ChatResponse, ProviderError> {
        if !self.healthy {
            return Err(ProviderError::Http {
                status: 503,
                body: "unhealthy".into(),
            });
        }
        Ok(ChatResponse {
            content: "pong".into(),
            model: self.name.clone(),
            provider: "openai-compatible".into(),
            tokens_used: Some(1),
            tokens_estimated: false,
            cost: None,
            response_time_ms: 1,
            request_id: None,
        })
    }

    async fn chat_stream(
        &self,
        _messages: &[ChatMessage],
        _params: &ChatParams,
    ) -> Result<ChunkStream, ProviderError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let steps = match &self.script {
            Script::OpenFails(e) => return Err(e.clone()),
            Script::Stream(steps) => steps.clone(),
        };

        let guard = DropFlag(self.stream_dropped.clone());
        let s = async_stream::stream! {
            let _guard = guard;
            for step in steps {
                match step {
                    Step::Text(t) => yield Ok(StreamEvent::Delta(t.to_string())),
                    Step::Usage(input, output) => yield Ok(StreamEvent::Usage(TokenUsage {
                        input_tokens: input,
                        output_tokens: output,
                    })),
                    Step::Fail(e) => {
                        yield Err(e);
                        break;
                    }
                    Step::Hang => futures::future::pending::<()>().await,
                }
            }
        };
        Ok(s.boxed())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out one scripted adapter per entry name.
#[derive(Default)]
pub struct ScriptedFactory {
    adapters: HashMap<String, Arc<ScriptedAdapter>>,
    created: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, name: &str, script: Script) -> Self {
        self.with_health(name, true, script)
    }

    pub fn with_health(mut self, name: &str, healthy: bool, script: Script) -> Self {
        self.adapters.insert(
            name.to_string(),
            Arc::new(ScriptedAdapter {
                name: name.to_string(),
                script,
                healthy,
                opened: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                stream_dropped: Arc::new(AtomicBool::new(false)),
            }),
        );
        self
    }

    pub fn adapter(&self, name: &str) -> Arc<ScriptedAdapter> {
        self.adapters[name].clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl AdapterFactory for ScriptedFactory {
    fn create(&self, entry: &ModelEntry) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        let adapter = self
            .adapters
            .get(&entry.name)
            .cloned()
            .ok_or_else(|| ProviderError::Config(format!("no script for {}", entry.name)))?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(adapter as Arc<dyn ProviderAdapter>)
    }
}

/// An active entry whose name and model id are `name`, with its own adapter key.
pub fn entry(name: &str) -> ModelEntry {
    ModelEntry::new(
        name,
        ProviderKind::OpenAiCompatible,
        format!("https://scripted.test/{name}"),
        "sk-scripted-0000000000000000",
        name,
    )
    .with_cost(0.002)
}

/// Drain a stream into its text and the terminal error, if any.
pub async fn collect_text(mut stream: ChunkStream) -> (String, Option<ProviderError>) {
    let mut text = String::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(StreamEvent::Delta(t)) => text.push_str(&t),
            Ok(StreamEvent::Usage(_)) => {}
            Err(e) => return (text, Some(e)),
        }
    }
    (text, None)
}
