use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;

use crate::models::chat::{ChatMessage, ChatParams, ChatResponse, StreamEvent};
use crate::models::policy::ModelTier;
use crate::models::provider::ModelEntry;
use crate::services::adapters::{AdapterFactory, ChunkStream, ProviderAdapter, ProviderError};
use crate::services::degradation::tier_allows;
use crate::services::health::HealthChecker;

/// One failed candidate.
#[derive(Debug, Clone, Serialize)]
pub struct AttemptError {
    pub model: String,
    pub provider: &'static str,
    pub message: String,
    #[serde(skip)]
    pub error: ProviderError,
}

impl AttemptError {
    fn new(entry: &ModelEntry, error: ProviderError) -> Self {
        Self {
            model: entry.model_id().to_string(),
            provider: entry.kind().as_str(),
            message: error.to_string(),
            error,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FailoverError {
    #[error("all {} candidate(s) failed", .errors.len())]
    AllModelsFailed { errors: Vec<AttemptError> },

    #[error("no candidates to try")]
    NoCandidates,
}

/// A stream that has produced its first chunk. The candidate is fixed from
/// here on; later upstream errors end the stream instead of failing over.
pub struct CommittedStream {
    pub entry: ModelEntry,
    /// Candidates opened, including the committed one.
    pub attempts: u32,
    /// Failures of the candidates tried before this one.
    pub errors: Vec<AttemptError>,
    pub stream: ChunkStream,
}

#[derive(Debug, Clone, Copy)]
pub struct FailoverSettings {
    /// Probe candidates before ordering them.
    pub precheck: bool,
    pub adapter_cache_size: usize,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            precheck: true,
            adapter_cache_size: 50,
        }
    }
}

/// Composes the pool's candidates, the health cache, and the adapter cache
/// into one ordered attempt sequence per request.
pub struct FailoverEngine {
    factory: Arc<dyn AdapterFactory>,
    adapters: Mutex<LruCache<String, Arc<dyn ProviderAdapter>>>,
    health: Arc<HealthChecker>,
    settings: FailoverSettings,
}

impl FailoverEngine {
    pub fn new(
        factory: Arc<dyn AdapterFactory>,
        health: Arc<HealthChecker>,
        settings: FailoverSettings,
    ) -> Self {
        let capacity = NonZeroUsize::new(settings.adapter_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            factory,
            adapters: Mutex::new(LruCache::new(capacity)),
            health,
            settings,
        }
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    pub fn cached_adapters(&self) -> usize {
        self.adapters.lock().len()
    }

    /// Cached adapter for the entry, creating it on a miss. An adapter pushed
    /// out of the cache is closed.
    pub fn adapter_for(&self, entry: &ModelEntry) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        let key = entry.adapter_key();
        if let Some(adapter) = self.adapters.lock().get(&key) {
            return Ok(adapter.clone());
        }

        let created = self.factory.create(entry)?;

        let evicted = {
            let mut adapters = self.adapters.lock();
            if let Some(existing) = adapters.get(&key) {
                // Lost a race with another request; keep the first one.
                let existing = existing.clone();
                drop(adapters);
                created.close();
                return Ok(existing);
            }
            adapters.push(key, created.clone())
        };
        if let Some((old_key, old)) = evicted {
            tracing::debug!("Closing evicted adapter {}", old_key);
            old.close();
        }
        Ok(created)
    }

    /// Active candidates reordered for this request: healthy before unhealthy
    /// (when pre-checking and there is a choice), then tier matches first.
    /// Both partitions are stable.
    pub async fn order_candidates(
        &self,
        candidates: Vec<ModelEntry>,
        tier: Option<ModelTier>,
    ) -> Vec<ModelEntry> {
        let mut ordered: Vec<ModelEntry> =
            candidates.into_iter().filter(ModelEntry::is_active).collect();

        if self.settings.precheck && ordered.len() > 1 {
            let probes = ordered.iter().map(|entry| async move {
                match self.adapter_for(entry) {
                    Ok(adapter) => self.health.check(entry, adapter.as_ref()).await,
                    Err(e) => {
                        tracing::warn!("Cannot build adapter for {}: {}", entry.name, e);
                        self.health.record(entry, false);
                        false
                    }
                }
            });
            let verdicts = join_all(probes).await;
            ordered = stable_partition(ordered.into_iter().zip(verdicts), |(_, healthy)| *healthy)
                .into_iter()
                .map(|(entry, _)| entry)
                .collect();
        }

        if let Some(tier) = tier {
            ordered = stable_partition(ordered, |e| tier_allows(tier, e.model_id()));
        }
        ordered
    }

    /// Try candidates in order until one produces a first chunk.
    pub async fn chat_stream_with_failover(
        &self,
        candidates: Vec<ModelEntry>,
        messages: &[ChatMessage],
        params: &ChatParams,
        tier: Option<ModelTier>,
    ) -> Result<CommittedStream, FailoverError> {
        let ordered = self.order_candidates(candidates, tier).await;
        if ordered.is_empty() {
            return Err(FailoverError::NoCandidates);
        }

        let mut errors = Vec::new();
        let mut attempts = 0u32;

        for entry in ordered {
            attempts += 1;
            match self.open_and_commit(&entry, messages, params).await {
                Ok(stream) => {
                    if !errors.is_empty() {
                        tracing::info!(
                            "Committed to {} after {} failed attempt(s)",
                            entry.name,
                            errors.len()
                        );
                    }
                    return Ok(CommittedStream {
                        entry,
                        attempts,
                        errors,
                        stream,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "Candidate {} ({}) failed before first chunk: {}",
                        entry.name,
                        entry.kind().as_str(),
                        e
                    );
                    self.health.record(&entry, false);
                    errors.push(AttemptError::new(&entry, e));
                }
            }
        }

        Err(FailoverError::AllModelsFailed { errors })
    }

    /// Open one candidate and wait for its first non-empty text chunk. Events
    /// seen before it (usage) are replayed ahead of it.
    async fn open_and_commit(
        &self,
        entry: &ModelEntry,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<ChunkStream, ProviderError> {
        let adapter = self.adapter_for(entry)?;
        let mut upstream = adapter.chat_stream(messages, params).await?;

        let mut head = Vec::new();
        loop {
            match upstream.next().await {
                Some(Ok(StreamEvent::Delta(text))) if text.is_empty() => continue,
                Some(Ok(event @ StreamEvent::Delta(_))) => {
                    head.push(Ok(event));
                    return Ok(stream::iter(head).chain(upstream).boxed());
                }
                Some(Ok(event)) => head.push(Ok(event)),
                Some(Err(e)) => return Err(e),
                None => return Err(ProviderError::EmptyResponse),
            }
        }
    }

    /// Non-streamed completion with the same ordering and failover rules.
    /// Returns the response and the number of candidates tried.
    pub async fn chat_with_failover(
        &self,
        candidates: Vec<ModelEntry>,
        messages: &[ChatMessage],
        params: &ChatParams,
        tier: Option<ModelTier>,
    ) -> Result<(ChatResponse, u32), FailoverError> {
        let ordered = self.order_candidates(candidates, tier).await;
        if ordered.is_empty() {
            return Err(FailoverError::NoCandidates);
        }

        let mut errors = Vec::new();
        for (i, entry) in ordered.iter().enumerate() {
            let result = match self.adapter_for(entry) {
                Ok(adapter) => adapter.chat(messages, params).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(resp) if resp.content.is_empty() => {
                    errors.push(AttemptError::new(entry, ProviderError::EmptyResponse));
                }
                Ok(resp) => return Ok((resp, i as u32 + 1)),
                Err(e) => {
                    tracing::warn!("Candidate {} failed: {}", entry.name, e);
                    self.health.record(entry, false);
                    errors.push(AttemptError::new(entry, e));
                }
            }
        }
        Err(FailoverError::AllModelsFailed { errors })
    }
}

fn stable_partition<T>(items: impl IntoIterator<Item = T>, pred: impl Fn(&T) -> bool) -> Vec<T> {
    let (mut first, rest): (Vec<T>, Vec<T>) = items.into_iter().partition(|item| pred(item));
    first.extend(rest);
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::health::HealthSettings;
    use crate::services::testing::{collect_text, entry, Script, ScriptedFactory, Step};

    fn engine(factory: Arc<ScriptedFactory>, precheck: bool) -> FailoverEngine {
        FailoverEngine::new(
            factory,
            Arc::new(HealthChecker::new(HealthSettings::default())),
            FailoverSettings {
                precheck,
                adapter_cache_size: 50,
            },
        )
    }

    fn http_500() -> ProviderError {
        ProviderError::Http {
            status: 500,
            body: "boom".into(),
        }
    }

    #[tokio::test]
    async fn every_failed_candidate_is_reported_in_order() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .with("a", Script::OpenFails(http_500()))
                .with("b", Script::OpenFails(ProviderError::Timeout("open".into())))
                .with("c", Script::OpenFails(ProviderError::Parse("bad json".into()))),
        );
        let engine = engine(factory.clone(), false);

        let err = engine
            .chat_stream_with_failover(
                vec![entry("a"), entry("b"), entry("c")],
                &[ChatMessage::user("hi")],
                &ChatParams::default(),
                None,
            )
            .await
            .err()
            .unwrap();

        let FailoverError::AllModelsFailed { errors } = err else {
            panic!("expected AllModelsFailed");
        };
        let models: Vec<&str> = errors.iter().map(|e| e.model.as_str()).collect();
        assert_eq!(models, ["a", "b", "c"]);
        assert!(errors[1].error.is_timeout());
        for name in ["a", "b", "c"] {
            assert_eq!(factory.adapter(name).opened(), 1);
        }
    }

    #[tokio::test]
    async fn errors_before_first_chunk_fail_over() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .with("a", Script::Stream(vec![Step::Fail(http_500())]))
                .with("b", Script::Stream(vec![]))
                .with("c", Script::Stream(vec![Step::Text("OK")])),
        );
        let engine = engine(factory.clone(), false);

        let committed = engine
            .chat_stream_with_failover(
                vec![entry("a"), entry("b"), entry("c")],
                &[ChatMessage::user("hi")],
                &ChatParams::default(),
                None,
            )
            .await
            .ok()
            .unwrap();

        assert_eq!(committed.entry.name, "c");
        assert_eq!(committed.attempts, 3);
        assert!(matches!(committed.errors[1].error, ProviderError::EmptyResponse));
        let (text, err) = collect_text(committed.stream).await;
        assert_eq!(text, "OK");
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn committed_stream_never_switches_candidates() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .with(
                    "a",
                    Script::Stream(vec![
                        Step::Text("部"),
                        Step::Fail(ProviderError::Transport("connection reset".into())),
                    ]),
                )
                .with("b", Script::Stream(vec![Step::Text("never")])),
        );
        let engine = engine(factory.clone(), false);

        let committed = engine
            .chat_stream_with_failover(
                vec![entry("a"), entry("b")],
                &[ChatMessage::user("hi")],
                &ChatParams::default(),
                None,
            )
            .await
            .ok()
            .unwrap();

        let (text, err) = collect_text(committed.stream).await;
        assert_eq!(text, "部");
        assert!(matches!(err, Some(ProviderError::Transport(_))));
        assert_eq!(factory.adapter("b").opened(), 0);
    }

    #[tokio::test]
    async fn usage_before_first_chunk_is_replayed() {
        let factory = Arc::new(ScriptedFactory::new().with(
            "a",
            Script::Stream(vec![Step::Usage(7, 0), Step::Text(""), Step::Text("x")]),
        ));
        let engine = engine(factory, false);
        let mut committed = engine
            .chat_stream_with_failover(vec![entry("a")], &[], &ChatParams::default(), None)
            .await
            .ok()
            .unwrap();
        assert!(matches!(
            committed.stream.next().await,
            Some(Ok(StreamEvent::Usage(_)))
        ));
        assert!(matches!(
            committed.stream.next().await,
            Some(Ok(StreamEvent::Delta(ref t))) if t == "x"
        ));
    }

    #[tokio::test]
    async fn precheck_moves_unhealthy_candidates_back() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .with_health("a", false, Script::Stream(vec![Step::Text("A")]))
                .with_health("b", true, Script::Stream(vec![Step::Text("B")]))
                .with_health("c", false, Script::Stream(vec![Step::Text("C")]))
                .with_health("d", true, Script::Stream(vec![Step::Text("D")])),
        );
        let engine = engine(factory, true);
        let ordered = engine
            .order_candidates(vec![entry("a"), entry("b"), entry("c"), entry("d")], None)
            .await;
        let names: Vec<&str> = ordered.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["b", "d", "a", "c"]);
    }

    #[tokio::test]
    async fn tier_matches_are_tried_first() {
        let factory = Arc::new(ScriptedFactory::new());
        let engine = engine(factory, false);
        let ordered = engine
            .order_candidates(
                vec![
                    entry("claude-3-opus"),
                    entry("gpt-4o-mini"),
                    entry("claude-3-5-sonnet"),
                    entry("gemini-1.5-flash"),
                ],
                Some(ModelTier::Economy),
            )
            .await;
        let names: Vec<&str> = ordered.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            ["gpt-4o-mini", "gemini-1.5-flash", "claude-3-opus", "claude-3-5-sonnet"]
        );
    }

    #[tokio::test]
    async fn adapter_cache_closes_evicted_adapters() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .with("a", Script::Stream(vec![]))
                .with("b", Script::Stream(vec![]))
                .with("c", Script::Stream(vec![])),
        );
        let engine = FailoverEngine::new(
            factory.clone(),
            Arc::new(HealthChecker::default()),
            FailoverSettings {
                precheck: false,
                adapter_cache_size: 2,
            },
        );
        let (a, b, c) = (entry("a"), entry("b"), entry("c"));

        engine.adapter_for(&a).unwrap();
        engine.adapter_for(&b).unwrap();
        engine.adapter_for(&a).unwrap();
        engine.adapter_for(&c).unwrap();

        assert_eq!(engine.cached_adapters(), 2);
        assert!(factory.adapter("b").is_closed());
        assert!(!factory.adapter("a").is_closed());
        assert_eq!(factory.created(), 3);
    }

    #[tokio::test]
    async fn non_streamed_chat_fails_over() {
        let factory = Arc::new(
            ScriptedFactory::new()
                .with_health("a", false, Script::Stream(vec![]))
                .with_health("b", true, Script::Stream(vec![])),
        );
        let engine = engine(factory, false);
        let (resp, attempts) = engine
            .chat_with_failover(
                vec![entry("a"), entry("b")],
                &[ChatMessage::user("hi")],
                &ChatParams::default(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(resp.model, "b");
        assert_eq!(attempts, 2);
    }
}
