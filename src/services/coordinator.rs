use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::models::chat::{ChatMessage, ChatParams, StreamEvent, TokenUsage};
use crate::models::divination::{DivinationRequest, Language};
use crate::models::identity::Identity;
use crate::models::policy::{ModelTier, Policy};
use crate::models::provider::{ModelEntry, ProviderKind};
use crate::models::usage::{AllowedModels, CallRecord};
use crate::services::adapters::ProviderError;
use crate::services::cache::{CacheLookup, MultiLevelCache};
use crate::services::cost_monitor::CostMonitor;
use crate::services::degradation::DegradationController;
use crate::services::failover::{FailoverEngine, FailoverError};
use crate::services::prompt::{effective_max_tokens, render_cached, InputLimits, PromptBuilder};
use crate::services::provider_pool::ProviderPool;
use crate::services::quota::QuotaLedger;
use crate::services::rate_limiter::RateLimiter;
use crate::services::sse::{SseErrorCode, SseEvent};
use crate::services::token_counter;

const CHANNEL_CAPACITY: usize = 32;
const MIN_CUSTOM_KEY_LEN: usize = 20;

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub production: bool,
    /// Whether quota still applies when the caller brings their own key.
    pub quota_on_custom_key: bool,
    /// Whether anonymous callers are refused once the free tier's daily
    /// allowance is used up. Their usage is recorded either way.
    pub quota_on_anonymous: bool,
    pub limits: InputLimits,
    pub temperature: f32,
    /// Model used with `x-api-key` when `x-api-model` is absent.
    pub default_custom_model: String,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            production: false,
            quota_on_custom_key: true,
            quota_on_anonymous: false,
            limits: InputLimits::default(),
            temperature: 0.7,
            default_custom_model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Upstream override supplied through `x-api-key`, `x-api-url`, `x-api-model`.
#[derive(Debug, Clone, Default)]
pub struct CustomUpstream {
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub identity: Identity,
    pub custom: Option<CustomUpstream>,
    /// The request reached us over HTTPS, as reported by a trusted proxy.
    pub https: bool,
}

/// Everything the streaming task needs once admission has passed.
struct Admitted {
    kind: String,
    language: Language,
    user_id: String,
    cache_inputs: Value,
    cacheable: bool,
    charge_quota: bool,
    candidates: Vec<ModelEntry>,
    messages: Vec<ChatMessage>,
    params: ChatParams,
    tier_filter: Option<ModelTier>,
}

/// What the streaming task observed, kept outside the stream future so a
/// cancelled request can still be accounted.
#[derive(Default)]
struct Progress {
    entry: Option<ModelEntry>,
    attempts: u32,
    text: String,
    usage: Option<TokenUsage>,
    upstream_failed: bool,
    all_failed_empty: bool,
    completed: bool,
}

/// Per-request orchestration: admission, prompt build, failover stream,
/// and accounting.
pub struct RequestCoordinator {
    pool: Arc<ProviderPool>,
    failover: Arc<FailoverEngine>,
    cache: Arc<MultiLevelCache>,
    limiter: Arc<RateLimiter>,
    quota: Arc<QuotaLedger>,
    degradation: Arc<DegradationController>,
    monitor: Arc<CostMonitor>,
    prompts: Arc<dyn PromptBuilder>,
    settings: CoordinatorSettings,
}

impl RequestCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<ProviderPool>,
        failover: Arc<FailoverEngine>,
        cache: Arc<MultiLevelCache>,
        limiter: Arc<RateLimiter>,
        quota: Arc<QuotaLedger>,
        degradation: Arc<DegradationController>,
        monitor: Arc<CostMonitor>,
        prompts: Arc<dyn PromptBuilder>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            pool,
            failover,
            cache,
            limiter,
            quota,
            degradation,
            monitor,
            prompts,
            settings,
        }
    }

    /// Admit the request and start streaming. Admission failures come back as
    /// `Err`; anything after that arrives in-band on the receiver, which always
    /// ends with [`SseEvent::Done`] unless the client went away.
    pub async fn handle(
        self: &Arc<Self>,
        request: DivinationRequest,
        ctx: RequestContext,
    ) -> Result<mpsc::Receiver<SseEvent>, AppError> {
        let language = request.language();
        let kind = request.prompt_type.trim().to_lowercase();
        if !self.prompts.supports(&kind) {
            return Err(AppError::InvalidDivinationType(kind));
        }
        self.settings.limits.validate(&request.prompt)?;

        // The policy seen here governs the whole request.
        let policy = self.degradation.snapshot();
        if policy.reject_new {
            return Err(AppError::ServiceBusy);
        }

        let identity = &ctx.identity;
        self.limiter.check(identity).await?;

        let tier = self.quota.tier_for(&identity.user_id, identity.tier);
        let charge_quota = ctx.custom.is_none() || self.settings.quota_on_custom_key;
        if charge_quota && (identity.authenticated || self.settings.quota_on_anonymous) {
            self.quota.ensure_quota(&identity.user_id, tier)?;
        }

        let custom_entry = match &ctx.custom {
            Some(custom) => Some(self.custom_entry(custom, ctx.https)?),
            None => None,
        };

        let cacheable = self.prompts.is_cacheable(&kind);
        let cache_inputs = request.cache_inputs();
        if cacheable {
            match self.cache.get(&kind, &cache_inputs).await {
                CacheLookup::Hit(text) => {
                    tracing::debug!("Serving {} from cache", kind);
                    if charge_quota {
                        self.quota.consume_quota(&identity.user_id, 0, 0.0);
                    }
                    return Ok(replay(vec![SseEvent::Content(text), SseEvent::Done]));
                }
                CacheLookup::Empty => {
                    return Ok(replay(vec![
                        SseEvent::error(SseErrorCode::ProviderError, language),
                        SseEvent::Done,
                    ]));
                }
                CacheLookup::Miss if policy.cache_only => return Err(AppError::ServiceBusy),
                CacheLookup::Miss => {}
            }
        }

        let tier_filter = tier_filter(&policy, cacheable);
        let tier_quota = self.quota.tier_quota(tier);

        let candidates = match custom_entry {
            Some(entry) => vec![entry],
            None => {
                let candidates = self.pool.candidates();
                if candidates.is_empty() {
                    return Err(AppError::NoProvidersConfigured);
                }
                let allowed = filter_allowed(candidates, &tier_quota.allowed_models);
                if allowed.is_empty() {
                    return Err(AppError::ModelNotAllowed(tier.as_str().to_string()));
                }
                allowed
            }
        };

        let prompt = render_cached(
            self.prompts.as_ref(),
            &self.cache,
            &kind,
            &request,
            policy.output_mode,
            language,
        )
        .await?;

        let max_tokens = effective_max_tokens(
            policy.max_output_tokens,
            tier_quota.max_output_tokens,
            self.prompts.max_tokens_for(&kind),
        );
        let params = ChatParams::default()
            .with_temperature(self.settings.temperature)
            .with_max_tokens(max_tokens);

        let admitted = Admitted {
            kind,
            language,
            user_id: identity.user_id.clone(),
            cache_inputs,
            cacheable,
            charge_quota,
            candidates,
            messages: vec![
                ChatMessage::system(prompt.system),
                ChatMessage::user(prompt.user),
            ],
            params,
            tier_filter,
        };

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let this = self.clone();
        tokio::spawn(async move { this.run(admitted, tx).await });
        Ok(rx)
    }

    async fn run(self: Arc<Self>, admitted: Admitted, tx: mpsc::Sender<SseEvent>) {
        let _active = self.monitor.begin_request();
        let started = Instant::now();
        let mut progress = Progress::default();

        let cancelled = tokio::select! {
            _ = tx.closed() => true,
            _ = self.pump(&admitted, &tx, &mut progress) => false,
        };
        if cancelled {
            tracing::info!(
                "Client disconnected from {} stream for {}",
                admitted.kind,
                admitted.user_id
            );
        }

        self.finalize(&admitted, &progress, started, cancelled).await;
        if !cancelled {
            let _ = tx.send(SseEvent::Done).await;
        }
    }

    /// Drive the failover stream into the channel, recording what happened.
    async fn pump(&self, admitted: &Admitted, tx: &mpsc::Sender<SseEvent>, progress: &mut Progress) {
        let committed = self
            .failover
            .chat_stream_with_failover(
                admitted.candidates.clone(),
                &admitted.messages,
                &admitted.params,
                admitted.tier_filter,
            )
            .await;

        let mut committed = match committed {
            Ok(c) => c,
            Err(err) => {
                progress.upstream_failed = true;
                match &err {
                    FailoverError::AllModelsFailed { errors } => {
                        progress.attempts = errors.len() as u32;
                        progress.all_failed_empty = !errors.is_empty()
                            && errors
                                .iter()
                                .all(|e| matches!(e.error, ProviderError::EmptyResponse));
                        let tried: Vec<&str> = errors.iter().map(|e| e.model.as_str()).collect();
                        tracing::error!("All candidates failed for {}: {:?}", admitted.kind, tried);
                    }
                    FailoverError::NoCandidates => {
                        tracing::error!("No candidates left for {}", admitted.kind);
                    }
                }
                let _ = tx
                    .send(SseEvent::error(SseErrorCode::ProviderError, admitted.language))
                    .await;
                return;
            }
        };

        progress.attempts = committed.attempts;
        progress.entry = Some(committed.entry.clone());

        while let Some(item) = committed.stream.next().await {
            match item {
                Ok(StreamEvent::Delta(text)) => {
                    if text.is_empty() {
                        continue;
                    }
                    progress.text.push_str(&text);
                    if tx.send(SseEvent::Content(text)).await.is_err() {
                        return;
                    }
                }
                Ok(StreamEvent::Usage(usage)) => progress.usage = Some(usage),
                Err(e) => {
                    tracing::warn!(
                        "Stream from {} broke after commit: {}",
                        committed.entry.name,
                        e
                    );
                    progress.upstream_failed = true;
                    let code = SseErrorCode::for_stream_failure(&e);
                    let _ = tx.send(SseEvent::error(code, admitted.language)).await;
                    return;
                }
            }
        }
        progress.completed = true;
    }

    async fn finalize(&self, admitted: &Admitted, progress: &Progress, started: Instant, cancelled: bool) {
        let in_tokens = progress
            .usage
            .map(|u| u.input_tokens)
            .filter(|t| *t > 0)
            .unwrap_or_else(|| token_counter::estimate_messages(&admitted.messages));
        let out_tokens = progress
            .usage
            .map(|u| u.output_tokens)
            .filter(|t| *t > 0)
            .unwrap_or_else(|| token_counter::estimate_tokens(&progress.text));

        let (model, cost) = match &progress.entry {
            Some(entry) => (
                entry.model_id().to_string(),
                (in_tokens + out_tokens) as f64 / 1000.0 * entry.cost_per_1k_tokens,
            ),
            None => ("none".to_string(), 0.0),
        };

        self.monitor.record(CallRecord {
            ts: Utc::now(),
            model,
            in_tokens,
            out_tokens,
            cost,
            latency_s: started.elapsed().as_secs_f64(),
            success: !progress.upstream_failed,
            tool_name: admitted.kind.clone(),
            user_id: admitted.user_id.clone(),
            attempts: progress.attempts.max(1),
        });

        // Charge only when an upstream actually produced something.
        if admitted.charge_quota && progress.entry.is_some() {
            self.quota
                .consume_quota(&admitted.user_id, (in_tokens + out_tokens) as u64, cost);
        }

        if !admitted.cacheable || cancelled {
            return;
        }
        if progress.completed {
            if progress.text.trim().is_empty() {
                self.cache.set_null(&admitted.kind, &admitted.cache_inputs).await;
            } else {
                self.cache
                    .set(&admitted.kind, &admitted.cache_inputs, &progress.text, None)
                    .await;
            }
        } else if progress.all_failed_empty {
            self.cache.set_null(&admitted.kind, &admitted.cache_inputs).await;
        }
    }

    /// Validate the caller's own upstream and turn it into a single-entry pool.
    fn custom_entry(&self, custom: &CustomUpstream, https: bool) -> Result<ModelEntry, AppError> {
        let key = custom.api_key.trim();
        if key.len() < MIN_CUSTOM_KEY_LEN {
            return Err(AppError::InvalidApiKeyFormat(format!(
                "must be at least {} characters",
                MIN_CUSTOM_KEY_LEN
            )));
        }
        if !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(AppError::InvalidApiKeyFormat("unexpected characters".into()));
        }
        if self.settings.production && !https {
            return Err(AppError::InsecureTransport);
        }

        let base_url = custom
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(ProviderKind::OpenAiCompatible.default_base_url());
        let url = reqwest::Url::parse(base_url)
            .map_err(|_| AppError::BadRequest("x-api-url is not a valid URL".into()))?;
        match url.scheme() {
            "https" => {}
            "http" if !self.settings.production => {}
            "http" => return Err(AppError::InsecureTransport),
            _ => return Err(AppError::BadRequest("x-api-url must use http(s)".into())),
        }

        let model = custom
            .model
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(self.settings.default_custom_model.as_str());

        tracing::info!(
            "Using caller-supplied upstream {} (key {})",
            url.host_str().unwrap_or("?"),
            key_fingerprint(key)
        );

        // Callers pay their upstream directly; nothing is billed here.
        Ok(ModelEntry::new(
            "custom",
            ProviderKind::infer(base_url, model),
            base_url,
            key,
            model,
        ))
    }
}

/// Short SHA-256 fingerprint for logs.
pub fn key_fingerprint(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..6])
}

/// Tier restriction for this request. Cache-only levels fall back to the
/// cheapest tier for kinds that never hit the cache.
fn tier_filter(policy: &Policy, cacheable: bool) -> Option<ModelTier> {
    if policy.cache_only && !cacheable {
        Some(ModelTier::Economy)
    } else {
        policy.model_tier
    }
}

fn filter_allowed(candidates: Vec<ModelEntry>, allowed: &AllowedModels) -> Vec<ModelEntry> {
    candidates
        .into_iter()
        .filter(|e| allowed.allows(e.model_id()))
        .collect()
}

/// A receiver pre-filled with `events`.
fn replay(events: Vec<SseEvent>) -> mpsc::Receiver<SseEvent> {
    let (tx, rx) = mpsc::channel(events.len().max(1));
    for event in events {
        let _ = tx.try_send(event);
    }
    rx
}
