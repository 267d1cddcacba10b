use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::AppError;
use crate::models::divination::{DivinationRequest, Language};
use crate::models::policy::OutputMode;
use crate::services::cache::keys::template_key;
use crate::services::cache::{CacheLevel, MultiLevelCache};

const SYSTEM_TEMPLATE_ID: &str = "prompt:system";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltPrompt {
    pub system: String,
    pub user: String,
}

/// Turns a divination request into the system and user prompts.
pub trait PromptBuilder: Send + Sync {
    fn supports(&self, kind: &str) -> bool;

    /// Deterministic kinds whose responses may be served from cache.
    fn is_cacheable(&self, kind: &str) -> bool;

    /// Output cap for the kind, if it has one.
    fn max_tokens_for(&self, kind: &str) -> Option<u32>;

    /// The per-kind system template. Depends only on its arguments, so it can
    /// be memoised.
    fn system_prompt(&self, kind: &str, mode: OutputMode, language: Language) -> Result<String, AppError>;

    fn user_prompt(&self, request: &DivinationRequest, language: Language) -> String;

    fn build(
        &self,
        kind: &str,
        request: &DivinationRequest,
        mode: OutputMode,
        language: Language,
    ) -> Result<BuiltPrompt, AppError> {
        Ok(BuiltPrompt {
            system: self.system_prompt(kind, mode, language)?,
            user: self.user_prompt(request, language),
        })
    }
}

struct KindInfo {
    id: &'static str,
    zh: &'static str,
    en: &'static str,
    cacheable: bool,
    max_tokens: u32,
}

const KINDS: &[KindInfo] = &[
    KindInfo { id: "xiaoliu", zh: "小六壬", en: "Xiao Liu Ren", cacheable: false, max_tokens: 1024 },
    KindInfo { id: "bazi", zh: "八字命理", en: "BaZi (Four Pillars)", cacheable: true, max_tokens: 4096 },
    KindInfo { id: "ziwei", zh: "紫微斗数", en: "Zi Wei Dou Shu", cacheable: true, max_tokens: 4096 },
    KindInfo { id: "liuyao", zh: "六爻", en: "Liu Yao", cacheable: false, max_tokens: 2048 },
    KindInfo { id: "meihua", zh: "梅花易数", en: "Mei Hua Yi Shu", cacheable: false, max_tokens: 1536 },
    KindInfo { id: "qimen", zh: "奇门遁甲", en: "Qi Men Dun Jia", cacheable: true, max_tokens: 3072 },
    KindInfo { id: "daliuren", zh: "大六壬", en: "Da Liu Ren", cacheable: true, max_tokens: 3072 },
    KindInfo { id: "tarot", zh: "塔罗", en: "Tarot", cacheable: false, max_tokens: 2048 },
    KindInfo { id: "zodiac", zh: "星座运势", en: "Western astrology", cacheable: false, max_tokens: 1024 },
    KindInfo { id: "dream", zh: "周公解梦", en: "Dream interpretation", cacheable: false, max_tokens: 1536 },
    KindInfo { id: "name", zh: "姓名学", en: "Name analysis", cacheable: true, max_tokens: 2048 },
    KindInfo { id: "fengshui", zh: "风水", en: "Feng Shui", cacheable: false, max_tokens: 3072 },
];

fn kind_info(kind: &str) -> Option<&'static KindInfo> {
    KINDS.iter().find(|k| k.id == kind)
}

/// Built-in templates for every supported divination kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplatePromptBuilder;

impl TemplatePromptBuilder {
    pub fn kinds() -> impl Iterator<Item = &'static str> {
        KINDS.iter().map(|k| k.id)
    }
}

impl PromptBuilder for TemplatePromptBuilder {
    fn supports(&self, kind: &str) -> bool {
        kind_info(kind).is_some()
    }

    fn is_cacheable(&self, kind: &str) -> bool {
        kind_info(kind).map(|k| k.cacheable).unwrap_or(false)
    }

    fn max_tokens_for(&self, kind: &str) -> Option<u32> {
        kind_info(kind).map(|k| k.max_tokens)
    }

    fn system_prompt(&self, kind: &str, mode: OutputMode, language: Language) -> Result<String, AppError> {
        let info = kind_info(kind).ok_or_else(|| AppError::InvalidDivinationType(kind.to_string()))?;

        Ok(match language {
            Language::Zh => format!(
                "你是一位精通{}的传统文化研究者。请根据用户提供的信息进行解读，语言平实温和，\
                 不做绝对化的断言，不涉及医疗、法律或投资建议。{}",
                info.zh,
                mode_directive(mode, language)
            ),
            Language::En => format!(
                "You are a scholar of traditional {} practice. Interpret the user's information \
                 in a calm, grounded tone, avoid absolute predictions, and give no medical, legal \
                 or investment advice. {}",
                info.en,
                mode_directive(mode, language)
            ),
        })
    }

    fn user_prompt(&self, request: &DivinationRequest, language: Language) -> String {
        let mut user = request.prompt.trim().to_string();
        let details = field_lines(request);
        if !details.is_empty() {
            let heading = match language {
                Language::Zh => "相关信息：",
                Language::En => "Details:",
            };
            user.push_str("\n\n");
            user.push_str(heading);
            user.push('\n');
            user.push_str(&details);
        }
        user
    }
}

fn mode_directive(mode: OutputMode, language: Language) -> &'static str {
    match (language, mode) {
        (Language::Zh, OutputMode::Quick) => "请用三到五句话简要作答。",
        (Language::Zh, OutputMode::Standard) => "请分要点作答，总字数控制在五百字以内。",
        (Language::Zh, OutputMode::Detailed) => "请分层次进行全面、详细的解读，并给出可行的建议。",
        (Language::En, OutputMode::Quick) => "Answer briefly in three to five sentences.",
        (Language::En, OutputMode::Standard) => "Answer in key points, within about 300 words.",
        (Language::En, OutputMode::Detailed) => {
            "Give a thorough, structured reading with practical suggestions."
        }
    }
}

/// `key: value` lines for the kind-specific fields, in key order.
fn field_lines(request: &DivinationRequest) -> String {
    request
        .fields
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| match v {
            Value::String(s) => format!("{}: {}", k, s),
            other => format!("{}: {}", k, other),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Limits applied to the user's prompt before anything else happens.
#[derive(Debug, Clone)]
pub struct InputLimits {
    pub max_chars: usize,
    pub stop_words: Vec<String>,
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_chars: 2000,
            stop_words: Vec::new(),
        }
    }
}

impl InputLimits {
    pub fn validate(&self, prompt: &str) -> Result<(), AppError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(AppError::EmptyPrompt);
        }
        if prompt.chars().count() > self.max_chars {
            return Err(AppError::InputTooLong {
                max: self.max_chars,
            });
        }
        let lowered = prompt.to_lowercase();
        if self
            .stop_words
            .iter()
            .any(|w| !w.is_empty() && lowered.contains(&w.to_lowercase()))
        {
            return Err(AppError::StopWordDetected);
        }
        Ok(())
    }
}

/// Effective output cap: the smallest of the policy, tier, and kind caps.
pub fn effective_max_tokens(policy_cap: u32, tier_cap: u32, kind_cap: Option<u32>) -> u32 {
    let cap = policy_cap.min(tier_cap);
    kind_cap.map_or(cap, |k| cap.min(k)).max(1)
}

/// Build the prompt. The system template is memoised in the shared tier,
/// keyed by kind, mode and language only; the user part is always rendered.
pub async fn render_cached(
    builder: &dyn PromptBuilder,
    cache: &MultiLevelCache,
    kind: &str,
    request: &DivinationRequest,
    mode: OutputMode,
    language: Language,
) -> Result<BuiltPrompt, AppError> {
    let vars = json!({ "kind": kind, "mode": mode.as_str(), "language": language.as_str() });
    let key = template_key(SYSTEM_TEMPLATE_ID, &vars);

    let system = match cache.peek_shared(&key).await {
        Some(system) => system,
        None => {
            let system = builder.system_prompt(kind, mode, language)?;
            cache.set_key(&key, &system, Some(&[CacheLevel::L2])).await;
            system
        }
    };
    Ok(BuiltPrompt {
        system,
        user: builder.user_prompt(request, language),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache::{CacheClient, CacheSettings, MemoryCache};
    use std::sync::Arc;

    fn request(kind: &str, prompt: &str, fields: Value) -> DivinationRequest {
        let mut body = fields;
        body["prompt_type"] = json!(kind);
        body["prompt"] = json!(prompt);
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn every_listed_kind_is_supported() {
        let builder = TemplatePromptBuilder;
        assert_eq!(TemplatePromptBuilder::kinds().count(), 12);
        for kind in TemplatePromptBuilder::kinds() {
            assert!(builder.supports(kind));
            assert!(builder.max_tokens_for(kind).is_some());
        }
        assert!(!builder.supports("astrology-2"));
        assert!(builder.is_cacheable("bazi"));
        assert!(!builder.is_cacheable("tarot"));
    }

    #[test]
    fn build_includes_fields_and_mode() {
        let builder = TemplatePromptBuilder;
        let req = request("bazi", " 事业如何？ ", json!({ "birth": "1990-05-01 08:00", "gender": "male" }));
        let built = builder
            .build("bazi", &req, OutputMode::Quick, Language::Zh)
            .unwrap();
        assert!(built.system.contains("八字命理"));
        assert!(built.system.contains("三到五句话"));
        assert!(built.user.starts_with("事业如何？"));
        assert!(built.user.contains("birth: 1990-05-01 08:00"));
        assert!(built.user.contains("gender: male"));

        let err = builder
            .build("unknown", &req, OutputMode::Quick, Language::Zh)
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_DIVINATION_TYPE");
    }

    #[test]
    fn input_limits() {
        let limits = InputLimits {
            max_chars: 5,
            stop_words: vec!["Forbidden".into()],
        };
        assert_eq!(limits.validate("   ").unwrap_err().code(), "EMPTY_PROMPT");
        assert_eq!(limits.validate("一二三四五六").unwrap_err().code(), "INPUT_TOO_LONG");
        assert!(limits.validate(" 一二三四五 ").is_ok());

        let limits = InputLimits {
            max_chars: 100,
            stop_words: vec!["Forbidden".into()],
        };
        assert_eq!(
            limits.validate("this is forbidden").unwrap_err().code(),
            "STOP_WORD_DETECTED"
        );
    }

    #[test]
    fn max_tokens_is_the_smallest_cap() {
        assert_eq!(effective_max_tokens(4096, 2048, Some(1024)), 1024);
        assert_eq!(effective_max_tokens(256, 2048, Some(4096)), 256);
        assert_eq!(effective_max_tokens(4096, 8192, None), 4096);
    }

    #[tokio::test]
    async fn system_templates_are_memoised_outside_l1_and_stats() {
        let shared: Arc<dyn CacheClient> = Arc::new(MemoryCache::new());
        let cache = MultiLevelCache::new(CacheSettings::default(), Some(shared.clone()), None);
        let builder = TemplatePromptBuilder;

        let first = render_cached(
            &builder,
            &cache,
            "tarot",
            &request("tarot", "感情", json!({ "cards": ["The Fool"] })),
            OutputMode::Standard,
            Language::Zh,
        )
        .await
        .unwrap();
        let second = render_cached(
            &builder,
            &cache,
            "tarot",
            &request("tarot", "事业", json!({ "cards": ["The Tower"] })),
            OutputMode::Standard,
            Language::Zh,
        )
        .await
        .unwrap();

        assert_eq!(first.system, second.system);
        assert!(second.user.starts_with("事业"));
        assert!(second.user.contains("The Tower"));

        // one shared template, nothing in L1, no lookups counted
        let key = template_key(
            SYSTEM_TEMPLATE_ID,
            &json!({ "kind": "tarot", "mode": "standard", "language": "zh" }),
        );
        assert_eq!(shared.get(&key).await.unwrap(), Some(first.system));
        let stats = cache.stats();
        assert_eq!(stats.l1_size, 0);
        assert_eq!(stats.l1.hits + stats.l1.misses, 0);
        assert_eq!(stats.hit_rate, 0.0);
    }
}
