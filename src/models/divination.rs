use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Language for user-visible messages and prompts. Chinese unless asked otherwise.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Language {
    #[default]
    #[serde(rename = "zh", alias = "zh-CN", alias = "zh-cn", alias = "zh_CN")]
    Zh,
    #[serde(rename = "en", alias = "en-US", alias = "en-us", alias = "en_US")]
    En,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Zh => "zh",
            Language::En => "en",
        }
    }

    /// Lenient parse: anything that is not English falls back to Chinese.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_lowercase()) {
            Some(s) if s.starts_with("en") => Language::En,
            _ => Language::Zh,
        }
    }
}

/// Body of `POST /divination`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DivinationRequest {
    pub prompt_type: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub language: Option<String>,
    /// Kind-specific fields (birth data, drawn cards, ...).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl DivinationRequest {
    pub fn language(&self) -> Language {
        Language::parse(self.language.as_deref())
    }

    /// Inputs that identify the request for caching: the prompt, the resolved
    /// language and every kind-specific field.
    pub fn cache_inputs(&self) -> Value {
        let mut inputs = self.fields.clone();
        inputs.insert("prompt".into(), Value::String(self.prompt.trim().to_string()));
        inputs.insert("language".into(), Value::String(self.language().as_str().into()));
        Value::Object(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: Value) -> DivinationRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn cache_inputs_depend_on_language() {
        let zh = request(json!({ "prompt_type": "bazi", "prompt": "事业", "birth": "1990-01-01" }));
        let en = request(json!({ "prompt_type": "bazi", "prompt": "事业", "birth": "1990-01-01", "language": "en-US" }));
        let alias = request(json!({ "prompt_type": "bazi", "prompt": " 事业 ", "birth": "1990-01-01", "language": "zh-CN" }));

        assert_ne!(zh.cache_inputs(), en.cache_inputs());
        assert_eq!(zh.cache_inputs(), alias.cache_inputs());
        assert_eq!(en.cache_inputs()["language"], "en");
    }
}
