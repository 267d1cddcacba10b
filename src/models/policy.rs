use serde::{Deserialize, Serialize};

/// Degradation levels, ordered by severity.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum DegradationLevel {
    #[default]
    Normal,
    Light,
    Moderate,
    Severe,
    Critical,
}

impl DegradationLevel {
    pub const ALL: [DegradationLevel; 5] = [
        DegradationLevel::Normal,
        DegradationLevel::Light,
        DegradationLevel::Moderate,
        DegradationLevel::Severe,
        DegradationLevel::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::Normal => "normal",
            DegradationLevel::Light => "light",
            DegradationLevel::Moderate => "moderate",
            DegradationLevel::Severe => "severe",
            DegradationLevel::Critical => "critical",
        }
    }

    /// Level reached after crossing `index` thresholds (0 = none crossed).
    pub fn from_index(index: usize) -> Self {
        Self::ALL[index.min(Self::ALL.len() - 1)]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Quick,
    Standard,
    Detailed,
}

impl OutputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Quick => "quick",
            OutputMode::Standard => "standard",
            OutputMode::Detailed => "detailed",
        }
    }
}

/// Model cost tier. Ordered cheapest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Economy,
    Standard,
    Premium,
}

/// The output-shaping directive published by the degradation controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Policy {
    pub level: DegradationLevel,
    pub output_mode: OutputMode,
    pub max_output_tokens: u32,
    /// `None` leaves candidate ordering untouched.
    pub model_tier: Option<ModelTier>,
    pub cache_only: bool,
    pub reject_new: bool,
}

impl Policy {
    pub fn for_level(level: DegradationLevel) -> Self {
        match level {
            DegradationLevel::Normal => Self {
                level,
                output_mode: OutputMode::Detailed,
                max_output_tokens: 4096,
                model_tier: None,
                cache_only: false,
                reject_new: false,
            },
            DegradationLevel::Light => Self {
                level,
                output_mode: OutputMode::Standard,
                max_output_tokens: 2048,
                model_tier: Some(ModelTier::Standard),
                cache_only: false,
                reject_new: false,
            },
            DegradationLevel::Moderate => Self {
                level,
                output_mode: OutputMode::Standard,
                max_output_tokens: 1024,
                model_tier: Some(ModelTier::Economy),
                cache_only: false,
                reject_new: false,
            },
            DegradationLevel::Severe => Self {
                level,
                output_mode: OutputMode::Quick,
                max_output_tokens: 512,
                model_tier: Some(ModelTier::Economy),
                cache_only: true,
                reject_new: false,
            },
            DegradationLevel::Critical => Self {
                level,
                output_mode: OutputMode::Quick,
                max_output_tokens: 256,
                model_tier: Some(ModelTier::Economy),
                cache_only: true,
                reject_new: true,
            },
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Self::for_level(DegradationLevel::Normal)
    }
}

/// Snapshot the controller evaluates on every tick.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemMetrics {
    /// Calls finished in the trailing hour.
    #[serde(default)]
    pub calls: u64,
    pub hourly_cost: f64,
    pub daily_cost: f64,
    pub error_rate: f64,
    pub p95_latency_s: f64,
    pub active_requests: usize,
    pub cache_hit_rate: f64,
}

/// Per-signal thresholds, one per non-normal level in increasing severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    pub hourly_cost: [f64; 4],
    pub error_rate: [f64; 4],
    pub p95_latency_s: [f64; 4],
    /// The error rate is ignored below this many calls in the hour.
    #[serde(default = "default_min_error_samples")]
    pub min_error_samples: u64,
}

fn default_min_error_samples() -> u64 {
    20
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            hourly_cost: [8.0, 15.0, 25.0, 40.0],
            error_rate: [0.05, 0.10, 0.20, 0.30],
            p95_latency_s: [8.0, 15.0, 25.0, 40.0],
            min_error_samples: default_min_error_samples(),
        }
    }
}

/// Partial update for the admin thresholds endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThresholdsUpdate {
    pub hourly_cost: Option<[f64; 4]>,
    pub error_rate: Option<[f64; 4]>,
    pub p95_latency_s: Option<[f64; 4]>,
    pub min_error_samples: Option<u64>,
}

impl Thresholds {
    pub fn apply(&mut self, update: ThresholdsUpdate) {
        if let Some(v) = update.hourly_cost {
            self.hourly_cost = v;
        }
        if let Some(v) = update.error_rate {
            self.error_rate = v;
        }
        if let Some(v) = update.p95_latency_s {
            self.p95_latency_s = v;
        }
        if let Some(v) = update.min_error_samples {
            self.min_error_samples = v;
        }
    }
}
