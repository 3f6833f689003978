use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::env;
use std::thread;
use std::time::Duration;

use crate::codec::{merge_options, Registry};
use crate::job::InputFile;

pub const DEFAULT_MAX_OPTIMIZER_ROUNDS: u32 = 8;

/// Process-wide defaults for the pool and the optimizer
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub workers: usize,
    pub max_optimizer_rounds: u32,
    pub optimizer_target: Option<f64>,
    pub job_timeout: Option<Duration>,
}

fn available_workers() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            workers: env::var("PIXPRESS_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or_else(available_workers),
            max_optimizer_rounds: env::var("PIXPRESS_MAX_OPTIMIZER_ROUNDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &u32| n > 0)
                .unwrap_or(DEFAULT_MAX_OPTIMIZER_ROUNDS),
            optimizer_target: env::var("PIXPRESS_OPTIMIZER_TARGET")
                .ok()
                .and_then(|v| v.parse().ok()),
            job_timeout: env::var("PIXPRESS_JOB_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: available_workers(),
            max_optimizer_rounds: DEFAULT_MAX_OPTIMIZER_ROUNDS,
            optimizer_target: None,
            job_timeout: None,
        }
    }
}

/// A per-codec or per-pass entry: `true`/`false`, `"auto"`, a JSON string,
/// or an options object.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Setting {
    Toggle(bool),
    Text(String),
    Options(Map<String, Value>),
}

/// How a codec was asked to encode.
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderSetting {
    /// Overrides for the codec defaults.
    Fixed(Value),
    Auto,
}

impl Setting {
    fn options(&self, name: &str) -> Result<Option<Value>> {
        match self {
            Setting::Toggle(false) => Ok(None),
            Setting::Toggle(true) => Ok(Some(Value::Object(Map::new()))),
            Setting::Options(map) => Ok(Some(Value::Object(map.clone()))),
            Setting::Text(text) => {
                let value: Value = serde_json::from_str(text)
                    .with_context(|| format!("options for {name} are not valid JSON: {text}"))?;
                if value.is_object() {
                    Ok(Some(value))
                } else {
                    Err(anyhow!("options for {name} must be a JSON object, got {text}"))
                }
            }
        }
    }

    fn is_auto(&self) -> bool {
        matches!(self, Setting::Text(text) if text.trim().eq_ignore_ascii_case("auto"))
    }
}

/// Options for one batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunConfig {
    #[serde(skip)]
    pub files: Vec<InputFile>,
    /// Appended to each output base name.
    pub suffix: String,
    /// Directory prefix for output names. Nothing is written by the pipeline.
    pub output_dir: String,
    pub max_optimizer_rounds: u32,
    /// Target distance for auto mode. Absent, `false` or zero disables auto
    /// mode.
    #[serde(deserialize_with = "falsy_target")]
    pub optimizer_butteraugli_target: Option<f64>,
    /// Codec and preprocessor entries keyed by registered name.
    #[serde(flatten)]
    pub settings: BTreeMap<String, Setting>,
}

/// Accepts a number, `false` or `null`; anything falsy becomes `None`.
fn falsy_target<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Target {
        Number(f64),
        Toggle(bool),
    }

    Ok(match Option::<Target>::deserialize(deserializer)? {
        Some(Target::Number(n)) if n != 0.0 => Some(n),
        Some(Target::Number(_)) | Some(Target::Toggle(_)) | None => None,
    })
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            suffix: String::new(),
            output_dir: String::new(),
            max_optimizer_rounds: DEFAULT_MAX_OPTIMIZER_ROUNDS,
            optimizer_butteraugli_target: None,
            settings: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    pub fn new(files: Vec<InputFile>) -> Self {
        Self {
            files,
            ..Self::default()
        }
    }

    pub fn with_setting(mut self, name: impl Into<String>, setting: Setting) -> Self {
        self.settings.insert(name.into(), setting);
        self
    }

    pub fn with_target(mut self, target: f64) -> Self {
        self.optimizer_butteraugli_target = Some(target);
        self
    }

    /// The auto-mode target, or `None` when auto mode is off for the batch.
    pub fn optimizer_target(&self) -> Option<f64> {
        self.optimizer_butteraugli_target
            .filter(|t| t.is_finite() && *t > 0.0)
    }

    /// `None` if the codec is not enabled.
    pub fn encoder_setting(&self, codec: &str) -> Result<Option<EncoderSetting>> {
        match self.settings.get(codec) {
            None => Ok(None),
            Some(setting) if setting.is_auto() => Ok(Some(EncoderSetting::Auto)),
            Some(setting) => Ok(setting.options(codec)?.map(EncoderSetting::Fixed)),
        }
    }

    /// Merged options for an enabled preprocessing pass.
    pub fn preprocessor_options(&self, name: &str, defaults: &Value) -> Result<Option<Value>> {
        match self.settings.get(name) {
            None => Ok(None),
            Some(setting) => Ok(setting
                .options(name)?
                .map(|overrides| merge_options(defaults, &overrides))),
        }
    }

    /// Reject entries that name nothing in the registry and malformed values.
    pub fn validate(&self, registry: &Registry) -> Result<()> {
        if self.max_optimizer_rounds == 0 {
            return Err(anyhow!("maxOptimizerRounds must be a positive integer"));
        }
        for (name, setting) in &self.settings {
            if registry.codec(name).is_some() {
                self.encoder_setting(name)?;
            } else if let Some(pass) = registry.preprocessor(name) {
                self.preprocessor_options(name, &pass.default_options())?;
            } else {
                return Err(anyhow!("unknown codec or preprocessor: {name} ({setting:?})"));
            }
        }
        Ok(())
    }
}
