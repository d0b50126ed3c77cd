use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use playground_llm::{ProviderConfig, RIG_OPENAI_PROVIDER_ID, SamplingParams};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::config::{DEFAULT_SYSTEM_PROMPT, RequestConfig};

pub const SETTINGS_DIRECTORY_NAME: &str = "playground";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "PLAYGROUND_";
/// Local OpenAI-compatible runtime offered as a one-switch default.
pub const SAMPLE_BASE_URL: &str = "http://localhost:11434/v1";

/// Names accepted by [`PlaygroundSettings::set_field`].
pub const EDITABLE_FIELDS: &[&str] = &[
    "provider_id",
    "model",
    "base_url",
    "use_sample_base_url",
    "api_token",
    "system_prompt",
    "temperature",
    "max_tokens",
    "top_p",
    "frequency_penalty",
    "presence_penalty",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaygroundSettings {
    pub provider_id: String,
    pub model: String,
    pub base_url: String,
    pub use_sample_base_url: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    pub system_prompt: String,
    pub temperature: f64,
    pub max_tokens: u64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
}

impl Default for PlaygroundSettings {
    fn default() -> Self {
        let sampling = SamplingParams::default();
        Self {
            provider_id: RIG_OPENAI_PROVIDER_ID.to_string(),
            model: String::new(),
            base_url: String::new(),
            use_sample_base_url: false,
            api_token: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
            top_p: sampling.top_p,
            frequency_penalty: sampling.frequency_penalty,
            presence_penalty: sampling.presence_penalty,
        }
    }
}

impl PlaygroundSettings {
    pub fn normalized(mut self) -> Self {
        self.provider_id = if self.provider_id.trim().is_empty() {
            RIG_OPENAI_PROVIDER_ID.to_string()
        } else {
            self.provider_id.trim().to_string()
        };
        self.model = self.model.trim().to_string();
        self.base_url = self.base_url.trim().to_string();
        self.api_token = self
            .api_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty());
        self
    }

    /// The endpoint requests go to, if one is configured.
    pub fn resolved_base_url(&self) -> Option<&str> {
        if self.use_sample_base_url {
            return Some(SAMPLE_BASE_URL);
        }
        let base_url = self.base_url.trim();
        (!base_url.is_empty()).then_some(base_url)
    }

    /// Chat input stays disabled until this is true.
    pub fn is_configured(&self) -> bool {
        self.resolved_base_url().is_some()
    }

    pub fn to_request_config(&self) -> RequestConfig {
        RequestConfig {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            frequency_penalty: self.frequency_penalty,
            presence_penalty: self.presence_penalty,
            system_prompt: self.system_prompt.clone(),
            base_url: self.resolved_base_url().unwrap_or_default().to_string(),
            api_token: self.api_token.clone(),
        }
    }

    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        let base_url = self.resolved_base_url()?;
        Some(ProviderConfig::new(
            &self.provider_id,
            base_url,
            self.api_token.clone(),
        ))
    }

    /// Applies one `field = value` edit from the command line.
    ///
    /// Values are parsed here; range checks happen when a request is validated.
    pub fn set_field(&mut self, field: &str, value: &str) -> Result<(), SettingsError> {
        let value = value.trim();
        match field.trim() {
            "provider_id" => self.provider_id = value.to_string(),
            "model" => self.model = value.to_string(),
            "base_url" => self.base_url = value.to_string(),
            "use_sample_base_url" => self.use_sample_base_url = parse_bool(field, value)?,
            "api_token" => {
                self.api_token = (!value.is_empty()).then(|| value.to_string());
            }
            "system_prompt" => self.system_prompt = value.to_string(),
            "temperature" => self.temperature = parse_number(field, value)?,
            "max_tokens" => self.max_tokens = parse_number(field, value)?,
            "top_p" => self.top_p = parse_number(field, value)?,
            "frequency_penalty" => self.frequency_penalty = parse_number(field, value)?,
            "presence_penalty" => self.presence_penalty = parse_number(field, value)?,
            other => {
                return UnknownFieldSnafu {
                    stage: "set-settings-field",
                    field: other.to_string(),
                }
                .fail();
            }
        }

        tracing::debug!(field, "settings field updated");
        Ok(())
    }
}

/// Command-line values that win over every other layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SettingsOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

impl SettingsOverrides {
    fn apply_to(&self, mut settings: PlaygroundSettings) -> PlaygroundSettings {
        if let Some(model) = &self.model {
            settings.model = model.clone();
        }
        if let Some(base_url) = &self.base_url {
            settings.base_url = base_url.clone();
        }
        if let Some(api_token) = &self.api_token {
            settings.api_token = Some(api_token.clone());
        }
        if let Some(system_prompt) = &self.system_prompt {
            settings.system_prompt = system_prompt.clone();
        }
        if let Some(temperature) = self.temperature {
            settings.temperature = temperature;
        }
        if let Some(max_tokens) = self.max_tokens {
            settings.max_tokens = max_tokens;
        }
        settings
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<PlaygroundSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".playground"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf, overrides: &SettingsOverrides) -> Self {
        let settings = Self::load_layered(&config_path, overrides);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load(overrides: &SettingsOverrides) -> Self {
        Self::new(Self::default_config_path(), overrides)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<PlaygroundSettings> {
        self.settings.load_full()
    }

    /// Swaps the live settings without touching the file.
    pub fn replace(&self, settings: PlaygroundSettings) {
        self.settings.store(Arc::new(settings.normalized()));
    }

    pub fn update(&self, settings: PlaygroundSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Persists whatever is live right now.
    pub fn save(&self) -> Result<(), SettingsError> {
        self.persist(&self.settings())
    }

    fn load_layered(path: &Path, overrides: &SettingsOverrides) -> PlaygroundSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        let figment = Figment::from(Serialized::defaults(PlaygroundSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(overrides));

        match figment.extract::<PlaygroundSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                overrides
                    .apply_to(PlaygroundSettings::default())
                    .normalized()
            }
        }
    }

    fn persist(&self, settings: &PlaygroundSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("unknown setting `{field}`"))]
    UnknownField { stage: &'static str, field: String },
    #[snafu(display("invalid value {value:?} for `{field}`: {reason}"))]
    InvalidValue {
        stage: &'static str,
        field: String,
        value: String,
        reason: String,
    },
}

fn parse_number<T>(field: &str, value: &str) -> Result<T, SettingsError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|error| {
        InvalidValueSnafu {
            stage: "parse-settings-value",
            field,
            value,
            reason: error.to_string(),
        }
        .build()
    })
}

fn parse_bool(field: &str, value: &str) -> Result<bool, SettingsError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => InvalidValueSnafu {
            stage: "parse-settings-value",
            field,
            value,
            reason: "expected true or false",
        }
        .fail(),
    }
}
