use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use studybuddy_chat::DEFAULT_FRAME_INTERVAL;
use studybuddy_llm::{
    DEFAULT_GEMINI_MODEL, DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_SYSTEM_INSTRUCTION,
    DEFAULT_TEMPERATURE, DEFAULT_TOP_K, DEFAULT_TOP_P, GEMINI_PROVIDER_ID, GenerationOptions,
    ProviderConfig,
};
use tempfile::NamedTempFile;

pub const SETTINGS_DIRECTORY_NAME: &str = "studybuddy";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "STUDYBUDDY_";
pub const FALLBACK_API_KEY_ENV: &str = "GEMINI_API_KEY";

const TEMPERATURE_RANGE: (f64, f64) = (0.0, 2.0);
const TOP_P_RANGE: (f64, f64) = (0.0, 1.0);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    /// Empty means the provider's own endpoint.
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u64,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            base_url: String::new(),
            model: default_model(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            system_instruction: default_system_instruction(),
            frame_interval_ms: default_frame_interval_ms(),
        }
    }
}

impl AppSettings {
    pub fn normalized(mut self) -> Self {
        self.provider_id = non_blank_or(self.provider_id, default_provider_id);
        self.api_key = self.api_key.trim().to_string();
        self.base_url = self.base_url.trim().to_string();
        self.model = non_blank_or(self.model, default_model);
        self.system_instruction = self.system_instruction.trim().to_string();

        self.temperature = if self.temperature.is_finite() {
            self.temperature.clamp(TEMPERATURE_RANGE.0, TEMPERATURE_RANGE.1)
        } else {
            default_temperature()
        };
        self.top_p = if self.top_p.is_finite() {
            self.top_p.clamp(TOP_P_RANGE.0, TOP_P_RANGE.1)
        } else {
            default_top_p()
        };
        if self.max_output_tokens == 0 {
            self.max_output_tokens = default_max_output_tokens();
        }
        if self.top_k == 0 {
            self.top_k = default_top_k();
        }
        if self.frame_interval_ms == 0 {
            self.frame_interval_ms = default_frame_interval_ms();
        }

        self
    }

    pub fn to_provider_config(&self) -> Option<ProviderConfig> {
        if self.api_key.trim().is_empty() {
            return None;
        }

        Some(ProviderConfig::new(
            &self.provider_id,
            &self.api_key,
            &self.base_url,
        ))
    }

    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions::new(self.model.clone())
            .with_system_instruction(self.system_instruction.clone())
            .with_temperature(self.temperature)
            .with_max_output_tokens(self.max_output_tokens)
            .with_top_k(self.top_k)
            .with_top_p(self.top_p)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<AppSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".studybuddy"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_layered(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: AppSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Defaults, then the JSON file, then `STUDYBUDDY_*` variables.
    fn load_layered(path: &Path) -> AppSettings {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no settings file, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(AppSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        let mut settings = figment.extract::<AppSettings>().unwrap_or_else(|error| {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "ignoring unreadable settings"
            );
            AppSettings::default()
        });

        if settings.api_key.trim().is_empty()
            && let Ok(api_key) = std::env::var(FALLBACK_API_KEY_ENV)
        {
            settings.api_key = api_key;
        }

        settings.normalized()
    }

    /// Writes into a sibling temp file and renames it over the target.
    fn persist(&self, settings: &AppSettings) -> Result<(), SettingsError> {
        let directory = match self.config_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&directory).context(PersistSnafu {
            stage: "create-settings-directory",
            path: directory.clone(),
        })?;

        let content = serde_json::to_vec_pretty(settings).context(SerializeSnafu {
            stage: "serialize-settings",
        })?;

        let mut staged = NamedTempFile::new_in(&directory).context(PersistSnafu {
            stage: "create-staging-file",
            path: directory.clone(),
        })?;
        staged.write_all(&content).context(PersistSnafu {
            stage: "write-staging-file",
            path: staged.path().to_path_buf(),
        })?;
        staged
            .persist(&self.config_path)
            .map_err(|error| error.error)
            .context(PersistSnafu {
                stage: "replace-settings-file",
                path: self.config_path.clone(),
            })?;

        tracing::info!(path = %self.config_path.display(), "settings saved");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to encode settings on `{stage}`: {source}"))]
    Serialize {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to save settings at {path:?} on `{stage}`: {source}"))]
    Persist {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

fn non_blank_or(value: String, default: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default()
    } else {
        trimmed.to_string()
    }
}

fn default_provider_id() -> String {
    GEMINI_PROVIDER_ID.to_string()
}

fn default_model() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_max_output_tokens() -> u64 {
    DEFAULT_MAX_OUTPUT_TOKENS
}

fn default_top_k() -> u32 {
    DEFAULT_TOP_K
}

fn default_top_p() -> f64 {
    DEFAULT_TOP_P
}

fn default_system_instruction() -> String {
    DEFAULT_SYSTEM_INSTRUCTION.to_string()
}

fn default_frame_interval_ms() -> u64 {
    u64::try_from(DEFAULT_FRAME_INTERVAL.as_millis()).unwrap_or(16)
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn normalization_restores_defaults_and_clamps() {
        let settings = AppSettings {
            provider_id: "  ".to_string(),
            api_key: "  key  ".to_string(),
            model: String::new(),
            temperature: 7.5,
            max_output_tokens: 0,
            top_k: 0,
            top_p: 3.0,
            frame_interval_ms: 0,
            ..AppSettings::default()
        }
        .normalized();

        assert_eq!(settings.provider_id, GEMINI_PROVIDER_ID);
        assert_eq!(settings.api_key, "key");
        assert_eq!(settings.model, DEFAULT_GEMINI_MODEL);
        assert_eq!(settings.temperature, 2.0);
        assert_eq!(settings.max_output_tokens, DEFAULT_MAX_OUTPUT_TOKENS);
        assert_eq!(settings.top_k, DEFAULT_TOP_K);
        assert_eq!(settings.top_p, 1.0);
        assert_eq!(settings.frame_interval(), DEFAULT_FRAME_INTERVAL);
    }

    #[test]
    fn provider_config_requires_an_api_key() {
        let mut settings = AppSettings::default();
        assert_eq!(settings.to_provider_config(), None);

        settings.api_key = "secret".to_string();
        let config = settings.to_provider_config().expect("config with key");
        assert_eq!(config.provider_id, GEMINI_PROVIDER_ID);
        assert_eq!(config.api_key, "secret");
        assert_eq!(config.base_url, "");
    }

    #[test]
    fn generation_options_follow_settings() {
        let settings = AppSettings {
            model: "gemini-test".to_string(),
            temperature: 0.2,
            max_output_tokens: 512,
            top_k: 40,
            top_p: 0.9,
            system_instruction: String::new(),
            ..AppSettings::default()
        };

        let options = settings.generation_options();
        assert_eq!(options.model_id, "gemini-test");
        assert_eq!(options.temperature, Some(0.2));
        assert_eq!(options.max_output_tokens, Some(512));
        assert_eq!(options.top_k, Some(40));
        assert_eq!(options.top_p, Some(0.9));
        assert_eq!(options.system_instruction, None);
    }

    #[test]
    fn env_overrides_json_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                SETTINGS_FILE_NAME,
                r#"{ "api_key": "from-file", "model": "gemini-file", "temperature": 0.3 }"#,
            )?;
            jail.set_env("STUDYBUDDY_MODEL", "gemini-env");

            let store = SettingsStore::new(PathBuf::from(SETTINGS_FILE_NAME));
            let settings = store.settings();
            assert_eq!(settings.api_key, "from-file");
            assert_eq!(settings.model, "gemini-env");
            assert_eq!(settings.temperature, 0.3);
            assert_eq!(settings.max_output_tokens, DEFAULT_MAX_OUTPUT_TOKENS);
            assert_eq!(settings.top_k, 1);
            assert_eq!(settings.top_p, 1.0);
            Ok(())
        });
    }

    #[test]
    fn gemini_api_key_fills_a_missing_key() {
        Jail::expect_with(|jail| {
            jail.set_env(FALLBACK_API_KEY_ENV, "fallback-key");

            let store = SettingsStore::new(PathBuf::from("missing.json"));
            assert_eq!(store.settings().api_key, "fallback-key");
            assert_eq!(store.settings().provider_id, GEMINI_PROVIDER_ID);
            Ok(())
        });
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(SETTINGS_FILE_NAME, "{ not json")?;
            jail.set_env(FALLBACK_API_KEY_ENV, "");

            let store = SettingsStore::new(PathBuf::from(SETTINGS_FILE_NAME));
            let settings = store.settings();
            assert_eq!(settings.model, DEFAULT_GEMINI_MODEL);
            assert_eq!(settings.api_key, "");
            Ok(())
        });
    }

    #[test]
    fn update_persists_normalized_settings() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        store
            .update(AppSettings {
                api_key: " saved-key ".to_string(),
                model: "gemini-saved".to_string(),
                ..AppSettings::default()
            })
            .expect("settings persist");

        assert_eq!(store.settings().api_key, "saved-key");
        let leftovers = std::fs::read_dir(path.parent().expect("nested dir"))
            .expect("list settings dir")
            .count();
        assert_eq!(leftovers, 1, "only the settings file remains");

        let written: AppSettings =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("file written"))
                .expect("valid json");
        assert_eq!(written.model, "gemini-saved");
        assert_eq!(written.api_key, "saved-key");
    }
}
