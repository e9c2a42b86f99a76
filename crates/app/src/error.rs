use std::path::PathBuf;

use snafu::Snafu;
use studybuddy_llm::ProviderError;

use crate::settings::SettingsError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AppError {
    #[snafu(display(
        "no API key configured; set `api_key` in {path:?} or export GEMINI_API_KEY (`{stage}`)"
    ))]
    MissingApiKey { stage: &'static str, path: PathBuf },
    #[snafu(display("failed to create model provider on `{stage}`: {source}"))]
    Provider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("failed to save settings on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("cannot read attachment {path:?} on `{stage}`: {source}"))]
    ReadAttachment {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("terminal i/o failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}
