use std::sync::Arc;

use snafu::{OptionExt, ResultExt};
use studybuddy::error::{
    AppResult, MissingApiKeySnafu, ProviderSnafu, SettingsSnafu, TerminalSnafu,
};
use studybuddy::render::print_transcript;
use studybuddy::settings::{AppSettings, SettingsStore};
use studybuddy::shell::{Flow, Shell};
use studybuddy_chat::{ExchangeOrchestrator, FixedRateFrameClock, MessageStore};
use studybuddy_llm::{ModelClient, create_provider};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Logs go to stderr so they never interleave with the transcript on stdout.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        tracing::error!(error = %error, "studybuddy stopped");
        eprintln!("studybuddy: {error}");
        std::process::exit(1);
    }
}

async fn run() -> AppResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let settings_store = SettingsStore::load();
    let settings = ensure_api_key(&settings_store, &mut lines).await?;

    let config = settings.to_provider_config().context(MissingApiKeySnafu {
        stage: "provider-config",
        path: settings_store.config_path().to_path_buf(),
    })?;
    let provider = create_provider(config).context(ProviderSnafu {
        stage: "create-provider",
    })?;
    tracing::info!(
        provider = %provider.name(),
        model = %settings.model,
        "model client ready"
    );

    let store = MessageStore::new();
    let client = ModelClient::new(provider, settings.generation_options());
    let clock = Arc::new(FixedRateFrameClock::new(settings.frame_interval()));
    let mut shell = Shell::new(ExchangeOrchestrator::new(store.clone(), client, clock));
    let printer = tokio::spawn(print_transcript(store.subscribe(), tokio::io::stdout()));

    println!("StudyBuddy is ready. Type a question, or /help.");
    let mut notice = Vec::new();
    while let Some(line) = lines.next_line().await.context(TerminalSnafu {
        stage: "read-input-line",
    })? {
        let flow = shell.handle_line(&line, &mut notice).await;
        for message in notice.drain(..) {
            println!("{message}");
        }
        match flow {
            Ok(Flow::Quit) => break,
            Ok(Flow::Continue) => {}
            Err(error) => eprintln!("{error}"),
        }
    }

    printer.abort();
    Ok(())
}

/// Asks for a key on first run and saves it.
async fn ensure_api_key(
    settings_store: &SettingsStore,
    lines: &mut Lines<BufReader<Stdin>>,
) -> AppResult<Arc<AppSettings>> {
    let settings = settings_store.settings();
    if settings.to_provider_config().is_some() {
        return Ok(settings);
    }

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(b"Gemini API key: ")
        .await
        .context(TerminalSnafu {
            stage: "prompt-api-key",
        })?;
    stdout.flush().await.context(TerminalSnafu {
        stage: "prompt-api-key",
    })?;

    let api_key = lines
        .next_line()
        .await
        .context(TerminalSnafu {
            stage: "read-api-key",
        })?
        .unwrap_or_default();

    let mut updated = AppSettings::clone(&settings);
    updated.api_key = api_key;
    if updated.to_provider_config().is_none() {
        return MissingApiKeySnafu {
            stage: "read-api-key",
            path: settings_store.config_path().to_path_buf(),
        }
        .fail();
    }

    settings_store.update(updated).context(SettingsSnafu {
        stage: "save-api-key",
    })?;
    Ok(settings_store.settings())
}
