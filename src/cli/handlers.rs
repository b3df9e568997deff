use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tracing::{debug, info};

use crate::cli::commands::{AskCommand, ChatCommand};
use crate::config::DocentConfig;
use crate::runtime::{ArtworkMetadata, ChannelSink, GenerationOutcome, StreamEvent};
use crate::service::DocentService;

/// Fragments buffered between the decode thread and stdout
const STREAM_BUFFER: usize = 32;

pub async fn handle_ask(config: DocentConfig, cmd: AskCommand) -> Result<()> {
    let artwork = cmd.artwork.resolve()?;
    let service = open_service(config, artwork).await?;

    let outcome = stream_answer(service, cmd.question).await?;
    if cmd.stats {
        println!("{}", serde_json::to_string_pretty(&outcome.stats)?);
    }
    Ok(())
}

pub async fn handle_chat(config: DocentConfig, cmd: ChatCommand) -> Result<()> {
    let artwork = cmd.artwork.resolve()?;
    let title = artwork.title.clone();
    let service = open_service(config, artwork).await?;

    eprintln!("Ask about \"{}\". /stats prints telemetry, /quit exits.", title);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match line.trim() {
            "" => continue,
            "/quit" => break,
            "/stats" => {
                println!("{}", serde_json::to_string_pretty(&service.telemetry())?);
            }
            question => {
                let outcome = stream_answer(service.clone(), question.to_string()).await?;
                eprintln!(
                    "[{} tokens, {:.1} tok/s, {:?}]",
                    outcome.tokens_generated, outcome.stats.tokens_per_second, outcome.finish_reason
                );
            }
        }
    }

    service.close_session();
    Ok(())
}

pub async fn handle_config(config: DocentConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Load the configured model and prime the session with `artwork`.
async fn open_service(config: DocentConfig, artwork: ArtworkMetadata) -> Result<Arc<DocentService>> {
    let model_path = config
        .model
        .path
        .clone()
        .context("No model configured; pass --model or set DOCENT_MODEL__PATH")?;
    let service = Arc::new(DocentService::with_reference_loader(config));

    let worker = service.clone();
    tokio::task::spawn_blocking(move || -> Result<()> {
        worker
            .load_model(&model_path)
            .with_context(|| format!("Failed to load model {}", model_path.display()))?;
        worker.init_session(None).context("Failed to initialize session")?;
        let prefix = worker
            .prime_fixed_prefix(&artwork)
            .context("Failed to prime artwork prefix")?;
        info!("Artwork prefix cached ({} tokens)", prefix.token_count);
        Ok(())
    })
    .await
    .context("Session setup task failed")??;

    Ok(service)
}

/// Run one generation on a blocking thread and copy its fragments to stdout.
///
/// Ctrl-C cancels the generation; the partial answer is kept.
async fn stream_answer(service: Arc<DocentService>, question: String) -> Result<GenerationOutcome> {
    let (mut sink, rx) = ChannelSink::channel(STREAM_BUFFER);
    let worker = service.clone();
    let task = tokio::task::spawn_blocking(move || worker.generate(&question, &mut sink, None));

    let mut stream = ReceiverStream::new(rx);
    let mut stdout = tokio::io::stdout();
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(StreamEvent::Fragment(text)) => {
                    stdout.write_all(text.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Some(StreamEvent::Finished(reason)) => debug!("Stream finished: {:?}", reason),
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                service.cancel_generation();
            }
        }
    }
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;

    let outcome = task.await.context("Generation task failed")??;
    Ok(outcome)
}
