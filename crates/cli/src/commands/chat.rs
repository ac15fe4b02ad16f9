//! `hearth chat`: interactive or single-message chat with tool calling.

use std::io::Write;
use std::path::PathBuf;

use futures::StreamExt;
use hearth_agent::ToolSession;
use hearth_config::AppConfig;
use tokio::io::{AsyncBufReadExt, BufReader};

pub async fn run(
    mut config: AppConfig,
    model: Option<PathBuf>,
    message: Option<String>,
    stream: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if model.is_some() {
        config.model_path = model;
    }
    let session = start_session(&config)?;
    tracing::debug!(session = %session.session().id(), stream, "chat session ready");

    if let Some(msg) = message {
        // Single message mode
        respond(&session, msg, stream).await?;
        session.stop();
        return Ok(());
    }

    let registry_names = hearth_tools::default_registry()?
        .names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    println!();
    println!("  Hearth interactive chat");
    println!("  Model:  {}", config.require_model_path()?.display());
    println!("  Tools:  {registry_names}");
    println!("  Type 'exit' or 'quit' to leave.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        if let Err(e) = respond(&session, line.to_string(), stream).await {
            eprintln!("  [Error] {e}");
            if !session.session().is_running() {
                break;
            }
        }
        println!();
    }

    session.stop();
    println!();
    Ok(())
}

async fn respond(
    session: &ToolSession,
    message: String,
    stream: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if stream {
        let mut fragments = session.inference_stream(message);
        while let Some(fragment) = fragments.next().await {
            print!("{}", fragment?);
            std::io::stdout().flush()?;
        }
        println!();
    } else {
        let answer = session.infer(message).await?;
        println!("{}", answer.trim_end());
    }
    Ok(())
}

#[cfg(feature = "llama")]
fn start_session(config: &AppConfig) -> Result<ToolSession, Box<dyn std::error::Error>> {
    use hearth_engine::llama::LlamaCppBackend;

    let model = config.require_model_path()?.to_path_buf();
    let session_config = config.session.clone();
    let sampling = config.sampling.clone();
    let session = ToolSession::with_factory(
        &config.session,
        &config.agent,
        hearth_tools::default_registry()?,
        move || Ok(LlamaCppBackend::load(&model, &session_config, &sampling)?),
    )?;
    Ok(session)
}

#[cfg(not(feature = "llama"))]
fn start_session(config: &AppConfig) -> Result<ToolSession, Box<dyn std::error::Error>> {
    config.require_model_path()?;
    Err("no inference backend compiled in; rebuild with `--features llama`".into())
}
