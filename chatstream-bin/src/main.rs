use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use chatstream_core::{
    accumulator::Dialect,
    auth::{EnvToken, StaticToken, TokenSource},
    chat_api::ChatApi,
    config::Config,
    conversation::{Conversation, InMemoryConversation},
    documents::ApiDocuments,
    model::{DocumentRef, Role},
    normalizer::prompt_request,
    session::{SessionController, SessionOutcome, SessionSettings, SessionUpdate},
    transport::{CompletionTransport, ScriptStep, ScriptedTransport},
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "chatstream CLI", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream an answer (Ctrl-C cancels and keeps the partial text)
    Chat {
        #[arg(short, long, help = "Message from the user")]
        message: String,
        #[arg(long = "doc", help = "Attached document id (repeatable)")]
        docs: Vec<String>,
    },
    /// Non-streaming completion
    Complete {
        #[arg(short, long, help = "Message from the user")]
        message: String,
    },
    /// Replay a recorded response body through the streaming pipeline
    Replay {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value_t = 64, value_parser = clap::value_parser!(u64).range(1..))]
        chunk_size: u64,
        #[arg(long, default_value_t = 0, help = "Pause between chunks, in milliseconds")]
        delay_ms: u64,
        #[arg(long, help = "flat, delta or auto; overrides the config")]
        dialect: Option<Dialect>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => Config::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Chat { message, docs } => {
            let api = ChatApi::from_config(&cfg)?;
            let auth: Arc<dyn TokenSource> = Arc::new(EnvToken::new(&cfg.auth.token_env));
            let settings = SessionSettings::from_config(&cfg)
                .with_documents(Arc::new(ApiDocuments::new(api.clone(), auth.clone())));
            let refs = docs.iter().map(|d| DocumentRef::from(d.as_str()));
            stream_session(Arc::new(api), auth, settings, &message, refs).await
        }
        Commands::Complete { message } => {
            let prompt = prompt_request(&message, Vec::new())?;
            let api = ChatApi::from_config(&cfg)?;
            let token = EnvToken::new(&cfg.auth.token_env)
                .bearer_token()
                .with_context(|| format!("set {} to a bearer token", cfg.auth.token_env))?;
            let resp = api.create_chat_completion(&prompt, &token).await?;
            println!("{}", resp.text());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Replay {
            file,
            chunk_size,
            delay_ms,
            dialect,
        } => {
            let body = tokio::fs::read(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let pause = Duration::from_millis(delay_ms);
            let steps = body
                .chunks(chunk_size as usize)
                .flat_map(|c| {
                    let delay = (!pause.is_zero()).then_some(ScriptStep::Delay(pause));
                    delay.into_iter().chain([ScriptStep::Chunk(Bytes::copy_from_slice(c))])
                })
                .collect();
            let transport = ScriptedTransport::new().then_body(steps);
            let mut settings = SessionSettings::from_config(&cfg);
            if let Some(d) = dialect {
                settings.dialect = d;
            }
            stream_session(
                Arc::new(transport),
                Arc::new(StaticToken::new("replay")),
                settings,
                &format!("replay of {}", file.display()),
                Vec::new(),
            )
            .await
        }
    }
}

async fn stream_session(
    transport: Arc<dyn CompletionTransport>,
    auth: Arc<dyn TokenSource>,
    settings: SessionSettings,
    message: &str,
    refs: impl IntoIterator<Item = DocumentRef>,
) -> anyhow::Result<ExitCode> {
    let conversation = Arc::new(InMemoryConversation::new());
    let (controller, mut updates) =
        SessionController::new(transport, auth, conversation.clone(), settings);
    let mut handle = controller.start(message, refs)?;

    let mut shown = String::new();
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else { break };
                if render(&mut shown, update) {
                    break;
                }
            }
            res = tokio::signal::ctrl_c(), if !handle.is_cancelled() => {
                res?;
                handle.cancel();
            }
        }
    }

    match handle.outcome().await {
        SessionOutcome::Completed(_) => {
            if let Some(user) = conversation.messages().first()
                && !user.document_refs.is_empty()
            {
                match controller.resolve_attachments(user).await {
                    Ok(docs) => {
                        for doc in docs {
                            eprintln!("[attached: {} ({})]", doc.title, doc.filename);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "could not resolve attachments"),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        SessionOutcome::Cancelled(_) => {
            eprintln!("[cancelled]");
            Ok(ExitCode::SUCCESS)
        }
        SessionOutcome::Failed(failure) => {
            if let Some(partial) = failure.partial_text.filter(|p| !p.is_empty()) {
                eprintln!("[discarded partial answer: {} chars]", partial.chars().count());
            }
            eprintln!(
                "[error: {}{}]",
                failure.message,
                if failure.retryable { "; retry may help" } else { "" }
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Print the assistant text as it grows. Returns `true` on a terminal update.
fn render(shown: &mut String, update: SessionUpdate) -> bool {
    use std::io::{self, Write};

    match update {
        SessionUpdate::Message { state, message, .. } => {
            if message.role == Role::Assistant {
                match message.content.strip_prefix(shown.as_str()) {
                    Some(tail) => print!("{tail}"),
                    None => print!("\n{}", message.content),
                }
                io::stdout().flush().ok();
                shown.clone_from(&message.content);
            }
            if state.is_terminal() {
                if !shown.is_empty() {
                    println!();
                }
                return true;
            }
            false
        }
        SessionUpdate::Failed { .. } => {
            if !shown.is_empty() {
                println!();
            }
            true
        }
    }
}
