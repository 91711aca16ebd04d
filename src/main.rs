mod chain;
mod config;
mod error;
mod intent;
mod models;
mod orchestrator;
mod policy;
mod providers;
mod quota;
mod storage;

use clap::{Parser, Subcommand};
// Crate-qualified: the `config` dependency shares the name.
use crate::config::{
    db_path, delete_api_key, ensure_initialized, load_config, save_config, set_api_key,
    AppConfig, ProviderKind, ProviderSettings,
};
use error::{AppError, ChatError};
use intent::KeywordIntentClassifier;
use models::{ChatFlags, ChatTurn, Mode, ProviderId, ReplyStyle, Tier};
use orchestrator::{ChatRequest, Orchestrator};
use providers::ProviderRegistry;
use reqwest::Client;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::{DocumentStore, Storage};
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "companion-relay")]
#[command(about = "Chat orchestration and usage quotas for an AI companion backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    AddProvider {
        provider: String,
        #[arg(long)]
        api_key: String,
        #[arg(long, default_value = "openai")]
        kind: String,
        #[arg(long)]
        model: String,
        #[arg(long)]
        fallback_model: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
    },
    RemoveProvider {
        provider: String,
    },
    Chat {
        #[arg(long)]
        uid: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        tier: Option<String>,
        #[arg(long, default_value = "general")]
        mode: String,
        #[arg(long)]
        fast: bool,
        #[arg(long)]
        voice: bool,
        #[arg(long)]
        short: bool,
        #[arg(long = "image")]
        images: Vec<String>,
        /// JSON array of `{"role": "user"|"assistant", "content": "..."}` turns.
        #[arg(long)]
        history: Option<PathBuf>,
        #[arg(long)]
        stream: bool,
    },
    Quota {
        #[arg(long)]
        uid: String,
        #[arg(long)]
        tier: Option<String>,
    },
    ExportAudit {
        #[arg(long, default_value = "json")]
        format: String,
    },
}

fn parse_provider(input: &str) -> Result<ProviderId, AppError> {
    ProviderId::parse(input).ok_or_else(|| {
        let known: Vec<&str> = ProviderId::ALL.iter().map(|id| id.as_label()).collect();
        AppError::Config(format!(
            "Unknown provider '{}'. Use one of: {}.",
            input.trim(),
            known.join(", ")
        ))
    })
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,companion_relay=info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn build_orchestrator(cfg: &AppConfig, store: Arc<Storage>) -> Result<Orchestrator, AppError> {
    let client = Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .timeout(std::time::Duration::from_secs(60))
        .build()?;
    let registry = ProviderRegistry::from_config(cfg, client);
    let mut orch = Orchestrator::new(store, registry, cfg);
    if cfg.orchestrator.intent_detection {
        let classifier =
            KeywordIntentClassifier::new().map_err(|e| AppError::Config(e.to_string()))?;
        orch = orch.with_classifier(Arc::new(classifier));
    }
    Ok(orch)
}

fn load_history(path: Option<&Path>) -> Result<Vec<ChatTurn>, AppError> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

async fn print_chunks(mut chunks: mpsc::Receiver<String>) {
    let mut out = std::io::stdout();
    while let Some(chunk) = chunks.recv().await {
        // Dropping the receiver stops the stream on the sending side.
        if write!(out, "{chunk}").and_then(|()| out.flush()).is_err() {
            break;
        }
    }
}

/// An explicit `--tier` wins; otherwise the stored account decides, defaulting to free.
async fn resolve_tier(store: &Storage, uid: &str, tier: Option<String>) -> Tier {
    if let Some(label) = tier {
        return Tier::parse(&label);
    }
    match store.get_account(uid).await {
        Ok(Some(account)) => account.tier,
        Ok(None) => Tier::Free,
        Err(err) => {
            warn!(uid, error = %err, "account lookup failed, assuming free tier");
            Tier::Free
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized companion-relay config and data directories.");
        }
        Commands::AddProvider {
            provider,
            api_key,
            kind,
            model,
            fallback_model,
            base_url,
        } => {
            ensure_initialized()?;
            let id = parse_provider(&provider)?;
            let mut cfg = load_config()?;
            cfg.providers.insert(
                id.as_label().to_string(),
                ProviderSettings {
                    kind: ProviderKind::parse(&kind)?,
                    base_url,
                    model,
                    fallback_model,
                    ..Default::default()
                },
            );
            set_api_key(id, &api_key)?;
            save_config(&cfg)?;
            println!("Provider '{}' configured.", id.as_label());
        }
        Commands::RemoveProvider { provider } => {
            ensure_initialized()?;
            let id = parse_provider(&provider)?;
            let mut cfg = load_config()?;
            cfg.providers.remove(id.as_label());
            delete_api_key(id)?;
            save_config(&cfg)?;
            println!("Provider '{}' removed.", id.as_label());
        }
        Commands::Chat {
            uid,
            message,
            tier,
            mode,
            fast,
            voice,
            short,
            images,
            history,
            stream,
        } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let history = load_history(history.as_deref())?;
            let store = match Storage::open(&db_path()?) {
                Ok(storage) => Arc::new(storage),
                Err(err) => {
                    let error = ChatError::StoreUnavailable(err.to_string()).payload();
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&serde_json::json!({ "error": error }))?
                    );
                    std::process::exit(1);
                }
            };
            let tier = resolve_tier(&store, &uid, tier).await;
            let orch = build_orchestrator(&cfg, store)?;

            let request = ChatRequest {
                uid,
                tier,
                mode: Mode::parse(&mode),
                message,
                history,
                flags: ChatFlags {
                    fast,
                    voice_session: voice,
                    attachments: images,
                    reply_style: if short {
                        ReplyStyle::Short
                    } else {
                        ReplyStyle::Full
                    },
                },
            };
            let mut reply = if stream {
                let (tx, rx) = mpsc::channel(32);
                let printer = tokio::spawn(print_chunks(rx));
                let reply = orch.check_and_consume_streaming(request, tx).await;
                if let Err(err) = printer.await {
                    warn!(error = %err, "stream printer stopped");
                }
                reply
            } else {
                orch.check_and_consume(request).await
            };
            // The process is about to exit; let the usage and audit writes land first.
            reply.settle().await;

            let summary = serde_json::to_string_pretty(&reply.view())?;
            if stream && reply.response.is_ok() {
                println!();
                eprintln!("{summary}");
            } else {
                println!("{summary}");
            }
            if reply.response.is_err() {
                std::process::exit(1);
            }
        }
        Commands::Quota { uid, tier } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let store = Arc::new(Storage::open(&db_path()?)?);
            let tier = resolve_tier(&store, &uid, tier).await;
            let orch = build_orchestrator(&cfg, store)?;
            let snapshot = orch.quota_snapshot(&uid, tier).await;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::ExportAudit { format } => {
            ensure_initialized()?;
            let storage = Storage::open(&db_path()?)?;
            if format.eq_ignore_ascii_case("json") {
                println!("{}", storage.export_audit_json().await?);
            } else if format.eq_ignore_ascii_case("csv") {
                println!("uid,mode,provider,message,reply,created_at");
                for r in storage.audit_entries().await? {
                    println!(
                        "{},{},{},{},{},{}",
                        csv_field(&r.uid),
                        csv_field(&r.mode),
                        csv_field(&r.provider),
                        csv_field(&r.message),
                        csv_field(&r.reply),
                        csv_field(&r.created_at.to_rfc3339()),
                    );
                }
            } else {
                return Err(AppError::Config(
                    "Unsupported export format. Use json or csv".into(),
                ));
            }
        }
    }

    Ok(())
}
