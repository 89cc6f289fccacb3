//! `review`: run a compliance review of a local document, or answer a
//! compliance question, against an OpenAI-compatible model.

mod config;
mod inputs;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use review_engine::ai::OpenAiModel;
use review_engine::{
    EventHub, JobError, LanguageModel, Orchestrator, ProgressEvent, RateLimitedModel,
    RequesterId, ResultStatus, ReviewInput, ReviewRequest, SourceKind, TenantId,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "review", about = "Compliance review and question answering")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Review a policy document against the ontology
    Document {
        /// Plain-text policy document
        path: PathBuf,

        /// Document title (defaults to the file name)
        #[arg(long)]
        title: Option<String>,

        #[command(flatten)]
        common: CommonArgs,
    },
    /// Answer a compliance question
    Ask {
        question: String,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Ontology JSON file
    #[arg(long)]
    ontology: PathBuf,

    /// Tenant document library passages (JSON)
    #[arg(long)]
    library: Option<PathBuf>,

    /// Legislation passages (JSON)
    #[arg(long)]
    legislation: Option<PathBuf>,

    /// Case law passages (JSON)
    #[arg(long)]
    case_law: Option<PathBuf>,

    /// Authoritative documents citations are verified against (JSON)
    #[arg(long)]
    authority: Option<PathBuf>,

    /// Ontology entry to review against, skipping classification
    #[arg(long)]
    target: Option<String>,

    /// Job deadline in seconds
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Tenant id (random when omitted)
    #[arg(long)]
    tenant: Option<TenantId>,

    /// Print progress events to stderr
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,review_engine=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .init();

    let cli = Cli::parse();
    let config = CliConfig::from_env().context("Failed to load configuration")?;

    let (input, common) = match cli.command {
        Command::Document {
            path,
            title,
            common,
        } => {
            let text = inputs::read_text(&path)?;
            let title = title.unwrap_or_else(|| file_title(&path));
            (ReviewInput::document(title, text), common)
        }
        Command::Ask { question, common } => (ReviewInput::question(question), common),
    };

    run(config, input, common).await
}

async fn run(config: CliConfig, input: ReviewInput, args: CommonArgs) -> Result<()> {
    let ontology = inputs::load_ontology(&args.ontology)?;
    let authority = inputs::load_authority(args.authority.as_deref())?;

    let openai = OpenAiModel::new(config.credentials.clone())?;
    tracing::info!(model = openai.model(), "Using OpenAI model");
    let model: Arc<dyn LanguageModel> = match config.requests_per_second {
        Some(rps) => Arc::new(RateLimitedModel::new(openai, rps)?),
        None => Arc::new(openai),
    };

    let hub = EventHub::with_capacity(config.review.event_buffer);
    let mut builder = Orchestrator::builder(model, Arc::new(authority))
        .with_publisher(Arc::new(hub.clone()))
        .with_ontology(ontology)
        .with_config(config.review.clone());
    let sources = [
        (&args.library, "policy library", SourceKind::TenantDocument),
        (&args.legislation, "legislation", SourceKind::Legislation),
        (&args.case_law, "case law", SourceKind::CaseLaw),
    ];
    for (path, name, kind) in sources {
        if let Some(path) = path {
            builder = builder.with_source(Arc::new(inputs::load_source(path, name, kind)?));
        }
    }
    let orchestrator = builder.build()?;

    let mut request = ReviewRequest::new(
        args.tenant.unwrap_or_default(),
        RequesterId::new(),
        input,
    );
    if let Some(secs) = args.deadline_secs {
        request = request.with_deadline(Duration::from_secs(secs));
    }
    if let Some(target) = args.target {
        request = request.with_confirmed_target(target);
    }

    let job_id = orchestrator.start(request).await?;
    let mut events = Box::pin(hub.subscribe(job_id));
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    if args.verbose {
                        print_event(&event);
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                let state = orchestrator.cancel(job_id).await?;
                tracing::warn!(%job_id, %state, "Cancelled by user");
            }
        }
    }
    hub.forget(job_id);

    match orchestrator.get_result(job_id).await? {
        ResultStatus::Ready(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        ResultStatus::Failed(error) => {
            print_job_error(&error);
            bail!("review failed: {}", error.code)
        }
        ResultStatus::Cancelled => bail!("review cancelled"),
        ResultStatus::Pending(state) => bail!("review still {state} after its event stream ended"),
    }
}

fn file_title(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}

fn print_event(event: &ProgressEvent) {
    match &event.criterion {
        Some(criterion) => eprintln!(
            "[{:>3}] {:<20} {}: {}",
            event.sequence, event.stage.as_str(), criterion, event.message
        ),
        None => eprintln!(
            "[{:>3}] {:<20} {}",
            event.sequence,
            event.stage.as_str(),
            event.message
        ),
    }
}

fn print_job_error(error: &JobError) {
    eprintln!("{error}");
    if !error.candidates.is_empty() {
        eprintln!("Possible targets (rerun with --target):");
        for candidate in &error.candidates {
            eprintln!(
                "  {:<24} {} ({:.0}%)",
                candidate.entry_id,
                candidate.name,
                candidate.confidence * 100.0
            );
        }
    }
}
