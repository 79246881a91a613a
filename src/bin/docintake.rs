//! CLI binary for docintake.
//!
//! `serve` runs the HTTP service, `extract` runs one file through the model
//! without touching the database, and `create-user` provisions an account
//! and prints a bearer token for it.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use docintake::api::auth::{issue_token, TokenVerifier};
use docintake::api::{self, AppState};
use docintake::model::NewUser;
use docintake::pipeline::gemini::{GeminiBackend, DEFAULT_MODEL};
use docintake::pipeline::inference::is_retry_notice;
use docintake::quota::{DEFAULT_MAX_DOCUMENTS, UNLIMITED_MAX_DOCUMENTS};
use docintake::store::{self, UserRepository};
use docintake::{
    DocumentPipeline, Extractor, FileStore, IdCipher, InputArtifact, PipelineConfig,
    ProgressSink, PromptCatalog, UserTier,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers ──────────────────────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

// ── CLI progress sink using indicatif ────────────────────────────────────────

/// Terminal progress: a spinner showing the latest stage, with retry notices
/// kept in the scrollback.
struct SpinnerProgress {
    bar: ProgressBar,
}

impl SpinnerProgress {
    fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Extracting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for SpinnerProgress {
    fn report(&self, message: &str) {
        if is_retry_notice(message) {
            self.bar.println(format!("  {}", dim(message)));
        }
        self.bar.set_message(message.to_string());
    }
}

// ── Arguments ────────────────────────────────────────────────────────────────

const AFTER_HELP: &str = r#"ENVIRONMENT:
  Every option that names an env var can be set in a .env file in the
  working directory. Set RUST_LOG to override the log filter.

PDFIUM:
  Page limiting needs libpdfium. Set PDFIUM_LIB_PATH to the library file or
  its directory; otherwise the system copy is used. Without it, PDFs are
  sent whole and counted as one page.
"#;

/// Extract structured JSON from PDFs and images with a generative model.
#[derive(Parser, Debug)]
#[command(
    name = "docintake",
    version,
    about = "Extract structured JSON from PDFs and images with a generative model",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Debug-level logging.
    #[arg(short, long, global = true, env = "DOCINTAKE_VERBOSE")]
    verbose: bool,

    /// Errors only.
    #[arg(short, long, global = true, env = "DOCINTAKE_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API.
    Serve(ServeArgs),
    /// Run one file through the model and print the JSON record.
    Extract(ExtractArgs),
    /// Provision a user and print a bearer token.
    CreateUser(CreateUserArgs),
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// API key for the Gemini endpoint.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    gemini_api_key: String,

    #[arg(long, env = "MODEL_ID", default_value = DEFAULT_MODEL)]
    model: String,

    /// Retries after the first attempt.
    #[arg(long, env = "MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    /// Pages sent for capped runs.
    #[arg(long, env = "MAX_PAGES", default_value_t = 3)]
    max_pages: u32,

    /// Per-request timeout in seconds.
    #[arg(long, env = "API_TIMEOUT_SECS", default_value_t = 120)]
    api_timeout: u64,

    /// Prompt catalog (YAML). Required by `serve`; `extract` falls back to
    /// the built-in catalog when the file is absent.
    #[arg(long, env = "PROMPTS_PATH", default_value = "prompts/prompts.yaml")]
    prompts: PathBuf,
}

impl ModelArgs {
    fn config(&self) -> Result<PipelineConfig> {
        Ok(PipelineConfig::builder()
            .max_pages_limited(self.max_pages)
            .max_retries(self.max_retries)
            .build()?)
    }

    fn backend(&self) -> Result<GeminiBackend> {
        GeminiBackend::new(
            self.gemini_api_key.clone(),
            self.model.clone(),
            Duration::from_secs(self.api_timeout.max(1)),
        )
        .context("failed to build HTTP client")
    }

    fn catalog(&self) -> Result<PromptCatalog> {
        PromptCatalog::load(&self.prompts)
            .with_context(|| format!("loading {}", self.prompts.display()))
    }

    fn catalog_or_builtin(&self) -> Result<PromptCatalog> {
        if self.prompts.exists() {
            self.catalog()
        } else {
            warn!(path = %self.prompts.display(), "Prompt catalog not found, using built-in prompts");
            Ok(PromptCatalog::builtin()?)
        }
    }
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    model: ModelArgs,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://docintake.db")]
    database_url: String,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 8)]
    db_connections: u32,

    /// Root under which uploads and JSON exports are stored.
    #[arg(long, env = "MEDIA_ROOT", default_value = ".")]
    media_root: PathBuf,

    /// 32-byte key, standard base64, used to encrypt document ids.
    #[arg(long, env = "DOCUMENT_ID_KEY", hide_env_values = true)]
    document_id_key: String,

    /// HS256 secret for bearer tokens.
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    #[arg(long, env = "BIND", default_value = "0.0.0.0:8000")]
    bind: String,

    /// Request body cap in MiB.
    #[arg(long, env = "MAX_UPLOAD_MB", default_value_t = 50)]
    max_upload_mb: usize,
}

#[derive(Args, Debug)]
struct ExtractArgs {
    /// PDF, JPEG or PNG file.
    file: PathBuf,

    #[command(flatten)]
    model: ModelArgs,

    /// Document type key from the prompt catalog.
    #[arg(long)]
    doc_type: Option<String>,

    /// Prompt text used instead of the catalog.
    #[arg(long)]
    prompt: Option<String>,

    /// Send every page instead of the capped prefix.
    #[arg(long)]
    full: bool,

    /// Hide the spinner.
    #[arg(long, env = "DOCINTAKE_NO_PROGRESS")]
    no_progress: bool,
}

#[derive(Args, Debug)]
struct CreateUserArgs {
    #[arg(long)]
    username: String,

    #[arg(long, default_value = "")]
    email: String,

    /// default, power or admin.
    #[arg(long, default_value = "default")]
    tier: String,

    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://docintake.db")]
    database_url: String,

    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: String,

    #[arg(long, default_value_t = 24 * 30)]
    token_ttl_hours: i64,
}

// ── Commands ─────────────────────────────────────────────────────────────────

async fn serve(args: ServeArgs) -> Result<()> {
    let pool = store::connect(&args.database_url, args.db_connections)
        .await
        .with_context(|| format!("opening {}", args.database_url))?;

    let ids = IdCipher::from_base64(&args.document_id_key).context("DOCUMENT_ID_KEY")?;
    if args.jwt_secret.len() < 16 {
        bail!("JWT_SECRET must be at least 16 bytes");
    }

    let backend = args.model.backend()?;
    let pipeline = DocumentPipeline::new(
        args.model.config()?,
        Arc::new(args.model.catalog()?),
        Arc::new(backend),
        pool.clone(),
        FileStore::new(args.media_root.clone()),
    );
    let model = pipeline.model_id().to_string();

    let state = AppState::new(
        pipeline,
        pool,
        ids,
        TokenVerifier::new(args.jwt_secret.as_bytes()),
    )
    .with_max_upload_bytes(args.max_upload_mb.saturating_mul(1024 * 1024));

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("binding {}", args.bind))?;
    info!(addr = %args.bind, %model, media_root = %args.media_root.display(), "Listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

async fn extract(args: ExtractArgs, show_progress: bool) -> Result<()> {
    let file_name = args
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let bytes = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let artifact = InputArtifact::from_upload(&file_name, bytes)?;

    let config = args.model.config()?;
    let max_pages = (!args.full).then_some(config.max_pages_limited);
    let prompt = args
        .model
        .catalog_or_builtin()?
        .resolve(args.doc_type.as_deref(), args.prompt.as_deref())?;
    let extractor = Extractor::new(Arc::new(args.model.backend()?), config);

    let started = Instant::now();
    let spinner = (show_progress && !args.no_progress).then(SpinnerProgress::new);
    let result = match &spinner {
        Some(sink) => extractor.extract(&artifact, &prompt, max_pages, sink).await,
        None => {
            extractor
                .extract(&artifact, &prompt, max_pages, &docintake::NoopProgress)
                .await
        }
    };
    if let Some(sink) = &spinner {
        sink.finish();
    }
    let extraction = result?;

    println!("{}", serde_json::to_string_pretty(&extraction.json)?);
    eprintln!(
        "{} {} page(s), {} in / {} out tokens, {} attempt(s), {}",
        green("✓"),
        extraction.pages_processed,
        extraction.input_tokens,
        extraction.output_tokens,
        extraction.attempts,
        dim(&format!("{:.1}s", started.elapsed().as_secs_f64())),
    );
    Ok(())
}

async fn create_user(args: CreateUserArgs) -> Result<()> {
    let tier: UserTier = args.tier.parse().map_err(anyhow::Error::msg)?;
    let pool = store::connect(&args.database_url, 1)
        .await
        .with_context(|| format!("opening {}", args.database_url))?;

    let user = UserRepository::new(pool)
        .create(&NewUser {
            username: args.username.clone(),
            email: args.email,
            tier,
            max_documents_allowed: if tier.is_privileged() {
                UNLIMITED_MAX_DOCUMENTS
            } else {
                DEFAULT_MAX_DOCUMENTS
            },
        })
        .await
        .with_context(|| format!("creating user '{}'", args.username))?;

    let token = issue_token(
        args.jwt_secret.as_bytes(),
        user.id,
        chrono::Duration::hours(args.token_ttl_hours.max(1)),
    )?;

    eprintln!(
        "{} created {} (id {}, {})",
        green("✓"),
        bold(&user.username),
        user.id,
        user.tier
    );
    println!("{token}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The extract spinner carries the feedback, so library INFO logs are
    // suppressed there unless --verbose.
    let spinner_active = matches!(&cli.command, Command::Extract(a) if !a.no_progress) && !cli.quiet;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || spinner_active {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Extract(args) => extract(args, !cli.quiet).await,
        Command::CreateUser(args) => create_user(args).await,
    }
}
