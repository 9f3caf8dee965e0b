use std::process::ExitCode;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use ldm_snapshot::app::App;
use ldm_snapshot::config::ConfigLoader;
use ldm_snapshot::domain::SnapshotRequest;
use ldm_snapshot::download::{HttpTransport, RetryingDownloader};
use ldm_snapshot::error::LdmError;
use ldm_snapshot::fetcher::{BrowserFetcher, FetchReport, SnapshotFetcher};
use ldm_snapshot::output::{JsonOutput, LogSink};
use ldm_snapshot::profile::{LoadOptions, ProfileCollection, ProfileLoader, SqliteProfileLoader};
use ldm_snapshot::webdriver::WebDriverLauncher;

#[derive(Parser)]
#[command(name = "ldm-snapshot")]
#[command(about = "Download, patch and cache the NCSS Lab Data Mart snapshot")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch the snapshot (or reuse the cache) and load profile collections")]
    Fetch(FetchArgs),
    #[command(about = "Check snapshot files against the recorded checksums")]
    Verify(TargetArgs),
    #[command(about = "Remove cached profile collections")]
    Clear(TargetArgs),
}

#[derive(Args)]
struct TargetArgs {
    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    dir: Option<Utf8PathBuf>,
}

#[derive(Args)]
struct FetchArgs {
    #[command(flatten)]
    target: TargetArgs,

    #[arg(long)]
    no_cache: bool,

    #[arg(long)]
    verbose: bool,

    #[arg(long)]
    keep_archive: bool,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long, help = "Seconds to wait for the browser download")]
    timeout: Option<u64>,

    #[arg(long, help = "Download portal URL")]
    url: Option<String>,

    #[arg(long)]
    companion_url: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(ldm) = report.downcast_ref::<LdmError>() {
            return ExitCode::from(map_exit_code(ldm));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &LdmError) -> u8 {
    match error {
        LdmError::ConfigRead(_) | LdmError::ConfigParse(_) => 2,
        LdmError::MissingTool(_)
        | LdmError::DriverStartup { .. }
        | LdmError::WebDriver { .. }
        | LdmError::ElementNotFound(_)
        | LdmError::Http(_)
        | LdmError::HttpStatus { .. }
        | LdmError::Download { .. }
        | LdmError::Acquisition(_) => 3,
        LdmError::Load(_) => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Fetch(args) => {
            let request = fetch_request(&args)?;
            init_tracing(request.verbose);
            let transport = HttpTransport::new()?;
            let fetcher =
                BrowserFetcher::new(WebDriverLauncher, RetryingDownloader::new(transport));
            let app = App::new(fetcher, SqliteProfileLoader);
            let outcome = app.get_snapshot_full(&request, &LogSink)?;
            JsonOutput::print_fetch(&outcome.summary()).into_diagnostic()
        }
        Commands::Verify(args) => {
            let request = resolve_request(&args)?;
            init_tracing(request.verbose);
            let app = App::new(NopFetcher, NopLoader);
            let result = app.verify(&request)?;
            JsonOutput::print_verify(&result).into_diagnostic()?;
            if !result.mismatches.is_empty() {
                return Err(LdmError::Manifest(format!(
                    "{} file(s) differ from the manifest",
                    result.mismatches.len()
                ))
                .into());
            }
            Ok(())
        }
        Commands::Clear(args) => {
            let request = resolve_request(&args)?;
            init_tracing(request.verbose);
            let app = App::new(NopFetcher, NopLoader);
            let result = app.clear_cache(&request)?;
            JsonOutput::print_clear(&result).into_diagnostic()
        }
    }
}

/// Filter used when `RUST_LOG` is unset.
fn default_directive(verbose: bool) -> &'static str {
    if verbose { "info" } else { "warn" }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_request(args: &TargetArgs) -> Result<SnapshotRequest, LdmError> {
    let mut request = ConfigLoader::resolve(args.config.as_deref())?;
    if let Some(dir) = &args.dir {
        request.target_dir = dir.clone();
    }
    Ok(request)
}

/// Config file values with the fetch flags applied on top.
fn fetch_request(args: &FetchArgs) -> Result<SnapshotRequest, LdmError> {
    let mut request = resolve_request(&args.target)?;
    if args.no_cache {
        request.cache = false;
    }
    if args.verbose {
        request.verbose = true;
    }
    if args.keep_archive {
        request.keep_archive = true;
    }
    if let Some(port) = args.port {
        request.port = port;
    }
    if let Some(secs) = args.timeout {
        request.timeout = Duration::from_secs(secs);
    }
    if let Some(url) = &args.url {
        request.portal_url = url.clone();
    }
    if let Some(url) = &args.companion_url {
        request.companion_url = url.clone();
    }
    Ok(request)
}

struct NopFetcher;
struct NopLoader;

impl SnapshotFetcher for NopFetcher {
    fn fetch(&self, _request: &SnapshotRequest) -> Result<FetchReport, LdmError> {
        Err(LdmError::Acquisition("fetcher not configured".to_string()))
    }
}

impl ProfileLoader for NopLoader {
    fn load(
        &self,
        _database: &Utf8Path,
        _options: &LoadOptions,
    ) -> Result<ProfileCollection, LdmError> {
        Err(LdmError::Load("loader not configured".to_string()))
    }
}
