use std::collections::BTreeSet;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_sdm_pipeline::app::{MatchResult, Pipeline, TaxonomyOptions};
use kira_sdm_pipeline::config::{ConfigLoader, ResolvedConfig};
use kira_sdm_pipeline::domain::{DownloadMode, YearMonth};
use kira_sdm_pipeline::environment::GridFileReader;
use kira_sdm_pipeline::error::KiraError;
use kira_sdm_pipeline::gbif::{GbifCredentials, GbifHttpClient};
use kira_sdm_pipeline::occurrence::{DownloadReport, RequestIdentity};
use kira_sdm_pipeline::output::JsonOutput;
use kira_sdm_pipeline::worms::WormsHttpClient;

type HttpPipeline = Pipeline<WormsHttpClient, GbifHttpClient, GbifHttpClient, GridFileReader>;

#[derive(Parser)]
#[command(name = "kira-sdm")]
#[command(about = "Marine species distribution data pipeline: taxonomy, backbone matching, occurrence downloads, environmental join")]
#[command(version, author)]
struct Cli {
    /// Path to the pipeline config (defaults to ./kira-sdm.json).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Fetch taxonomy pages and write the species shortlist")]
    Taxonomy(TaxonomyArgs),
    #[command(about = "Match shortlisted names against the backbone")]
    Match,
    #[command(about = "Run occurrence download jobs for matched taxon keys")]
    Download(DownloadArgs),
    #[command(about = "Fetch archives for finished jobs kept as handles")]
    Materialize,
    #[command(about = "Join occurrences with month-aligned environmental covariates")]
    Join(JoinArgs),
    #[command(about = "Run every stage in order")]
    Run,
}

#[derive(Args)]
struct TaxonomyArgs {
    /// Continue from the last page on disk.
    #[arg(long)]
    resume: bool,
}

#[derive(Args)]
struct DownloadArgs {
    /// Rerun only these batch indices of the existing plan.
    #[arg(long = "batch")]
    batches: Vec<usize>,

    /// Override `occurrence.mode` from the config.
    #[arg(long, value_enum)]
    mode: Option<DownloadMode>,
}

#[derive(Args)]
struct JoinArgs {
    /// Rejoin only these months (YYYYMM).
    #[arg(long = "month")]
    months: Vec<YearMonth>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::MissingConfig
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_)
        | KiraError::ConfigInvalid(_)
        | KiraError::MissingCredentials(_)
        | KiraError::InvalidYearMonth(_)
        | KiraError::InvalidSearchArea(_)
        | KiraError::InvalidDate(_) => 2,
        KiraError::WormsHttp(_)
        | KiraError::WormsStatus { .. }
        | KiraError::PageFetch { .. }
        | KiraError::GbifHttp(_)
        | KiraError::GbifStatus { .. } => 3,
        KiraError::IncompleteMatch { .. }
        | KiraError::IncompleteDownload { .. }
        | KiraError::IncompleteJoin { .. } => 4,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Taxonomy(args) => {
            let pipeline = build_pipeline(config, None)?;
            let options = TaxonomyOptions { resume: args.resume };
            let result = pipeline.curate_taxonomy(&options, &JsonOutput)?;
            JsonOutput::print_taxonomy(&result).into_diagnostic()?;
        }
        Commands::Match => {
            let pipeline = build_pipeline(config, None)?;
            let result = pipeline.match_backbone(&JsonOutput)?;
            JsonOutput::print_match(&result).into_diagnostic()?;
            ensure_match_complete(&result)?;
        }
        Commands::Download(args) => {
            if let Some(mode) = args.mode {
                config.occurrence.mode = mode;
            }
            let pipeline = build_pipeline(config, Some(GbifCredentials::from_env()?))?;
            let only = (!args.batches.is_empty())
                .then(|| args.batches.iter().copied().collect::<BTreeSet<_>>());
            let result = pipeline.download(only.as_ref(), &JsonOutput)?;
            JsonOutput::print_download(&result).into_diagnostic()?;
            ensure_downloads_complete(&result.report)?;
        }
        Commands::Materialize => {
            let pipeline = build_pipeline(config, Some(GbifCredentials::from_env()?))?;
            let result = pipeline.materialize(&JsonOutput)?;
            JsonOutput::print_download(&result).into_diagnostic()?;
            ensure_downloads_complete(&result.report)?;
        }
        Commands::Join(args) => {
            let pipeline = build_pipeline(config, None)?;
            let only = (!args.months.is_empty())
                .then(|| args.months.iter().copied().collect::<BTreeSet<_>>());
            let result = pipeline.join(only.as_ref(), &JsonOutput)?;
            JsonOutput::print_join(&result).into_diagnostic()?;
            if !result.report.is_complete() {
                return Err(KiraError::IncompleteJoin {
                    failed: result.report.failures.len(),
                }
                .into());
            }
        }
        Commands::Run => {
            let pipeline = build_pipeline(config, Some(GbifCredentials::from_env()?))?;
            let result = pipeline.run(&JsonOutput)?;
            JsonOutput::print_run(&result).into_diagnostic()?;
            ensure_match_complete(&result.matching)?;
            if let Some(download) = &result.download {
                ensure_downloads_complete(&download.report)?;
            }
            if let Some(join) = result.join.as_ref().filter(|join| !join.report.is_complete()) {
                return Err(KiraError::IncompleteJoin {
                    failed: join.report.failures.len(),
                }
                .into());
            }
        }
    }
    Ok(())
}

fn build_pipeline(
    config: ResolvedConfig,
    credentials: Option<GbifCredentials>,
) -> Result<HttpPipeline, KiraError> {
    let worms = WormsHttpClient::new(&config.taxonomy)?;
    let identity = credentials.as_ref().map(|credentials| RequestIdentity {
        creator: credentials.user.clone(),
        email: credentials.email.clone(),
    });
    let names = GbifHttpClient::new(None)?;
    let downloads = GbifHttpClient::new(credentials)?;
    let pipeline = Pipeline::new(config, worms, names, downloads, GridFileReader);
    Ok(match identity {
        Some(identity) => pipeline.with_identity(identity),
        None => pipeline,
    })
}

fn ensure_match_complete(result: &MatchResult) -> Result<(), KiraError> {
    if result.is_complete() {
        return Ok(());
    }
    Err(KiraError::IncompleteMatch {
        failed: result.chunk_failures.len(),
        total: result.chunks,
    })
}

fn ensure_downloads_complete(report: &DownloadReport) -> Result<(), KiraError> {
    if report.is_complete() {
        return Ok(());
    }
    Err(KiraError::IncompleteDownload {
        failed: report.failures.len(),
        total: report.jobs.len(),
    })
}
