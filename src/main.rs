//! Sazinka Import - partner job import CLI
//!
//! Reconciles a partner export against the job store snapshot, validates a
//! mapping profile against a source, or auto-matches engineer identifiers.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use sazinka_import::cli::{Cli, Command, SourceArgs};
use sazinka_import::config::{parse_delimiter, Config};
use sazinka_import::services::cancellation::CANCELLATION;
use sazinka_import::services::engineer_gate::auto_match_engineers;
use sazinka_import::services::export::{export_issues, export_result_json};
use sazinka_import::services::job_store::InMemoryJobStore;
use sazinka_import::services::orchestrator::{ChunkOrchestrator, ImportRequest, OrchestratorSettings};
use sazinka_import::services::profile_store::JsonFileProfileStore;
use sazinka_import::services::progress::LogProgressSink;
use sazinka_import::services::reconcile::RunOptions;
use sazinka_import::services::row_source::{FileRowSource, SourceDescriptor};
use sazinka_import::types::{ImportRunResult, MappingProfile};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration (also picks up LOGS_DIR from .env)
    let config = Config::from_env()?;

    config.ensure_logs_dir()?;

    // File appender for persistent logs (daily rotation)
    let file_appender = RollingFileAppender::new(Rotation::DAILY, &config.logs_dir, "import.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Initialize logging - both stdout and file
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,sazinka_import=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer()) // stdout
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)) // file
        .init();

    info!("Configuration loaded: {:?}", config);

    match cli.command {
        Command::Run {
            source,
            apply,
            no_create,
            verbose,
            start_row,
            max_rows,
            chunk_size,
            parallel,
            issues_csv,
            result_json,
        } => {
            let mut config = config;
            if let Some(size) = chunk_size {
                config.chunk_size = size.max(1);
            }
            if let Some(chunks) = parallel {
                config.parallel_chunks = chunks;
            }

            let options = RunOptions {
                dry_run: !apply,
                create_missing: !no_create,
                verbose,
            };
            let result = run(&config, &source, options, start_row, max_rows).await?;

            if let Some(path) = issues_csv {
                let written = export_issues(&result.summary, &path)?;
                info!("Wrote {} issues to {}", written, path.display());
            }
            if let Some(path) = result_json {
                export_result_json(&result, &path)?;
                info!("Wrote run result to {}", path.display());
            }

            print_result(&result, config.error_display_limit);
            if !result.success {
                anyhow::bail!("import finished with problems, see the report above");
            }
        }
        Command::Validate { source } => validate(&config, &source).await?,
        Command::AutoMatch { source, dry_run } => auto_match(&config, &source, dry_run).await?,
    }

    Ok(())
}

fn descriptor(args: &SourceArgs, config: &Config) -> Result<SourceDescriptor> {
    let delimiter = match &args.delimiter {
        Some(raw) => parse_delimiter(raw)?,
        None => config.csv_delimiter,
    };
    Ok(SourceDescriptor::from_path(&args.source, args.sheet.clone(), delimiter))
}

async fn load_profile(args: &SourceArgs) -> Result<MappingProfile> {
    let profile = JsonFileProfileStore::read_file(&args.profile).await?;
    info!("Loaded mapping profile for partner {}", profile.partner_id);
    Ok(profile)
}

async fn run(
    config: &Config,
    args: &SourceArgs,
    options: RunOptions,
    start_row: usize,
    max_rows: Option<usize>,
) -> Result<ImportRunResult> {
    let profile = load_profile(args).await?;
    let store = Arc::new(InMemoryJobStore::load(&args.store)?);
    let orchestrator = ChunkOrchestrator::new(
        Arc::new(FileRowSource::new()),
        store.clone(),
        OrchestratorSettings::from(config),
    )
    .with_registry(CANCELLATION.clone());

    let owner_id = Uuid::new_v4();
    let mut request = ImportRequest::new(descriptor(args, config)?, profile, options).owned_by(owner_id);
    request.start_row = start_row;
    if let Some(max_rows) = max_rows {
        request = request.window(start_row, max_rows);
    }

    // Ctrl-C cancels at the next chunk boundary
    let run_id = request.run_id;
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run {} after the current chunk", run_id);
            if let Ok(false) = CANCELLATION.cancel(&run_id, owner_id) {
                CANCELLATION.pre_cancel(run_id, owner_id);
            }
        }
    });

    let result = if max_rows.is_some() {
        orchestrator.run_import(&request).await
    } else {
        orchestrator.run(&request, &LogProgressSink).await
    };
    ctrl_c.abort();
    let result = result?;

    if !options.dry_run {
        store.save(&args.store)?;
        info!("Saved job store snapshot to {}", args.store.display());
    }

    Ok(result)
}

async fn validate(config: &Config, args: &SourceArgs) -> Result<()> {
    let profile = load_profile(args).await?;
    profile.validate_for_save()?;

    let store = Arc::new(InMemoryJobStore::load(&args.store)?);
    let orchestrator = ChunkOrchestrator::new(
        Arc::new(FileRowSource::new()),
        store,
        OrchestratorSettings::from(config),
    );
    let request = ImportRequest::new(descriptor(args, config)?, profile, RunOptions::default());
    let report = orchestrator.check(&request).await?;

    println!("Source: {} ({} data rows)", request.descriptor.location(), report.total_rows);
    for column in &report.missing_columns {
        println!("  missing column: {}", column);
    }
    if report.unmapped_engineers.is_empty() {
        println!("All engineer identifiers are mapped");
        Ok(())
    } else {
        println!("Unmapped engineers ({}):", report.unmapped_engineers.len());
        for identifier in &report.unmapped_engineers {
            println!("  {}", identifier);
        }
        anyhow::bail!("profile is not ready: engineer mappings are incomplete")
    }
}

async fn auto_match(config: &Config, args: &SourceArgs, dry_run: bool) -> Result<()> {
    let mut profile = load_profile(args).await?;
    let store = InMemoryJobStore::load(&args.store)?;
    let source = FileRowSource::new();

    let report = auto_match_engineers(
        &source,
        &descriptor(args, config)?,
        &mut profile,
        &store,
        config.gate_page_size,
    )
    .await?;

    println!(
        "Matched {} identifiers against {} engineers",
        report.matched, report.engineers_available
    );
    for identifier in &report.still_unmapped {
        println!("  still unmapped: {}", identifier);
    }

    if report.matched > 0 && !dry_run {
        JsonFileProfileStore::write_file(&args.profile, &profile).await?;
        info!("Updated mapping profile {}", args.profile.display());
    }
    Ok(())
}

fn print_result(result: &ImportRunResult, display_limit: usize) {
    let s = &result.summary;
    println!(
        "{} run {} in {} ms: processed {} of {} rows",
        if s.dry_run { "Dry" } else { "Live" },
        result.run_id,
        result.duration_ms(),
        s.processed,
        result.total_rows
    );
    println!(
        "  inserted {}, updated {}, skipped {}, duplicates {}, errors {}, warnings {}",
        s.inserted,
        s.updated,
        s.skipped,
        s.duplicates,
        s.errors.len(),
        s.warnings.len()
    );

    if result.is_blocked() {
        println!("  blocked by unmapped engineers: {}", s.unmapped_engineers.join(", "));
    }
    if result.cancelled {
        println!("  cancelled by operator");
    }
    if result.has_more {
        println!("  resume with --start-row {}", result.next_start_row);
    }

    let inline = s.inline(display_limit);
    for issue in &inline.errors {
        println!("  error row {}: {}", issue.row, issue.message);
    }
    for warning in &inline.warnings {
        println!("  warning row {}: {}", warning.row, warning.warning);
    }
    if inline.hidden_errors + inline.hidden_warnings > 0 {
        println!(
            "  ... {} more errors and {} more warnings (use --issues-csv for the full list)",
            inline.hidden_errors, inline.hidden_warnings
        );
    }
}
