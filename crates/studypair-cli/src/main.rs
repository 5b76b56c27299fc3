use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use studypair_core::{
    apply_selection, build_candidate_pairs_query, create_run_dir, load_config, render_summary,
    run_extraction, summarize_audit, BigQueryClient, Config, ExtractionPrompts, LlmClient,
    OpenAiClient, OutputFormat, Table, Warehouse,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "studypair",
    author,
    version,
    about = "PET/CT study-pair curation pipeline"
)]
struct Cli {
    /// Path to the YAML pipeline configuration
    #[arg(
        long = "config",
        value_name = "FILE",
        default_value = "configs/selection.yaml",
        global = true
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Query the warehouse for candidate CT/PET study pairs
    Query {
        /// Limit the number of candidate pairs
        #[arg(long)]
        limit: Option<usize>,
        /// Run folder name (default: timestamped)
        #[arg(long = "run-name")]
        run_name: Option<String>,
    },
    /// Run LLM extraction over an existing candidate pairs CSV
    Extract {
        /// Path to candidate_pairs.csv
        #[arg(long)]
        input: PathBuf,
        /// Cap the number of rows sent for extraction
        #[arg(long = "max-rows")]
        max_rows: Option<usize>,
        #[arg(long = "run-name")]
        run_name: Option<String>,
    },
    /// Apply the selection rules to an extracted pairs CSV
    Select {
        /// Path to extracted_pairs.csv
        #[arg(long)]
        input: PathBuf,
        /// Emit the run summary as JSON instead of human-readable text
        #[arg(long)]
        json: bool,
        #[arg(long = "run-name")]
        run_name: Option<String>,
    },
    /// Run the full pipeline: query, extract, select
    Run {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long = "max-rows")]
        max_rows: Option<usize>,
        #[arg(long = "run-name")]
        run_name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config, Some(Path::new(".")))?;

    match cli.command {
        Commands::Query { limit, run_name } => {
            let run_dir = prepare_run(&cfg, run_name.as_deref())?;
            query_candidates(&cfg, &run_dir, limit).await?;
        }
        Commands::Extract {
            input,
            max_rows,
            run_name,
        } => {
            let run_dir = prepare_run(&cfg, run_name.as_deref())?;
            let table = Table::read_csv(&input)?;
            extract_pairs(&cfg, &run_dir, &table, max_rows).await?;
        }
        Commands::Select {
            input,
            json,
            run_name,
        } => {
            let run_dir = prepare_run(&cfg, run_name.as_deref())?;
            let table = Table::read_csv(&input)?;
            let format = if json {
                OutputFormat::Json
            } else {
                OutputFormat::Human
            };
            select_pairs(&run_dir, &table, format)?;
        }
        Commands::Run {
            limit,
            max_rows,
            run_name,
        } => {
            let run_dir = prepare_run(&cfg, run_name.as_deref())?;
            let candidates = query_candidates(&cfg, &run_dir, limit).await?;
            let extracted = extract_pairs(&cfg, &run_dir, &candidates, max_rows).await?;
            select_pairs(&run_dir, &extracted, OutputFormat::Human)?;
        }
    }
    Ok(())
}

fn prepare_run(cfg: &Config, run_name: Option<&str>) -> Result<PathBuf> {
    let run_dir = create_run_dir(cfg, run_name)?;
    let logs_dir = cfg
        .paths
        .logs_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("outputs/logs"));
    init_tracing(&logs_dir)?;
    info!(run_dir = %run_dir.display(), "run directory ready");
    Ok(run_dir)
}

fn init_tracing(logs_dir: &Path) -> Result<()> {
    fs::create_dir_all(logs_dir)
        .with_context(|| format!("failed to create log directory {}", logs_dir.display()))?;
    let log_path = logs_dir.join("pipeline.log");
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("failed to open log file {}", log_path.display()))?;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .try_init();
    Ok(())
}

async fn query_candidates(cfg: &Config, run_dir: &Path, limit: Option<usize>) -> Result<Table> {
    let sql = build_candidate_pairs_query(cfg, limit.or(cfg.selection.sample_limit))?;
    info!("running warehouse candidate query");
    let client = BigQueryClient::new(&cfg.bigquery)?;
    let table = client.query(&sql).await?;
    let out_path = run_dir.join("candidate_pairs.csv");
    table.write_csv(&out_path)?;
    info!(rows = table.len(), path = %out_path.display(), "wrote candidate pairs");
    Ok(table)
}

async fn extract_pairs(
    cfg: &Config,
    run_dir: &Path,
    table: &Table,
    max_rows: Option<usize>,
) -> Result<Table> {
    let prompts_dir = cfg
        .paths
        .prompts_dir
        .clone()
        .context("paths.prompts_dir must be set for extraction")?;
    let prompts = ExtractionPrompts {
        ct: read_prompt(&prompts_dir.join("ct_extraction_prompt.txt"))?,
        pet: read_prompt(&prompts_dir.join("pet_extraction_prompt.txt"))?,
    };
    let client: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(&cfg.llm)?);

    info!(rows = table.len(), "running LLM extraction");
    let extracted = run_extraction(
        table,
        client,
        &prompts,
        &cfg.llm,
        &run_dir.join("extractions"),
        max_rows,
    )
    .await?;

    let out_path = run_dir.join("extracted_pairs.csv");
    extracted.write_csv(&out_path)?;
    info!(path = %out_path.display(), "wrote extracted pairs");
    Ok(extracted)
}

fn read_prompt(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("failed to read prompt file at {}", path.display()))
}

fn select_pairs(run_dir: &Path, table: &Table, format: OutputFormat) -> Result<()> {
    let (selected, audit) = apply_selection(table)?;

    let selected_path = run_dir.join("selected_PET_CT_studies.csv");
    let audit_path = run_dir.join("selection_audit_log.csv");
    selected.write_csv(&selected_path)?;
    audit.write_csv(&audit_path)?;

    let summary = summarize_audit(&audit);
    println!("{}", render_summary(&summary, format)?.trim_end());
    info!(selected = selected.len(), total = table.len(), "selection complete");
    info!(path = %audit_path.display(), "wrote selection audit");
    Ok(())
}
