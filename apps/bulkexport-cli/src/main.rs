//! bulkexport
//!
//! Runs one time-bounded invocation of an export job per call. The job file
//! carries the cursor between calls; each invocation writes the ids it
//! exported to its own numbered file under the output directory.
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use bulkexport_core::config::{resolve_with_base, Config, ExportSettings};
use bulkexport_core::job::{ExportInput, ExportJob, ExportOutput, Outcome, Reentrant};
use bulkexport_core::traits::IndexClient;
use bulkexport_core::CursorCodec;
use bulkexport_es::{EsClientConfig, EsIndexClient};
use bulkexport_memory::MemoryIndex;
use bulkexport_stream::{run_invocation, Deadline};

mod sink;

use sink::IdFileSink;

#[derive(Parser, Debug)]
#[command(name = "bulkexport")]
#[command(about = "Reentrant bulk export of index search hits")]
struct Cli {
    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a job file for a new export
    Init {
        #[arg(long, value_name = "FILE")]
        job: PathBuf,
        #[arg(long)]
        index: String,
        /// Query object; a top-level search request is accepted too
        #[arg(long, default_value = r#"{"match_all":{}}"#)]
        query: String,
        #[arg(long)]
        page_size: Option<usize>,
        /// Replace an existing job file
        #[arg(long)]
        force: bool,
    },
    /// Run one invocation of a job and record where it got to
    Run {
        #[arg(long, value_name = "FILE")]
        job: PathBuf,
        /// Export from a JSON-lines file instead of the configured index
        #[arg(long, value_name = "JSONL")]
        docs: Option<PathBuf>,
        /// Override the invocation budget from `[export]`
        #[arg(long)]
        budget_ms: Option<u64>,
    },
    /// Validate a cursor and print its canonical form
    Cursor { json: String },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    // stdout is reserved for the invocation result
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_job(path: &Path) -> anyhow::Result<ExportJob> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading job {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("parsing job {}", path.display()))
}

/// Replace the job file atomically so an interrupted write never loses the cursor.
fn save_job(path: &Path, job: &ExportJob) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("staging job in {}", dir.display()))?;
    serde_json::to_writer_pretty(&mut tmp, job)?;
    tmp.write_all(b"\n")?;
    tmp.persist(path)
        .with_context(|| format!("saving job {}", path.display()))?;
    Ok(())
}

fn init_job(
    settings: &ExportSettings,
    path: &Path,
    index: String,
    query: &str,
    page_size: Option<usize>,
    force: bool,
) -> anyhow::Result<ExportJob> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to replace it)", path.display());
    }
    let query = serde_json::from_str(query).context("parsing --query")?;
    let input = ExportInput {
        page_size: page_size.unwrap_or(settings.page_size),
        finalization_window_ms: settings.finalization_window_ms,
        ..ExportInput::new(index, query)
    };
    let mut job = ExportJob::new(input);
    job.output_dir = Some(settings.output_dir.clone());
    save_job(path, &job)?;
    Ok(job)
}

fn index_client(
    config: &Config,
    index_name: &str,
    docs: Option<&Path>,
) -> anyhow::Result<Arc<dyn IndexClient>> {
    if let Some(path) = docs {
        let index = MemoryIndex::from_jsonl(index_name, path)?;
        info!(documents = index.len(), path = %path.display(), "exporting from local documents");
        return Ok(Arc::new(index));
    }
    let es: EsClientConfig = config
        .get("index")
        .context("no [index] configured (or pass --docs)")?;
    Ok(Arc::new(EsIndexClient::new(&es)?))
}

/// One invocation. `None` when the job had already finished.
async fn run_job(
    config: &Config,
    job_path: &Path,
    docs: Option<&Path>,
    budget_ms: Option<u64>,
) -> anyhow::Result<Option<ExportOutput>> {
    let settings = config.export_settings()?;
    let mut job = load_job(job_path)?;
    if job.is_done() {
        info!(iteration = job.iteration(), "job is already done");
        return Ok(None);
    }

    let client = index_client(config, &job.input.index_name, docs)?;
    let budget = budget_ms.map_or_else(|| settings.budget(), Duration::from_millis);
    let oracle = Arc::new(Deadline::after(budget));

    let base = job_path.parent().unwrap_or_else(|| Path::new(""));
    let output_dir = job.output_dir.as_deref().unwrap_or(&settings.output_dir);
    let output_path = resolve_with_base(base, output_dir)
        .join(job.output_file_name());
    let cursor = job
        .continuation()
        .map_or_else(|| "start".to_string(), ToString::to_string);
    info!(
        iteration = job.iteration(),
        cursor = %cursor,
        output = %output_path.display(),
        "starting invocation"
    );

    let mut sink = IdFileSink::create(&output_path).await?;
    let output = run_invocation(client, &job.input, oracle, &mut sink).await?;
    sink.finish().await?;

    job.record(&output);
    save_job(job_path, &job)?;
    Ok(Some(output))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Init {
            job,
            index,
            query,
            page_size,
            force,
        } => {
            let config = Config::load()?;
            let settings = config.export_settings()?;
            let created = init_job(&settings, &job, index, &query, page_size, force)?;
            println!("{}", serde_json::to_string_pretty(&created)?);
        }
        Command::Run {
            job,
            docs,
            budget_ms,
        } => {
            let config = Config::load().map_err(|e| {
                eprintln!("Error loading config: {}", e);
                e
            })?;
            let Some(output) = run_job(&config, &job, docs.as_deref(), budget_ms).await? else {
                return Ok(());
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            if output.outcome == Outcome::Failed {
                std::process::exit(1);
            }
        }
        Command::Cursor { json } => {
            let cursor = CursorCodec::decode(&json)?;
            println!("{}", CursorCodec::encode(&cursor));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_reload_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("job.json");
        let settings = ExportSettings {
            page_size: 250,
            ..ExportSettings::default()
        };

        let query = r#"{"query":{"match_all":{}}}"#;
        let job = init_job(&settings, &path, "works".into(), query, None, false)
            .unwrap();
        assert_eq!(job.input.page_size, 250);
        assert_eq!(job.output_dir.as_deref(), Some("./out"));
        assert_eq!(load_job(&path).unwrap(), job);

        let again = init_job(&settings, &path, "works".into(), "{}", None, false);
        assert!(again.is_err());
        let replaced = init_job(&settings, &path, "other".into(), "{}", Some(10), true);
        let replaced = replaced.unwrap();
        assert_eq!(load_job(&path).unwrap().input.index_name, "other");
        assert_eq!(replaced.input.page_size, 10);
    }

    #[test]
    fn job_with_an_empty_cursor_is_not_loaded() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("job.json");
        let text = r#"{"index_name": "works", "iteration": 2, "cursor": []}"#;
        fs::write(&path, text).unwrap();
        let err = format!("{:#}", load_job(&path).unwrap_err());
        assert!(err.contains("at least one sort value"), "{err}");
    }

    #[tokio::test]
    async fn runs_a_job_from_local_documents_until_done() {
        let tmp = tempfile::tempdir().unwrap();
        let docs = tmp.path().join("docs.jsonl");
        let lines: String = (0..7)
            .map(|i| format!("{{\"id\": \"d{i}\"}}\n"))
            .collect();
        fs::write(&docs, lines).unwrap();

        let config = Config::load_from(tmp.path(), "test").unwrap();
        let job_path = tmp.path().join("job.json");
        let mut input = ExportInput::new("works", serde_json::json!({}));
        input.page_size = 3;
        input.max_batches = Some(2);
        let mut job = ExportJob::new(input);
        job.output_dir = Some("parts".into());
        save_job(&job_path, &job).unwrap();

        let run = || run_job(&config, &job_path, Some(&docs), None);
        let first = run().await.unwrap().expect("ran");
        assert_eq!(first.outcome, Outcome::More);
        let second = run().await.unwrap().expect("ran");
        assert_eq!(second.outcome, Outcome::Done);
        assert!(run().await.unwrap().is_none());

        let saved = load_job(&job_path).unwrap();
        assert_eq!(saved.iteration(), 2);
        let parts = tmp.path().join("parts");
        let part0 = fs::read_to_string(parts.join("works-00000.txt")).unwrap();
        let part1 = fs::read_to_string(parts.join("works-00001.txt")).unwrap();
        assert_eq!(part0, "d0\nd1\nd2\nd3\nd4\nd5\n");
        assert_eq!(part1, "d6\n");
    }
}
