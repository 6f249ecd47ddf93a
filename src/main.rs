use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fxagg::aggregate::{CursorList, Request, RequestKind};
use fxagg::aggregate::request::ValueFormat;
use fxagg::index::{self, MemoryIndex};
use fxagg::output::{self, ExecutionResult};
use fxagg::utils::{self, EngineConfig};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fxagg")]
#[command(about = "Run search and aggregation requests against a document set")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print replies as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an FT.SEARCH style request
    Search {
        /// Index definition with its documents
        #[arg(short, long)]
        index: PathBuf,

        /// Query text followed by request arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
    /// Run an FT.AGGREGATE style request
    Aggregate {
        /// Index definition with its documents
        #[arg(short, long)]
        index: PathBuf,

        /// Query text followed by pipeline arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        args: Vec<String>,
    },
    /// Show the schema of an index file
    Schema {
        /// Index definition with its documents
        #[arg(short, long)]
        index: PathBuf,
    },
    /// Write the default configuration file
    InitConfig,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let color = !cli.no_color;

    match cli.command {
        Commands::Search { index, args } => {
            run_request(RequestKind::Search, &index, &args, &config, cli.json, color)?;
        }
        Commands::Aggregate { index, args } => {
            run_request(RequestKind::Aggregate, &index, &args, &config, cli.json, color)?;
        }
        Commands::Schema { index } => {
            let idx = open_index(&index)?;
            let spec = idx.spec();
            println!("{} ({:?}, {} docs)", spec.name, spec.kind, idx.num_docs());
            for field in &spec.fields {
                let sortable = if field.sortable { " SORTABLE" } else { "" };
                println!("  {} {}{}", field.name, field.field_type.as_str(), sortable);
            }
        }
        Commands::InitConfig => {
            let path = match cli.config {
                Some(path) => path,
                None => utils::get_config_path()?,
            };
            config.save(&path)?;
            println!("Wrote {}", path.display());
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::load_default(),
    }
}

fn open_index(path: &Path) -> Result<MemoryIndex> {
    let idx = MemoryIndex::from_json_file(path)
        .with_context(|| format!("Failed to load index from {}", path.display()))?;
    info!(docs = idx.num_docs(), path = %path.display(), "index loaded");
    Ok(idx)
}

fn run_request(
    kind: RequestKind,
    index_path: &Path,
    args: &[String],
    config: &EngineConfig,
    json: bool,
    color: bool,
) -> Result<()> {
    let handle = index::shared(open_index(index_path)?);

    let mut req = Request::new(kind, config);
    req.set_structured_reply(json);
    req.compile(args).context("Invalid request")?;
    req.apply_context(handle).context("Failed to bind request")?;
    req.build_pipeline().context("Failed to build pipeline")?;
    let expand = req.value_format() == ValueFormat::Expand;

    // Cursor requests are drained chunk by chunk in-process
    let cursors = CursorList::new(config.cursor_max_count);
    let mut result = cursors.execute(req)?;
    loop {
        print_result(&result, json, expand, color)?;
        let Some(id) = result.cursor_id else {
            break;
        };
        debug!(cursor_id = id, "reading next chunk");
        result = cursors.read(id, None)?;
    }
    Ok(())
}

fn print_result(result: &ExecutionResult, json: bool, expand: bool, color: bool) -> Result<()> {
    if json {
        output::print_json(result, expand)?;
    } else {
        output::print_rows(result, color)?;
    }
    Ok(())
}
