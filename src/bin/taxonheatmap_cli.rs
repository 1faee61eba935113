use clap::{Args, Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use taxonheatmap_rs::config::HeatmapConfig;
use taxonheatmap_rs::error::Result;
use taxonheatmap_rs::files::{read_text, write_text};
use taxonheatmap_rs::heatmap::HeatmapService;
use taxonheatmap_rs::pathogens::{CachedPathogenList, PathogenListProvider, StaticPathogenList};
use taxonheatmap_rs::{generate_heatmap, generate_taxa_details, HeatmapRequest, HeatmapResults};

#[derive(Parser)]
#[command(name = "taxonheatmap-rs", about = "Sample × taxon heatmaps from a scored taxon index")]
struct Cli {
    /// TOML configuration; HEATMAP_* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Top taxa per sample
    Heatmap(RenderArgs),
    /// Metrics for the request's explicit taxonIds
    Taxa(RenderArgs),
    /// Drop runs from the index
    Evict {
        /// Pipeline run ids
        #[arg(required = true, value_delimiter = ',')]
        runs: Vec<u64>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
    Compact,
}

#[derive(Args)]
struct RenderArgs {
    /// Request JSON (`samples` + `params`), optionally gzipped
    request: PathBuf,

    /// Known-pathogen taxon ids, one per line
    #[arg(long)]
    pathogens: Option<PathBuf>,

    /// Output file; `.gz` is compressed
    #[arg(long, short, default_value = "heatmap.json")]
    output: PathBuf,

    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
}

fn spinner(color: &str, message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
        .template(&format!("{{spinner:.{color}}} {{msg}}"))
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.set_message(message.to_string());
    spinner
}

fn load_pathogens(path: Option<&PathBuf>) -> Result<Arc<dyn PathogenListProvider>> {
    let list = match path {
        Some(p) => StaticPathogenList::from_lines(&read_text(p)?),
        None => StaticPathogenList::default(),
    };
    Ok(Arc::new(CachedPathogenList::new(Arc::new(list))))
}

fn render(config: HeatmapConfig, args: &RenderArgs, taxa_only: bool) -> Result<()> {
    let spinner_read = spinner("blue", "Reading request...");
    let request: HeatmapRequest = serde_json::from_str(&read_text(&args.request)?)?;
    let pathogens = load_pathogens(args.pathogens.as_ref())?;
    spinner_read.finish_with_message(format!("{} sample(s) requested.", request.samples.len()));

    let service = HeatmapService::from_config(config, pathogens)?;

    let spinner_query = spinner("green", "Querying the taxon index...");
    let results: HeatmapResults = if taxa_only {
        generate_taxa_details(&service, &request)?
    } else {
        generate_heatmap(&service, &request)?
    };
    let taxa: usize = results.samples.iter().map(|s| s.taxons.len()).sum();
    spinner_query.finish_with_message(format!("Collected {taxa} taxon row(s)."));

    let spinner_write = spinner("yellow", "Writing output...");
    let text = match args.format {
        OutputFormat::Json => results.get_json()?,
        OutputFormat::Csv => results.get_csv()?,
        OutputFormat::Compact => serde_json::to_string_pretty(&results.get_compact())?,
    };
    write_text(&args.output, &text)?;
    spinner_write.finish_with_message(format!("Wrote {}.", args.output.display()));
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let config = HeatmapConfig::load(cli.config.as_deref())?;
    log::debug!("Using search store at {}", config.es_address);

    match &cli.command {
        Command::Heatmap(args) => render(config, args, false),
        Command::Taxa(args) => render(config, args, true),
        Command::Evict { runs } => {
            let service = HeatmapService::from_config(config, Arc::new(StaticPathogenList::default()))?;
            let spinner_evict = spinner("cyan", "Evicting runs...");
            service.evict(runs)?;
            spinner_evict.finish_with_message(format!("Evicted {} run(s).", runs.len()));
            Ok(())
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        log::error!("{e}");
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
