//! statprobe CLI: statement activation harvesting and truth probing

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use statprobe::{
    acts_dir, load_acts, CapturePoint, Dataset, ExtractConfig, Extractor, ProbeModel,
    ProbeTrainer, WeightSource,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "statprobe")]
#[command(about = "Statement activation harvesting and truth probing for causal LMs")]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run statements through a model and store captured activations
    Extract(ExtractArgs),
    /// Train a truth probe on stored activations
    Probe(ProbeArgs),
}

#[derive(Args)]
struct ExtractArgs {
    /// Model ID from HuggingFace (e.g., "meta-llama/Llama-2-7b-hf")
    #[arg(short, long, default_value = "meta-llama/Llama-2-7b-hf")]
    model: String,

    /// Names of datasets, without .csv extension
    #[arg(short, long, num_args = 1.., default_values_t = [String::from("truthfulqa")])]
    datasets: Vec<String>,

    /// Directory holding dataset CSVs
    #[arg(long, default_value = "datasets")]
    data_dir: PathBuf,

    /// Directory to save activations to
    #[arg(short, long, default_value = "activations")]
    output_dir: PathBuf,

    /// Statements taken from the head of each dataset
    #[arg(long, default_value_t = 300)]
    limit: usize,

    /// Capture the residual stream after this decoder layer instead of
    /// the lm-head output
    #[arg(long)]
    layer: Option<usize>,

    /// Tag used in activation file names (default: last segment of the model ID)
    #[arg(long)]
    tag: Option<String>,

    /// Quantized mode: GGUF file (a local path, or a file name inside --gguf-repo)
    #[arg(long)]
    gguf_file: Option<String>,

    /// Hub repo to fetch the GGUF file from (e.g., "TheBloke/Llama-2-7B-GGUF")
    #[arg(long, requires = "gguf_file")]
    gguf_repo: Option<String>,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,
}

#[derive(Args)]
struct ProbeArgs {
    /// Dataset name, without .csv extension
    #[arg(short, long)]
    dataset: String,

    /// Tag the activations were stored under
    #[arg(short, long, default_value = "Llama-2-7b-hf")]
    tag: String,

    /// Directory activations were saved to
    #[arg(short, long, default_value = "activations")]
    acts_dir: PathBuf,

    /// Directory holding dataset CSVs (for labels)
    #[arg(long, default_value = "datasets")]
    data_dir: PathBuf,

    /// Statement limit used at extraction time (selects the directory)
    #[arg(long, default_value_t = 300)]
    limit: usize,

    /// Skip mean-centering the activations
    #[arg(long)]
    no_center: bool,

    /// Divide each column by its standard deviation
    #[arg(long)]
    scale: bool,

    /// Train/test split ratio
    #[arg(long, default_value_t = 0.8)]
    train_ratio: f64,

    /// Random seed for the split
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Extract(args) => run_extract(args),
        Command::Probe(args) => run_probe(args),
    }
}

fn run_extract(args: ExtractArgs) -> Result<()> {
    let tag = args.tag.clone().unwrap_or_else(|| {
        args.model
            .rsplit('/')
            .next()
            .unwrap_or(&args.model)
            .to_string()
    });
    let capture = match args.layer {
        Some(i) => CapturePoint::Layer(i),
        None => CapturePoint::LmHead,
    };
    let weights = match (&args.gguf_file, &args.gguf_repo) {
        (Some(filename), Some(repo_id)) => WeightSource::GgufRepo {
            repo_id: repo_id.clone(),
            filename: filename.clone(),
        },
        (Some(path), None) => WeightSource::GgufFile(PathBuf::from(path)),
        (None, _) => WeightSource::Safetensors,
    };

    println!("=== statprobe extract ===");
    println!("Model:    {}", args.model);
    println!("Datasets: {}", args.datasets.join(", "));
    println!("Output:   {}", args.output_dir.display());
    if args.gguf_file.is_some() {
        println!("Mode:     quantized (GGUF)");
    }
    if args.cpu {
        println!("Device:   CPU (forced)");
    }

    info!("Loading model...");
    let model = ProbeModel::load(&args.model, weights, Some(args.cpu))?;
    info!(
        "Model: {} layers, {} hidden, {} vocab",
        model.n_layers(),
        model.d_model(),
        model.vocab_size()
    );

    let config = ExtractConfig {
        datasets: args.datasets,
        data_dir: args.data_dir,
        output_dir: args.output_dir,
        tag,
        limit: args.limit,
        capture,
    };

    let extractor = Extractor::new(model, config);
    let summary = extractor.run()?;

    println!("\n=== Extracted ===");
    for (dataset, rows) in &summary.per_dataset {
        println!("{dataset}: {rows} rows");
    }

    Ok(())
}

fn run_probe(args: ProbeArgs) -> Result<()> {
    println!("=== statprobe probe ===");
    println!("Dataset: {}", args.dataset);
    println!("Tag:     {}", args.tag);

    let device = candle_core::Device::Cpu;
    let dir = acts_dir(&args.acts_dir, &args.dataset, args.limit);

    info!("Loading activations from {}", dir.display());
    let acts = load_acts(&dir, &args.tag, !args.no_center, args.scale, &device)?;
    info!("Activations: {:?}", acts.dims());

    let mut dataset = Dataset::load(&args.data_dir, &args.dataset)?;
    dataset.truncate(args.limit);
    let labels = dataset.labels();
    info!(
        "Labels: {} ({} true, {} false)",
        labels.len(),
        dataset.true_count(),
        dataset.false_count()
    );

    let trainer = ProbeTrainer::new();
    let results = trainer.probe_stored_acts(&acts, &labels, args.train_ratio, args.seed)?;

    println!("\n=== Results ===");
    println!(
        "Accuracy:  {:.1}% ({}/{})",
        results.accuracy * 100.0,
        results.correct,
        results.total
    );
    println!("Precision: {:.3}", results.precision());
    println!("Recall:    {:.3}", results.recall());
    println!("F1:        {:.3}", results.f1());

    Ok(())
}
