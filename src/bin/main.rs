use anyhow::Context;
use candle_core::Device;
use clap::{Parser, Subcommand};
use ifd_select_rs::{
    analysis::AnalysisSink,
    config::{MergerConfig, ScorerConfig},
    data::load_instruction_data,
    measure::ModelMeasurer,
    merger::merge_files,
    model::{CausalLanguageModel, GPTModel, ModelFiles},
    scorer::Scorer,
    tokenizer::ModelTokenizer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// CLI
#[derive(Debug, Parser)]
#[command(name = "ifd-select-rs")]
#[command(about = "Score instruction data by Instruction-Following Difficulty.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Measure every record of a dataset into a resumable analysis stream
    Score(ScorerConfig),
    /// Join an analysis stream onto its dataset and derive the ratios
    Merge(MergerConfig),
}

fn score(config: ScorerConfig) -> anyhow::Result<()> {
    let config = config.resolve()?;
    info!(?config, "Starting scoring run");

    let dev = Device::cuda_if_available(0)?;
    let files = ModelFiles::resolve(&config.model_name_or_path)?;
    let model = GPTModel::from_files(&files.config, &files.weights, &dev)?;
    let tokenizer = ModelTokenizer::load(files.tokenizer.as_deref(), model.config().vocab_size)?;

    let mut max_length = config.max_length;
    if max_length > model.context_length() {
        warn!(
            max_length,
            context_length = model.context_length(),
            "max_length exceeds the model context length, clamping"
        );
        max_length = model.context_length();
    }

    let dataset = load_instruction_data(&config.data_path)?;
    let measurer = ModelMeasurer::new(model, tokenizer);
    let scorer = Scorer::new(&measurer, config.prompt, max_length);
    let mut sink = AnalysisSink::open(&config.save_path)?;
    let summary = scorer
        .score(&dataset, config.start_idx, config.end_idx()?, &mut sink)
        .with_context(|| format!("Scoring {} stopped", config.data_path))?;
    info!(
        scored = summary.scored,
        skipped_empty_output = summary.skipped_empty_output,
        failed_measurements = summary.failed_measurements,
        "Done"
    );
    Ok(())
}

fn merge(config: MergerConfig) -> anyhow::Result<()> {
    info!(?config, "Starting merge");
    merge_files(
        &config.pt_data_path,
        &config.json_data_path,
        &config.json_save_path,
    )?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Score(config) => score(config),
        Commands::Merge(config) => merge(config),
    }
}
