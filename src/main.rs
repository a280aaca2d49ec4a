//! attributor-rs CLI: generate a continuation and explain it
//!
//! Runs the prompt through the model, attributes every generated token
//! back to the tokens before it, and prints the strongest input spans.

use anyhow::Result;
use candle_core::{DType, Device};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use attributor_rs::{AttentionModel, Attributor, AttributorLlama, Span, TextTokenizer};

#[derive(Parser)]
#[command(name = "attributor-rs")]
#[command(about = "Attention attribution for autoregressive transformers")]
#[command(version)]
struct Cli {
    /// Model ID from HuggingFace (LLaMA-family)
    #[arg(short, long, default_value = "meta-llama/Llama-3.2-1B")]
    model: String,

    /// Prompt to continue and attribute
    #[arg(short, long)]
    prompt: String,

    /// Maximum number of tokens to generate
    #[arg(long, default_value_t = 64)]
    max_tokens: usize,

    /// Sampling temperature (0 = greedy)
    #[arg(short, long, default_value_t = 0.0)]
    temperature: f32,

    /// Input spans reported per generated token
    #[arg(short = 'k', long, default_value_t = 3)]
    top_k: usize,

    /// Use the weighted-total-attention strategy instead of residual propagation
    #[arg(long)]
    weighted: bool,

    /// Force CPU mode
    #[arg(long)]
    cpu: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
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

    let device = if cli.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)?
    };
    let dtype = if device.is_cuda() {
        DType::BF16
    } else {
        DType::F32
    };

    info!("Loading model...");
    let model = AttributorLlama::from_pretrained(&cli.model, &device, dtype)?;
    let tokenizer = attributor_rs::llama::load_tokenizer(&cli.model)?;
    info!(
        "Model: {} layers, {} heads",
        AttentionModel::n_layers(&model),
        AttentionModel::n_heads(&model),
    );

    let prompt_ids = TextTokenizer::encode(&tokenizer, &cli.prompt)?;
    let mut attributor = Attributor::new(model);

    info!("Generating up to {} tokens...", cli.max_tokens);
    let tokens =
        attributor
            .model()
            .generate(&prompt_ids, cli.max_tokens, cli.temperature)?;
    println!("=== Completion ===");
    println!("{}", TextTokenizer::decode(&tokenizer, &tokens)?);

    info!("Attributing {} tokens...", tokens.len());
    let attribution = if cli.weighted {
        attributor.attribute_weighted(&tokens)?
    } else {
        attributor.attribute(&tokens)?
    };

    // explain only the generated region, attributed to the prompt
    let output_span = Span::range(prompt_ids.len(), tokens.len());
    let input_span = Span::range(0, prompt_ids.len());
    let ranked = attribution.top_k(cli.top_k, 0, &output_span, &input_span, None)?;

    println!("=== Attribution (top {} per generated token) ===", cli.top_k);
    for row in &ranked {
        for span in row {
            println!("{}", span.pretty_print(&tokenizer, &tokens)?);
        }
    }

    Ok(())
}
