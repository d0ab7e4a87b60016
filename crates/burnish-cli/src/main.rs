use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burnish_contracts::errors::RunError;
use burnish_contracts::models::{resolve_refiner, GeneratorRegistry};
use burnish_engine::{build_generator, build_refiner, IterationReport, RefineLoop, RunOptions};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "burnish",
    version,
    about = "Iteratively refine an image-generation prompt against its own output"
)]
struct Cli {
    /// Prompt describing the desired image.
    prompt: Option<String>,
    /// Read the prompt from a file instead of the command line.
    #[arg(long)]
    prompt_path: Option<PathBuf>,
    /// Directory where final images will be saved.
    #[arg(short = 'o', long)]
    output_dir: PathBuf,
    /// Number of refinement iterations.
    #[arg(short = 'n', long, default_value_t = 3)]
    iterations: u32,
    /// Model used to review images and revise prompts.
    #[arg(long, default_value = "local-llava")]
    refine_model: String,
    /// Model used to generate images.
    #[arg(long, default_value = "comfyui-flux")]
    gen_model: String,
    /// Directory the local workflow executor writes finished images into.
    #[arg(long)]
    comfyui_output_dir: Option<PathBuf>,
    /// Request raw-style output from remote generators that support it.
    #[arg(long)]
    raw: bool,
    /// Temperature for the review request.
    #[arg(long)]
    review_temperature: Option<f64>,
    /// Temperature for the revision request.
    #[arg(long)]
    refine_temperature: Option<f64>,
    /// Release generator memory each iteration before the review runs.
    #[arg(long)]
    free_vram: bool,
    /// Event log destination. Defaults to <output-dir>/events.jsonl.
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("burnish error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    run_refine(Cli::parse())
}

fn run_refine(cli: Cli) -> Result<i32> {
    // Model resolution comes first so an unknown id fails before anything
    // touches the filesystem or network.
    let registry = GeneratorRegistry::new(None);
    let spec = registry.resolve(&cli.gen_model)?.clone();

    let original_prompt =
        resolve_initial_prompt(cli.prompt.as_deref(), cli.prompt_path.as_deref())?;
    let generator = build_generator(&spec, cli.comfyui_output_dir.as_deref())?;
    let refiner = build_refiner(&resolve_refiner(&cli.refine_model));

    let events_path = cli
        .events
        .clone()
        .unwrap_or_else(|| cli.output_dir.join("events.jsonl"));
    let options = RunOptions {
        iterations: cli.iterations,
        raw: cli.raw,
        free_vram: cli.free_vram,
        review_temperature: cli.review_temperature,
        refine_temperature: cli.refine_temperature,
    };
    let mut refinement = RefineLoop::new(
        &cli.output_dir,
        &events_path,
        original_prompt,
        generator,
        refiner,
        options,
    )?;

    while !refinement.is_done() {
        println!(
            "Iteration {}/{}",
            refinement.completed() + 1,
            cli.iterations
        );
        println!("Prompt: {}", refinement.current_prompt());
        let report = refinement.step()?;
        for line in iteration_lines(&report) {
            println!("{line}");
        }
        println!();
    }

    let summary = refinement.finish()?;
    println!("Image generation and refinement complete.");
    println!("Refined prompt: {}", summary.final_prompt);
    Ok(0)
}

fn iteration_lines(report: &IterationReport) -> Vec<String> {
    let mut lines = vec![
        format!("Image: {}", report.image_path.display()),
        format!("Review: {}", report.review),
    ];
    for _ in 0..report.duplicate_retries {
        lines.push("Skipping duplicate prompt".to_string());
    }
    lines
}

fn resolve_initial_prompt(prompt: Option<&str>, prompt_path: Option<&Path>) -> Result<String> {
    let text = match (prompt, prompt_path) {
        (Some(_), Some(_)) => {
            return Err(RunError::Configuration(
                "cannot use both a prompt argument and --prompt-path".to_string(),
            )
            .into())
        }
        (None, None) => {
            return Err(RunError::Configuration(
                "one of the prompt argument or --prompt-path must be set".to_string(),
            )
            .into())
        }
        (Some(text), None) => text.to_string(),
        (None, Some(path)) => fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt from {}", path.display()))?,
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(RunError::Configuration("the prompt is empty".to_string()).into());
    }
    Ok(trimmed.to_string())
}
