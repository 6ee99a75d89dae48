//! Hardware buffer extraction CLI
//!
//! Usage:
//!   extract-hwbuffers pipeline.json
//!   extract-hwbuffers pipeline.json --json
//!   extract-hwbuffers pipeline.json --annotate -v
//!   cat pipeline.json | extract-hwbuffers

use clap::Parser as ClapParser;
use colored::Colorize;
use std::fs;
use std::io::{self, Read};

use hw_buffers::{ExtractedBuffers, PassConfig, PipelineSpec};

#[derive(ClapParser, Debug)]
#[command(name = "extract-hwbuffers")]
#[command(author = "FPGA Team")]
#[command(version = "0.1.0")]
#[command(about = "Extracts hardware line-buffer and double-buffer specs from a scheduled pipeline")]
struct Args {
    /// Pipeline description: IR text plus stage schedules, as JSON
    #[arg(value_name = "PIPELINE")]
    input_file: Option<String>,

    /// Deepest loop nesting accepted
    #[arg(long = "max-depth", default_value = "64")]
    max_depth: usize,

    /// Print the program with a comment before every buffered store scope
    #[arg(short = 'a', long = "annotate")]
    annotate: bool,

    /// Output as JSON
    #[arg(short = 'j', long = "json")]
    json_output: bool,

    /// Verbose output
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    // Read the pipeline from a file or stdin
    let source = if let Some(file) = &args.input_file {
        fs::read_to_string(file).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read file '{}': {}", "Error".red(), file, e);
            std::process::exit(1);
        })
    } else {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer).unwrap_or_else(|e| {
            eprintln!("{}: Failed to read stdin: {}", "Error".red(), e);
            std::process::exit(1);
        });
        buffer
    };

    let spec = match PipelineSpec::from_json(&source) {
        Ok(spec) => spec,
        Err(e) => {
            eprintln!("{}: {}", "Invalid pipeline".red(), e);
            std::process::exit(1);
        }
    };

    if args.verbose {
        println!("{}", "Hardware Buffer Extraction".bold().blue());
        println!("{}", "=".repeat(35));
        println!();
        println!("{}: {} stages", "Input".green(), spec.stages.len());
        let flagged: Vec<&str> = spec
            .stages
            .iter()
            .filter(|s| s.schedule.hw_buffer)
            .map(|s| s.name.as_str())
            .collect();
        println!("{}: {}", "Buffered".green(), flagged.join(", "));
        println!();
    }

    let config = PassConfig::new(args.max_depth, args.annotate);
    let result = match spec.run(config) {
        Ok(result) => result,
        Err(e) => {
            let label = match e.stage() {
                Some(stage) => format!("Scheduling error in `{}`", stage),
                None => "Error".to_string(),
            };
            eprintln!("{}: {}", label.red(), e);
            std::process::exit(1);
        }
    };

    if args.json_output {
        match serde_json::to_string_pretty(&result.buffers) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                eprintln!("{}: Failed to serialize to JSON: {}", "Error".red(), e);
                std::process::exit(1);
            }
        }
    } else {
        print_report(&result, args.annotate);
    }
}

fn print_report(result: &ExtractedBuffers, annotate: bool) {
    println!("{}", "Extraction Results".bold().green());
    println!("{}", "=".repeat(50));
    println!();
    println!("{}: {}", "Buffers".cyan(), result.buffers.len());
    let words = result
        .buffers
        .values()
        .try_fold(0i64, |sum, buffer| buffer.total_words().and_then(|w| sum.checked_add(w)));
    match words {
        Some(words) => println!("{}: {} words", "Total storage".cyan(), words),
        None => println!("{}: exceeds 64-bit word count", "Total storage".cyan()),
    }

    for buffer in result.buffers.values() {
        println!();
        println!("{} {}", "Buffer".bold(), buffer.name.bold());
        println!("  {}: {}", "Kind".cyan(), buffer.kind);
        println!(
            "  {}: {} / {}",
            "Store / compute".cyan(),
            buffer.store_level,
            buffer.compute_level
        );
        let loops: Vec<String> = buffer.streaming_loops.iter().map(|s| s.to_string()).collect();
        println!("  {}: [{}]", "Streaming loops".cyan(), loops.join(", "));
        println!("  {}: {:?}", "Capacity".cyan(), buffer.buffer_capacity);
        println!(
            "  {}: chunk {:?}, block {:?}",
            "Input".cyan(),
            buffer.input_chunk_size,
            buffer.input_block_size
        );
        println!("  {}: {}", "Input pattern".cyan(), buffer.input_access_pattern);
        println!(
            "  {}: stencil {:?}, block {:?}",
            "Output".cyan(),
            buffer.output_stencil_size,
            buffer.output_block_size
        );
        println!("  {}: {}", "Output pattern".cyan(), buffer.output_access_pattern);
    }

    if annotate {
        println!();
        println!("{}", "Annotated Program".bold().yellow());
        println!("{}", "-".repeat(50));
        print!("{}", result.stmt);
    }
}
