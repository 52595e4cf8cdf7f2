//! typst-attach binary
//!
//! Compiles a Typst document and attaches the files its `embed-file`
//! metadata markers reference, as embedded attachments plus clickable
//! page annotations.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use attach_core::{pipeline, RunRequest, TypstCli};

#[derive(Parser, Debug)]
#[command(name = "typst-attach")]
#[command(
    version,
    about = "Compile a Typst document and embed marked file attachments into the PDF"
)]
struct Args {
    /// Path to the .typ source file
    input: PathBuf,

    /// Output PDF path (default: the input with a .pdf extension)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Base directory for resolving attachment paths (default: the
    /// input's containing directory)
    #[arg(short = 'd', long)]
    base_dir: Option<PathBuf>,

    /// Typst binary to invoke
    #[arg(long, default_value = "typst")]
    typst: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    // Keep stdout for the summary line; logs go to stderr.
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let tools = TypstCli::with_program(args.typst);
    let request = RunRequest {
        source: args.input,
        output: args.output,
        base_dir: args.base_dir,
    };

    let report = pipeline::run(&tools, &request)?;
    println!("{}", report.summary());
    Ok(())
}
