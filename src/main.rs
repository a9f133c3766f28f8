use anyhow::{Context, Result};
use clap::Parser;
use insntrace::cli::Cli;
use insntrace::config::TracerConfig;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(args: &Cli) -> Result<TracerConfig> {
    let base = match &args.config {
        Some(path) => TracerConfig::from_toml_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TracerConfig::default(),
    };
    let config = args.apply(base);
    config.validate()?;
    Ok(config)
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn run_tracer(command: &[String], config: TracerConfig) -> Result<i32> {
    insntrace::tracer::trace_command(command, config)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn run_tracer(_command: &[String], _config: TracerConfig) -> Result<i32> {
    anyhow::bail!("The ptrace host only supports x86_64 Linux")
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    let config = load_config(&args)?;
    let Some(command) = args.command.as_deref() else {
        anyhow::bail!("Must specify a command. Usage: insntrace [OPTIONS] -- COMMAND [ARGS...]");
    };

    // Exit with traced program's exit code
    let exit_code = run_tracer(command, config)?;
    std::process::exit(exit_code);
}
