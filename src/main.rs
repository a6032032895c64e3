use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;

use tiervm::compiler::dump;
use tiervm::config::{ConfigError, JitMode, RuntimeConfig};
use tiervm::vm::bytecode;
use tiervm::vm::cfg::CfgError;
use tiervm::vm::native::format_value;
use tiervm::{LoadError, Vm, VmError};
use tracing_subscriber::EnvFilter;

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum JitModeArg {
    Off,
    On,
    Auto,
}

impl From<JitModeArg> for JitMode {
    fn from(arg: JitModeArg) -> Self {
        match arg {
            JitModeArg::Off => JitMode::Off,
            JitModeArg::On => JitMode::On,
            JitModeArg::Auto => JitMode::Auto,
        }
    }
}

#[derive(Parser)]
#[command(name = "tiervm")]
#[command(about = "A register VM with a tiering JIT", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a listing or binary image
    Run {
        /// Assembly listing or binary image (detected by magic)
        file: PathBuf,

        /// TOML runtime configuration; flags below override it
        #[arg(long, value_name = "TOML")]
        config: Option<PathBuf>,

        /// JIT compilation mode (off, on, auto)
        #[arg(long, value_enum)]
        jit: Option<JitModeArg>,

        /// JIT compilation threshold (number of calls before JIT)
        #[arg(long)]
        jit_threshold: Option<u32>,

        /// Disable garbage collection
        #[arg(long)]
        no_gc: bool,

        /// Print GC and JIT statistics as JSON on stderr
        #[arg(long)]
        gc_stats: bool,

        /// Trace JIT compilation events
        #[arg(long)]
        trace_jit: bool,
    },
    /// Assemble a listing into a binary image
    Asm {
        listing: PathBuf,

        /// Output image path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Print a program as a listing
    Disasm {
        file: PathBuf,

        /// Show the raw code array instead
        #[arg(long)]
        raw: bool,
    },
    /// Print the control-flow graph of one function
    Cfg {
        file: PathBuf,

        #[arg(long, default_value = "main")]
        function: String,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("runtime error: {0}")]
    Vm(#[from] VmError),
    #[error(transparent)]
    Cfg(#[from] CfgError),
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no function named '{0}'")]
    UnknownFunction(String),
}

fn init_tracing(trace_jit: bool) {
    let mut directives = std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string());
    if trace_jit {
        directives.push_str(",tiervm::jit=debug,tiervm::vm=debug");
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directives))
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let trace_jit = matches!(cli.command, Commands::Run { trace_jit: true, .. });
    init_tracing(trace_jit);

    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn execute(command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Run {
            file,
            config,
            jit,
            jit_threshold,
            no_gc,
            gc_stats,
            trace_jit: _,
        } => {
            let mut config = match config {
                Some(path) => RuntimeConfig::load(path)?,
                None => RuntimeConfig::default(),
            };
            if let Some(jit) = jit {
                config.jit_mode = jit.into();
            }
            if let Some(threshold) = jit_threshold {
                config.jit_threshold = threshold;
            }
            if no_gc {
                config.gc_enabled = false;
            }
            config.gc_stats |= gc_stats;

            let program = tiervm::load_file(&file)?;
            let mut vm = Vm::with_config(program, &config);
            let result = vm.run();

            if config.gc_stats {
                match serde_json::to_string_pretty(&vm.stats()) {
                    Ok(json) => eprintln!("{}", json),
                    Err(e) => tracing::warn!("failed to encode stats: {}", e),
                }
            }

            let value = result?;
            if !value.is_nil() {
                println!("{}", format_value(vm.heap(), value));
            }
        }
        Commands::Asm { listing, output } => {
            let program = tiervm::load_file(&listing)?;
            std::fs::write(&output, bytecode::serialize(&program)).map_err(|source| {
                CliError::Write {
                    path: output.display().to_string(),
                    source,
                }
            })?;
        }
        Commands::Disasm { file, raw } => {
            let program = tiervm::load_file(&file)?;
            if raw {
                print!("{}", dump::raw(&program));
            } else {
                print!("{}", dump::listing(&program));
            }
        }
        Commands::Cfg { file, function } => {
            let program = tiervm::load_file(&file)?;
            let index = program
                .function_index(&function)
                .ok_or(CliError::UnknownFunction(function))?;
            print!("{}", dump::cfg(&program, index)?);
        }
    }
    Ok(())
}
