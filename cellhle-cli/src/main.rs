// CLI application
use clap::Parser;
use std::path::PathBuf;

mod commands;

use commands::{
    print_function_ids, run_spu, settings_reset, settings_set_hle_logging, settings_show,
};

#[derive(Parser)]
#[command(name = "cellhle")]
#[command(about = "Raw SPU and HLE dispatch tools for the Cell emulation core")]
#[command(version)]
struct Cli {
    /// Settings file (default: platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Print the function ID of each export name
    Nid {
        /// Export names
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Inspect or change the settings file
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Run a raw local store image on a raw SPU until it stops
    RunSpu {
        /// Local store image, loaded at address 0
        #[arg(short, long)]
        image: PathBuf,

        /// Raw SPU index (0-4)
        #[arg(long, default_value_t = 0)]
        index: u32,

        /// Entry point written to SPU_NPC
        #[arg(long, default_value = "0", value_parser = parse_u32)]
        entry: u32,

        /// Give up waiting after this many milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
}

#[derive(clap::Subcommand)]
enum SettingsAction {
    /// Print the effective settings
    Show,
    /// Overwrite the settings file with defaults
    Reset,
    /// Enable or disable HLE module notices
    SetHleLogging {
        #[arg(value_enum)]
        state: Toggle,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Toggle {
    On,
    Off,
}

/// Parse a decimal or `0x`-prefixed hexadecimal number.
fn parse_u32(value: &str) -> Result<u32, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", value, e))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
            .init();
    } else {
        env_logger::init();
    }

    let config = cli
        .config
        .unwrap_or_else(cellhle_core::EmuSettings::default_path);

    match cli.command {
        Commands::Nid { names } => print_function_ids(&names),
        Commands::Settings { action } => match action {
            SettingsAction::Show => settings_show(&config)?,
            SettingsAction::Reset => settings_reset(&config)?,
            SettingsAction::SetHleLogging { state } => {
                settings_set_hle_logging(&config, matches!(state, Toggle::On))?
            }
        },
        Commands::RunSpu {
            image,
            index,
            entry,
            timeout_ms,
        } => run_spu(&config, &image, index, entry, timeout_ms)?,
    }

    Ok(())
}
