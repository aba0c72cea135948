use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "pluglet")]
#[clap(version, about = "Run untrusted JavaScript plugins in isolated sandboxes")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "PLUGLET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Invoke a plugin's entry point once in a fresh sandbox
    Run(RunArgs),

    /// Initialize a new pluglet configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

// ============================================================================
// Plugin Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Name of the entry point function defined by the plugin
    #[clap(long, short = 'n')]
    pub name: String,

    /// File containing the plugin source (reads stdin when omitted)
    #[clap(long = "code-file", short = 'f')]
    pub code_file: Option<PathBuf>,

    /// Parameters passed as the first argument (JSON object)
    #[clap(long, short = 'p', value_parser = parse_json, default_value = "{}")]
    pub params: Value,

    /// User settings passed as the second argument (JSON object)
    #[clap(long, short = 's', value_parser = parse_json, default_value = "{}")]
    pub settings: Value,

    /// Correlation id for logs (defaults to the entry point name)
    #[clap(long)]
    pub id: Option<String>,

    /// Override the configured deadline in milliseconds
    #[clap(long)]
    pub timeout_ms: Option<u64>,

    /// Override the configured memory ceiling in MB
    #[clap(long)]
    pub memory_mb: Option<u64>,

    /// Do not grant the fetch capability
    #[clap(long)]
    pub no_fetch: bool,
}

// ============================================================================
// Config Commands
// ============================================================================

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

// ============================================================================
// Common Types
// ============================================================================

fn parse_json(s: &str) -> Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("Invalid JSON: {}", e))
}

#[derive(Debug, Clone, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
