use std::io::Read;

use tracing::info;

use crate::assembler::PluginRequest;
use crate::cli::args::{ConfigAction, ConfigArgs, InitArgs, OutputFormat, RunArgs};
use crate::config::loader::get_config_path;
use crate::config::types::PlugletConfig;
use crate::delegate::DelegateSet;
use crate::error::{PlugletError, Result};
use crate::sandbox::{PluginOutcome, PluginRunner, SandboxLimits};

// ============================================================================
// Plugin Commands
// ============================================================================

/// Invoke a plugin once and print its result
pub async fn run(args: RunArgs, mut config: PlugletConfig, format: OutputFormat) -> Result<()> {
    if let Some(timeout_ms) = args.timeout_ms {
        config.sandbox.timeout_ms = timeout_ms;
    }
    if let Some(memory_mb) = args.memory_mb {
        config.sandbox.memory_limit_mb = memory_mb;
    }

    let code = match &args.code_file {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut code = String::new();
            std::io::stdin().read_to_string(&mut code)?;
            code
        }
    };

    let delegates = if args.no_fetch {
        DelegateSet::new()
    } else {
        DelegateSet::with_fetch(&config.fetch)?
    };
    info!(capabilities = ?delegates, "Granting capabilities");

    let runner = PluginRunner::new(SandboxLimits::from(&config.sandbox), delegates);

    let mut request = PluginRequest::new(args.name, code)
        .with_params(args.params)
        .with_settings(args.settings);
    request.id = args.id;

    match runner.run(&request).await {
        Ok(outcome) => {
            output_outcome(&outcome, format);
            Ok(())
        }
        Err(e) => match format {
            OutputFormat::Text => Err(e),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({
                        "ok": false,
                        "error": e.report(),
                    })
                );
                std::process::exit(1);
            }
        },
    }
}

// ============================================================================
// Config Commands
// ============================================================================

/// Initialize configuration
pub async fn init(args: InitArgs) -> Result<()> {
    let config_path = get_config_path();

    if config_path.exists() && !args.force {
        println!("Configuration already exists at: {}", config_path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let default_config = PlugletConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| PlugletError::Config(e.to_string()))?;

    std::fs::write(&config_path, toml_str)?;

    println!("Created configuration at: {}", config_path.display());
    println!("\nQuick start:");
    println!("  # Run a plugin from a file");
    println!("  pluglet run --name add --code-file add.js --params '{{\"a\": 2, \"b\": 3}}'");
    println!();
    println!("  # Or pipe the source in");
    println!("  echo 'function hello() {{ return \"hi\"; }}' | pluglet run --name hello");

    Ok(())
}

pub async fn config(args: ConfigArgs, config: PlugletConfig) -> Result<()> {
    match args.action {
        ConfigAction::Show => {
            let toml_str = toml::to_string_pretty(&config)
                .map_err(|e| PlugletError::Config(e.to_string()))?;
            println!("{}", toml_str);
        }
        ConfigAction::Path => {
            println!("{}", get_config_path().display());
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

fn output_outcome(outcome: &PluginOutcome, format: OutputFormat) {
    match format {
        OutputFormat::Text => match &outcome.value {
            serde_json::Value::String(s) => println!("{}", s),
            value => println!(
                "{}",
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            ),
        },
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({
                    "ok": true,
                    "id": outcome.id,
                    "value": outcome.value,
                    "delegate_calls": outcome.delegate_calls,
                    "elapsed_ms": outcome.elapsed_ms,
                })
            );
        }
    }
}
