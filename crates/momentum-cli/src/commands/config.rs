use clap::Subcommand;
use momentum_core::InterventionConfig;

use super::{print_json, CliResult, Context};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a config value
    Get {
        /// Dot-separated key (e.g. "zones.rising_threshold")
        key: String,
    },
    /// Set a config value
    Set {
        /// Dot-separated key
        key: String,
        /// New value
        value: String,
    },
    /// List all config values
    #[command(alias = "show")]
    List,
    /// Check the config file without writing defaults
    Validate,
    /// Reset config to defaults
    Reset,
}

pub fn run(ctx: &Context, action: ConfigAction) -> CliResult {
    match action {
        ConfigAction::Get { key } => {
            let config = ctx.load_config()?;
            match config.get(&key) {
                Some(value) => println!("{value}"),
                None => {
                    eprintln!("unknown key: {key}");
                    std::process::exit(1);
                }
            }
        }
        ConfigAction::Set { key, value } => {
            let mut config = ctx.load_config()?;
            config.set(&key, &value)?;
            config.save(&ctx.config_path()?)?;
            println!("ok");
        }
        ConfigAction::List => {
            print_json(&ctx.load_config()?)?;
        }
        ConfigAction::Validate => {
            InterventionConfig::load(&ctx.config_path()?)?;
            println!("ok");
        }
        ConfigAction::Reset => {
            InterventionConfig::default().save(&ctx.config_path()?)?;
            println!("config reset to defaults");
        }
    }
    Ok(())
}
