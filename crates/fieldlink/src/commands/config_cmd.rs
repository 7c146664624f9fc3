//! Config subcommand handlers.

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Show => {
            let config = super::load_config(global)?;
            print!("{}", config.to_redacted_toml()?);
            Ok(())
        }

        ConfigCommand::Path => {
            let path = global
                .config
                .clone()
                .unwrap_or_else(fieldlink_config::config_path);
            println!("{}", path.display());
            Ok(())
        }

        ConfigCommand::Check => {
            let config = super::load_config(global)?;
            let c = &config.controllers;
            println!("configuration ok");
            for name in c.bacnet.keys() {
                println!("  bacnet  {name}");
            }
            for name in c.api.keys() {
                println!("  api     {name}");
            }
            for name in c.socket.keys() {
                println!("  socket  {name}");
            }
            if c.is_empty() {
                println!("  (no controllers configured)");
            }
            Ok(())
        }
    }
}
