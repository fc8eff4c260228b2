//! Configuration check command.

use console::style;

use crate::cli::icons::{error, success};
use crate::config::{ConfigError, Settings};

/// Print the configuration summary and fail on invalid settings.
pub fn cmd_check(settings: &Settings) -> anyhow::Result<()> {
    println!("{}", style("Configuration").bold());
    for (label, value) in settings.summary() {
        println!("  {:<28} {}", style(label).dim(), value);
    }
    println!();

    ensure_valid(settings)?;
    println!("{} Configuration is valid", success());
    Ok(())
}

/// Print every validation problem and return an error if there were any.
pub fn ensure_valid(settings: &Settings) -> anyhow::Result<()> {
    match settings.validate() {
        Ok(()) => Ok(()),
        Err(ConfigError::Invalid(problems)) => {
            for problem in &problems {
                eprintln!("{} {}", error(), problem);
            }
            anyhow::bail!("configuration has {} problem(s)", problems.len())
        }
        Err(e) => Err(e.into()),
    }
}
