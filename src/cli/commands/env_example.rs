//! `.env` template command.

use std::path::Path;

use crate::cli::icons::success;
use crate::config::ENV_EXAMPLE;

/// Print the template, or write it to `path` if that file doesn't exist yet.
pub fn cmd_env_example(path: Option<&Path>) -> anyhow::Result<()> {
    let Some(path) = path else {
        print!("{}", ENV_EXAMPLE);
        return Ok(());
    };

    if path.exists() {
        anyhow::bail!("{} already exists; not overwriting", path.display());
    }
    std::fs::write(path, ENV_EXAMPLE)?;
    eprintln!("{} Wrote {}", success(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_refuses_to_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env");

        cmd_env_example(Some(&path)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), ENV_EXAMPLE);

        std::fs::write(&path, "OPENAI_API_KEY=keep-me\n").unwrap();
        assert!(cmd_env_example(Some(&path)).is_err());
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "OPENAI_API_KEY=keep-me\n"
        );
    }
}
