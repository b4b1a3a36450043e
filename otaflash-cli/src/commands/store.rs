//! Artifact store command implementations.

use {
    crate::{
        Cli, CliError,
        commands::{print_json, update::open_store},
        config::Config,
        serial::{ensure_interactive_terminal, map_prompt_error},
    },
    anyhow::{Context, Result},
    console::style,
    dialoguer::{Confirm, theme::ColorfulTheme},
    otaflash::{ArtifactNames, FileStore, StoredFile},
};

/// Role of a stored document in the update cycle, if it has one.
fn role(names: &ArtifactNames, name: &str) -> Option<&'static str> {
    let roles = [
        (&names.onboard_version, "onboard version"),
        (&names.onboard_firmware, "onboard firmware"),
        (&names.latest_version, "staged version"),
        (&names.latest_firmware, "staged firmware"),
        (&names.retry_count, "retry counter"),
    ];
    roles
        .into_iter()
        .find(|(n, _)| n.as_str() == name)
        .map(|(_, role)| role)
}

/// Store list command implementation.
pub(crate) fn cmd_store_list(cli: &Cli, config: &Config, json: bool) -> Result<()> {
    let store = open_store(cli, config)?;
    let files = store.list()?;
    let names = ArtifactNames::default();

    if json {
        let entries: Vec<serde_json::Value> = files
            .iter()
            .map(|f| {
                serde_json::json!({
                    "name": f.name,
                    "size": f.size,
                    "role": role(&names, &f.name),
                })
            })
            .collect();
        return print_json(&entries);
    }

    eprintln!(
        "{}",
        style(format!("Store at {}", store.root().display()))
            .bold()
            .underlined()
    );
    if files.is_empty() {
        eprintln!("  {}", style("empty").dim());
        return Ok(());
    }
    for StoredFile { name, size } in &files {
        let role = role(&names, name)
            .map(|r| format!(" [{}]", style(r).yellow()))
            .unwrap_or_default();
        println!("{name}\t{size}{role}");
    }
    Ok(())
}

/// Store show command implementation.
pub(crate) fn cmd_store_show(cli: &Cli, config: &Config, name: &str) -> Result<()> {
    let store = open_store(cli, config)?;
    if !store.exists(name) {
        return Err(CliError::Usage(format!("no document named {name:?} in the store")).into());
    }
    let text = store
        .read(name)
        .with_context(|| format!("Failed to read {name}"))?;
    print!("{text}");
    if !text.ends_with('\n') {
        println!();
    }
    Ok(())
}

/// Store format command implementation.
pub(crate) fn cmd_store_format(cli: &Cli, config: &Config, yes: bool) -> Result<()> {
    let mut store = open_store(cli, config)?;

    if !yes {
        if cli.non_interactive {
            return Err(CliError::Usage(
                "formatting the store needs --yes in non-interactive mode".to_string(),
            )
            .into());
        }
        ensure_interactive_terminal()?;
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(format!(
                "Remove every document in {}?",
                store.root().display()
            ))
            .default(false)
            .interact()
            .map_err(map_prompt_error)?;
        if !confirmed {
            return Err(CliError::Cancelled("format cancelled".to_string()).into());
        }
    }

    store.format()?;
    if !cli.quiet {
        eprintln!(
            "{} Formatted store at {}",
            style("✓").green(),
            store.root().display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roles() {
        let names = ArtifactNames::default();
        assert_eq!(role(&names, "fw-latest.hex"), Some("staged firmware"));
        assert_eq!(role(&names, "update-tries.md"), Some("retry counter"));
        assert_eq!(role(&names, "notes.txt"), None);
    }
}
