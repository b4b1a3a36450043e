//! Bus bridge port selection.
//!
//! The port comes from `--port`, the config file, or the list of detected
//! serial ports. Several candidates are offered in a prompt unless the CLI
//! runs non-interactively, in which case exactly one must exist.

use {
    crate::{Cli, CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    otaflash::{NativePortEnumerator, PortEnumerator, PortInfo},
    std::{cmp::Ordering, io::IsTerminal},
};

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Fail unless both stdin and stderr are terminals.
pub(crate) fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "interactive prompt requires a terminal, use --non-interactive with explicit options",
        ))
    }
}

/// Map a prompt failure to an exit-code class.
pub(crate) fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("prompt cancelled".to_string()).into()
            } else {
                usage_err("prompt failed")
            }
        },
    }
}

/// Pick the serial port of the bus bridge.
pub(crate) fn select_bridge_port(cli: &Cli, config: &Config) -> Result<String> {
    if let Some(port) = &cli.port {
        return Ok(port.clone());
    }
    if let Some(port) = &config.device.serial {
        debug!("Using port from config: {port}");
        return Ok(port.clone());
    }

    let ports = NativePortEnumerator::list_ports()?;
    choose(ports, cli.non_interactive)
}

fn choose(mut ports: Vec<PortInfo>, non_interactive: bool) -> Result<String> {
    match ports.len().cmp(&1) {
        Ordering::Less => Err(usage_err(
            "no serial ports found, connect the bridge or pass --port",
        )),
        Ordering::Equal => {
            let port = ports.remove(0);
            info!("Auto-selected port: {}", port.name);
            Ok(port.name)
        },
        Ordering::Greater if non_interactive => Err(usage_err(
            "multiple serial ports found, pass --port to pick one",
        )),
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(ports)
        },
    }
}

fn port_label(port: &PortInfo) -> String {
    let ids = match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
        _ => String::new(),
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    format!("{}{ids}{product}", port.name)
}

fn select_port_interactive(mut ports: Vec<PortInfo>) -> Result<String> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    // USB adapters first
    ports.sort_by_key(|p| p.vid.is_none());

    let term_width = usize::from(console::Term::stderr().size().1);
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&port_label(p), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the bridge port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => ports
            .into_iter()
            .nth(index)
            .map(|p| p.name)
            .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}")),
        None => Err(CliError::Cancelled("port selection cancelled".to_string()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, usb: bool) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: usb.then_some(0x1A86),
            pid: usb.then_some(0x7523),
            manufacturer: None,
            product: None,
        }
    }

    fn exit_class(err: &anyhow::Error) -> Option<&CliError> {
        err.downcast_ref::<CliError>()
    }

    #[test]
    fn test_no_ports_is_usage_error() {
        let err = choose(Vec::new(), true).unwrap_err();
        assert!(matches!(exit_class(&err), Some(CliError::Usage(_))));
    }

    #[test]
    fn test_single_port_is_selected() {
        assert_eq!(
            choose(vec![port("/dev/ttyUSB0", true)], true).unwrap(),
            "/dev/ttyUSB0"
        );
    }

    #[test]
    fn test_multiple_ports_non_interactive_fails_fast() {
        let err = choose(vec![port("/dev/ttyS0", false), port("/dev/ttyUSB0", true)], true)
            .unwrap_err();
        assert!(matches!(exit_class(&err), Some(CliError::Usage(_))));
        assert!(err.to_string().contains("multiple"));
    }

    #[test]
    fn test_port_label() {
        console::set_colors_enabled(false);
        assert_eq!(port_label(&port("/dev/ttyUSB0", true)), "/dev/ttyUSB0 (1A86:7523)");
        assert_eq!(port_label(&port("/dev/ttyS0", false)), "/dev/ttyS0");
    }
}
