//! Command implementations.
//!
//! Each subcommand is implemented in its own module for clean separation.

pub(crate) mod completions;
pub(crate) mod decode;
pub(crate) mod ports;
pub(crate) mod store;
pub(crate) mod update;

use anyhow::Result;
use serde::Serialize;

/// Print `data` to stdout inside the `{"ok": true, "data": ...}` envelope.
pub(crate) fn print_json<T: Serialize + ?Sized>(data: &T) -> Result<()> {
    let output = serde_json::json!({
        "ok": true,
        "data": data,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
