//! Output mode helpers shared by every subcommand.
//!
//! `main` records the global `--json` / `--quiet` flags in the process
//! environment before dispatching, so commands can check them without
//! threading the flags through every call.

use serde::Serialize;

pub const ENV_JSON: &str = "HARVEST_JSON";
pub const ENV_QUIET: &str = "HARVEST_QUIET";

fn flag(key: &str) -> bool {
    std::env::var(key).map(|v| v == "1").unwrap_or(false)
}

/// Machine-readable output requested.
pub fn is_json() -> bool {
    flag(ENV_JSON)
}

/// Only essential output requested.
pub fn is_quiet() -> bool {
    flag(ENV_QUIET)
}

/// Pretty-print `value` as JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("  Error: failed to serialize output: {e}"),
    }
}

/// `[OK]` / `[!!]` prefix used by status listings.
pub fn mark(ok: bool) -> &'static str {
    if ok {
        "[OK]"
    } else {
        "[!!]"
    }
}
