//! Environment readiness check.

use crate::cli::output;
use crate::cli::{open_store, SettingsArgs};
use crate::inference::OllamaClient;
use crate::renderer::chromium::find_chromium;
use anyhow::Result;
use serde::Serialize;
use std::process::Command;

#[derive(Debug, Serialize)]
struct Check {
    name: &'static str,
    ok: bool,
    detail: String,
    /// Missing this only degrades a run.
    optional: bool,
}

/// Check Chromium, the inference endpoint, the config store and memory.
pub async fn run(args: SettingsArgs) -> Result<()> {
    let settings = args.into_settings()?;
    let mut checks = Vec::new();

    let chromium = settings.chromium_path.clone().filter(|p| p.exists()).or_else(find_chromium);
    checks.push(Check {
        name: "chromium",
        ok: chromium.is_some(),
        detail: match &chromium {
            Some(path) => format!("Chromium found: {}", path.display()),
            None => "Chromium NOT found. Install Chrome or set LOCATOR_CHROMIUM_PATH.".to_string(),
        },
        optional: false,
    });

    if settings.inference.enabled {
        let client = OllamaClient::new(&settings.inference.endpoint, &settings.inference.model);
        let reachable = client.is_reachable().await;
        checks.push(Check {
            name: "inference",
            ok: reachable,
            detail: if reachable {
                format!("Inference endpoint {} ({})", client.endpoint(), settings.inference.model)
            } else {
                format!(
                    "Inference endpoint {} unreachable; discovery falls back to shipped selectors",
                    client.endpoint()
                )
            },
            optional: true,
        });
    } else {
        checks.push(Check {
            name: "inference",
            ok: true,
            detail: "Inference disabled".to_string(),
            optional: true,
        });
    }

    let store = open_store(&settings);
    checks.push(Check {
        name: "config_store",
        ok: store.is_ok(),
        detail: match &store {
            Ok(store) => format!("Config store: {}", store.root().display()),
            Err(e) => format!("Config store unusable: {e:#}"),
        },
        optional: false,
    });

    if let Some(mb) = get_available_memory_mb() {
        checks.push(Check {
            name: "memory",
            ok: mb >= 512,
            detail: if mb >= 512 {
                format!("Available memory: {mb}MB (>= 512MB per browser)")
            } else {
                format!("Available memory: {mb}MB (< 512MB, lower --workers)")
            },
            optional: true,
        });
    }

    let ready = checks.iter().all(|c| c.ok || c.optional);

    if output::is_json() {
        output::print_json(&serde_json::json!({ "ready": ready, "checks": checks }));
        return Ok(());
    }

    println!("Harvest Doctor");
    println!("==============");
    println!();
    println!("OS:   {}", std::env::consts::OS);
    println!("Arch: {}", std::env::consts::ARCH);
    println!();
    for check in &checks {
        println!("{} {}", output::mark(check.ok), check.detail);
    }
    println!();
    if ready {
        println!("Status: READY");
    } else {
        println!("Status: NOT READY");
    }
    Ok(())
}

/// Get available memory in MB (platform-specific).
fn get_available_memory_mb() -> Option<u64> {
    #[cfg(target_os = "macos")]
    {
        let output = Command::new("sysctl")
            .args(["-n", "hw.memsize"])
            .output()
            .ok()?;
        let s = String::from_utf8_lossy(&output.stdout);
        let bytes: u64 = s.trim().parse().ok()?;
        Some(bytes / 1_048_576)
    }
    #[cfg(target_os = "linux")]
    {
        let output = Command::new("free").args(["-m"]).output().ok()?;
        let s = String::from_utf8_lossy(&output.stdout);
        s.lines()
            .find(|line| line.starts_with("Mem:"))
            .and_then(|line| line.split_whitespace().nth(6))
            .and_then(|avail| avail.parse().ok())
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        None
    }
}
