//! `harvest run`: harvest every listed site for every query key.

use crate::cli::output;
use crate::cli::{build_engine, progress_bar, SettingsArgs};
use crate::inputs::{load_queries, load_site_list};
use crate::orchestrator::{Orchestrator, RunSummary};
use crate::output::raw_sinks;
use crate::progress::{self, Emitter};
use crate::renderer::chromium::{ChromiumFactory, ChromiumOptions};
use anyhow::{bail, Result};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// File listing one site homepage URL per line
    pub sites: PathBuf,

    /// Comma-separated query keys (e.g. zip codes)
    #[arg(long)]
    pub queries: Option<String>,

    /// File with one query key per line
    #[arg(long)]
    pub query_file: Option<PathBuf>,

    #[command(flatten)]
    pub settings: SettingsArgs,
}

/// Run the harvest and return the process exit code.
pub async fn run(args: RunArgs) -> Result<i32> {
    let settings = args.settings.into_settings()?;
    let sites = load_site_list(&args.sites)?;
    if sites.is_empty() {
        bail!("no usable sites in {}", args.sites.display());
    }
    let queries = load_queries(args.queries.as_deref(), args.query_file.as_deref())?;

    let engine = build_engine(&settings)?;
    let factory = Arc::new(ChromiumFactory::new(ChromiumOptions {
        executable: settings.chromium_path.clone(),
        headless: settings.headless,
        ..ChromiumOptions::default()
    }));
    let sink = Arc::new(raw_sinks(&settings.output_dir.join("raw"))?);

    let run_id = format!("run-{}", uuid::Uuid::new_v4());
    let show_bar = !output::is_json() && !output::is_quiet();
    let (tx, rx) = progress::channel();
    let bar = show_bar.then(|| progress_bar::spawn(rx));
    let emitter = Emitter::new(Some(tx), &run_id);

    let orchestrator = Orchestrator::new(settings, engine, factory, sink).with_emitter(emitter);
    let summary = orchestrator.run(&sites, &queries).await;
    // The orchestrator owns the last sender; dropping it closes the channel.
    drop(orchestrator);
    if let Some(bar) = bar {
        let _ = bar.await;
    }

    if output::is_json() {
        output::print_json(&summary);
    } else if !output::is_quiet() {
        print_summary(&summary);
    }
    Ok(summary.exit_code())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("Run {} finished in {:.1}s", summary.run_id, summary.elapsed_ms as f64 / 1000.0);
    println!();
    for site in &summary.sites {
        println!(
            "  {:<9} {:<40} {:>5} record(s)  {}/{} unit(s) failed",
            site.outcome.as_str(),
            site.site,
            site.records,
            site.failed_units,
            site.units
        );
        if let Some(out) = &site.output {
            println!("            {}", out.csv.display());
        }
        if let Some(error) = &site.error {
            println!("            {error}");
        }
    }
    println!();
    println!(
        "  {} succeeded, {} degraded, {} failed, {} record(s)",
        summary.succeeded(),
        summary.degraded(),
        summary.failed(),
        summary.total_records()
    );
}
