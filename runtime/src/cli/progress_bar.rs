//! Terminal progress bar driven by harvest events.

use crate::progress::{HarvestEventKind, ProgressReceiver};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

fn unit_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} units ({percent}%) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-")
}

/// Render events from `rx` until the run finishes or the channel closes.
///
/// The bar length is set from `RunStarted` as sites x queries.
pub fn spawn(mut rx: ProgressReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(unit_style());

        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "progress bar lagged behind events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match event.event {
                HarvestEventKind::RunStarted { sites, queries } => {
                    bar.set_length((sites * queries) as u64);
                    bar.set_message(format!("{sites} site(s)"));
                }
                HarvestEventKind::SiteStarted { site } => {
                    bar.set_message(format!("{site}: starting"));
                }
                HarvestEventKind::DiscoveryAdvanced { site, state, .. } => {
                    bar.set_message(format!("{site}: discovery {state:?}"));
                }
                HarvestEventKind::UnitCompleted { site, query, records, .. } => {
                    bar.inc(1);
                    bar.set_message(format!("{site} [{query}]: {records} record(s)"));
                }
                HarvestEventKind::UnitFailed { site, query, kind, .. } => {
                    bar.inc(1);
                    bar.set_message(format!("{site} [{query}]: {kind}"));
                }
                HarvestEventKind::SiteFinished { site, outcome, records } => {
                    bar.println(format!("  {site}: {outcome} ({records} record(s))"));
                }
                HarvestEventKind::Warning { message } => {
                    bar.println(format!("  warning: {message}"));
                }
                HarvestEventKind::RunFinished { .. } => break,
                HarvestEventKind::ValidationFinished { .. }
                | HarvestEventKind::WorkerCooldown { .. }
                | HarvestEventKind::BrowserRecycled { .. } => {}
            }
        }
        bar.finish_and_clear();
    })
}
