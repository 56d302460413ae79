// Copyright 2026 Locator Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Progress event types and broadcast channel for real-time harvest telemetry.
//!
//! The orchestrator emits `HarvestEvent`s while sites are discovered and
//! queried. They flow through a `tokio::sync::broadcast` channel to every
//! subscriber (progress bars, JSON event stream). When no subscriber
//! exists, events are silently dropped.

use crate::discovery::DiscoveryState;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A progress event emitted during a run.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestEvent {
    /// The run this event belongs to.
    pub run_id: String,
    /// Monotonically increasing sequence number.
    pub seq: u64,
    pub event: HarvestEventKind,
}

/// The specific kind of progress event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum HarvestEventKind {
    RunStarted { sites: usize, queries: usize },
    SiteStarted { site: String },
    /// A discovery transition completed.
    DiscoveryAdvanced {
        site: String,
        state: DiscoveryState,
        confidence: f32,
    },
    UnitCompleted {
        site: String,
        query: String,
        records: usize,
        attempts: u32,
        elapsed_ms: u64,
    },
    UnitFailed {
        site: String,
        query: String,
        kind: String,
        message: String,
    },
    ValidationFinished {
        site: String,
        status: String,
        rediscovered: bool,
    },
    /// A worker hit its consecutive-failure threshold and is pausing.
    WorkerCooldown {
        site: String,
        worker: usize,
        failures: u32,
        cooldown_ms: u64,
    },
    BrowserRecycled {
        site: String,
        worker: usize,
        units: u32,
    },
    SiteFinished {
        site: String,
        outcome: String,
        records: usize,
    },
    RunFinished {
        succeeded: usize,
        degraded: usize,
        failed: usize,
        records: usize,
        elapsed_ms: u64,
    },
    /// A non-fatal warning occurred.
    Warning { message: String },
}

/// Sender handle for emitting progress events.
pub type ProgressSender = tokio::sync::broadcast::Sender<HarvestEvent>;

/// Receiver handle for consuming progress events.
pub type ProgressReceiver = tokio::sync::broadcast::Receiver<HarvestEvent>;

/// Create a new progress broadcast channel with a bounded buffer.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    tokio::sync::broadcast::channel(256)
}

/// Cloneable emitter shared by every task of a run.
#[derive(Clone)]
pub struct Emitter {
    tx: Option<ProgressSender>,
    run_id: Arc<str>,
    seq: Arc<AtomicU64>,
}

impl Emitter {
    pub fn new(tx: Option<ProgressSender>, run_id: &str) -> Self {
        Self {
            tx,
            run_id: Arc::from(run_id),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    /// An emitter with no channel; every emit is a no-op.
    pub fn disabled() -> Self {
        Self::new(None, "")
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Emit an event, ignoring send errors (no receivers listening).
    pub fn emit(&self, event: HarvestEventKind) {
        if let Some(ref sender) = self.tx {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            let _ = sender.send(HarvestEvent {
                run_id: self.run_id.to_string(),
                seq,
                event,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = HarvestEvent {
            run_id: "run-1".to_string(),
            seq: 1,
            event: HarvestEventKind::DiscoveryAdvanced {
                site: "acme.com".to_string(),
                state: DiscoveryState::FormDiscovered,
                confidence: 0.8,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"DiscoveryAdvanced\""));
        assert!(json.contains("form_discovered"));
    }

    #[tokio::test]
    async fn test_emitter_sequences_events() {
        let (tx, mut rx) = channel();
        let emitter = Emitter::new(Some(tx), "run-7");
        let clone = emitter.clone();
        emitter.emit(HarvestEventKind::SiteStarted {
            site: "a.com".into(),
        });
        clone.emit(HarvestEventKind::Warning {
            message: "slow".into(),
        });
        assert_eq!(rx.recv().await.unwrap().seq, 1);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(second.run_id, "run-7");
    }

    #[test]
    fn test_emit_without_receivers() {
        let (tx, rx) = channel();
        drop(rx);
        Emitter::new(Some(tx), "x").emit(HarvestEventKind::Warning {
            message: "test".to_string(),
        });
        Emitter::disabled().emit(HarvestEventKind::Warning {
            message: "test".to_string(),
        });
    }
}
