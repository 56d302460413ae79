// Copyright 2026 Locator Harvest Contributors
// SPDX-License-Identifier: Apache-2.0

//! Adaptive store-locator harvester.
//!
//! Discovers how a site's location search works (locator page, form,
//! result cards), runs that search for every query key in bounded
//! parallel, validates the first outcome per site and extracts
//! deduplicated records.

pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod extraction;
pub mod fetch;
pub mod harvest;
pub mod inference;
pub mod inputs;
pub mod interaction;
pub mod orchestrator;
pub mod output;
pub mod progress;
pub mod records;
pub mod renderer;
pub mod settings;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod validation;
