//! # yta-resilient
//!
//! Extraction and resumable download of YouTube streams, built to survive
//! the platform pushing back: throttling, challenge pages, player releases
//! and crashes halfway through a file.
//!
//! ## Usage
//!
//! The [`orchestrator::Orchestrator`] wires every component together. Jobs
//! are persisted under `state_dir`, so calling
//! [`resume_incomplete_jobs`](orchestrator::Orchestrator::resume_incomplete_jobs)
//! after a restart continues interrupted downloads where their last
//! checkpoint left off.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use yta_resilient::{config::Config, orchestrator::Orchestrator, transport::ReqwestTransport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let transport = Arc::new(ReqwestTransport::new(&config.session));
//!     let orchestrator = Orchestrator::new(config, transport).await.unwrap();
//!
//!     orchestrator.resume_incomplete_jobs().await.unwrap();
//!     let outcome = orchestrator
//!         .extract_and_download("dQw4w9WgXcQ", Some("vp9"))
//!         .await
//!         .unwrap();
//!     println!("saved to {}", outcome.path.display());
//! }
//! ```
//!
//! Failures are classified per operation class by the
//! [`breaker::CircuitBreaker`]; every response feeds the
//! [`telemetry::RiskScorer`], which can trigger identity rotation in the
//! [`session::SessionFactory`].

#![forbid(unsafe_code)]

#[macro_use]
extern crate log;

pub mod breaker;
pub mod config;
pub mod downloader;
pub mod error;
pub mod extractor;
pub mod orchestrator;
pub mod player;
pub mod player_response;
pub mod session;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;
