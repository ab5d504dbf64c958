//! # portal-core
//!
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use anyhow;
pub use muxer;
pub use tls_peek;
pub use tokio;
pub use tracing;

pub mod bridge;
pub mod config;
pub mod gate;
pub mod hub;
pub mod lease;
pub mod metrics;
pub mod prelude;
pub mod router;
pub mod settings;
