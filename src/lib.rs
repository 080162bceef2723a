//! scspawn - A spawn server for stream-cache rendering workers
//!
//! This library runs a bounded pool of short-lived worker processes, one per
//! remote viewer session:
//! - Admits spawn requests against a fixed worker count and port range
//! - Balances server-side rendering workers across GPUs
//! - Reaps workers that stop reporting liveliness or never see a viewer
//! - Optionally relaunches workers into the interactive session (Windows)
//! - Fronts all worker ports with one public port for REST and WebSocket relay

pub mod api;
pub mod config;
pub mod error;
pub mod gpu;
pub mod launcher;
pub mod logging;
pub mod monitor;
pub mod ports;
pub mod proxy;
pub mod slot;
pub mod spawner;
