//! Exporter library for NVIDIA GPU telemetry
//!
//! This crate provides the core functionality for:
//! - DCGM entity discovery and field watches
//! - Metric collection, raw and windowed
//! - Kubernetes pod attribution via the kubelet pod-resources API
//! - Prometheus text exposition over HTTP

pub mod collector;
pub mod counters;
pub mod dcgm;
pub mod devices;
pub mod error;
pub mod kubernetes;
pub mod pipeline;
pub mod planner;
pub mod render;
pub mod server;
pub mod transform;

pub use collector::{Collector, CollectorConfig, Metric, Snapshot};
pub use counters::{CounterSet, ExporterCounter};
pub use error::{ExporterError, Result};
pub use pipeline::Pipeline;
pub use server::{MetricsState, ServerOptions};
