//! # accel-adapter-nic
//!
//! Network adapter device client for the accelerator telemetry exporter.
//!
//! Adapters are reported as a three-level graph (device, station, port)
//! through three independent control-plane calls. The client joins them in
//! memory and exports per-port counters. Adapters carry no health state.

pub mod client;
pub mod fields;

pub use client::{join_ports, NicClient, PortView};
pub use fields::{NIC_NODES_TOTAL, PORT_FIELDS};
