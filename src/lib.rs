//! OWD Suite - one-way delay measurement between relay hosts.
//!
//! Every relay runs a Responder that reflects timestamped probes, one Prober
//! per peer that derives skew-corrected one-way delays from those reflections,
//! and a Reporter that periodically sends the per-peer median delays to a
//! central collector.
//!
//! # Usage
//!
//! Run a relay:
//! ```bash
//! owdd --name R1 --peers "R2:10.0.0.2|R3:10.0.0.3" --collector 10.0.0.100
//! ```
//!
//! Run the collector:
//! ```bash
//! owd-collector --local-port 32032
//! ```

/// Report collector.
pub mod collector;
/// Command-line configuration and validation.
pub mod configuration;
/// Skew correction, sample windows and the shared delay table.
pub mod estimator;
/// Probe packet structures and serialization.
pub mod packets;
/// Peer registry.
pub mod peers;
/// Per-peer probing state machine.
pub mod prober;
/// Report format and scheduler.
pub mod report;
/// Probe reflector.
pub mod responder;
/// Timestamp capture utilities.
pub mod time;
