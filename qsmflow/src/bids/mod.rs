//! BIDS input discovery.
//!
//! This module provides:
//! - Filename entity parsing
//! - JSON sidecar reading (`EchoTime`, `MagneticFieldStrength`)
//! - Volume header geometry behind the `HeaderReader` seam
//! - `RunDiscoverer`, which turns a BIDS tree into reconstruction units

mod discover;
mod entities;
mod header;
mod sidecar;
mod unit;

pub use discover::{magnitude_path, DiscoveryFilters, RunDiscoverer};
pub use entities::{is_phase_file, BidsEntities};
pub use header::{HeaderReader, InMemoryHeaderReader, NiftiHeaderReader, VolumeHeader};
pub use sidecar::{sidecar_path, Sidecar};
pub use unit::ReconstructionUnit;
