//! Run parameters.
//!
//! This module provides:
//! - Algorithm enums and the `qsm_reference` forms
//! - Fully resolved `RunParameters` and the overlayable `PartialRunParameters`
//! - The premade table
//! - `ParameterResolver`, which applies defaults, coercions and downgrades
//! - `Settings` and the persisted settings file

mod algorithms;
mod parameters;
mod premade;
mod resolver;
mod settings;

pub use algorithms::{
    BfAlgorithm, FillingAlgorithm, MaskingAlgorithm, MaskingInput, QsmAlgorithm, QsmReference,
    ThresholdAlgorithm, UnwrappingAlgorithm,
};
pub use parameters::{PartialRunParameters, RunParameters};
pub use premade::{premade, PREMADE_NAMES};
pub use resolver::{Downgrade, DowngradeKind, InputDescriptors, ParameterResolver, Resolution};
pub use settings::{PersistedSettings, Settings, SETTINGS_FILE};
