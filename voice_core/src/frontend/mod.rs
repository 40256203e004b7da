//! Signal-processing frontend: framing, mel analysis, normalization and inversion.

mod griffin_lim;
mod mel;
mod resample;
mod signal;

pub use griffin_lim::GriffinLimConfig;
pub use mel::{FeatureFrontend, FeatureScale, MelConfig};
pub use resample::resample;
pub use signal::{normalize_volume, trim_long_silences, validate_samples, VadConfig};
