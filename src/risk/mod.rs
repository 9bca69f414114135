//! Risk Scorer (C5): feature extraction, ML/rule blending, contextual
//! adjustment, and hysteresis-banded level classification.

pub mod scorer;

pub use scorer::{Features, MlPredictor, RiskScorer};
