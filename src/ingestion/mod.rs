pub mod attestation;
pub mod normalizer;

pub use normalizer::{NormalizeOutcome, Normalizer, NormalizerConfig, SkipReason};
