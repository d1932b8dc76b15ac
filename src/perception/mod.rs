//! Perception - turning frames into observations
//!
//! The matcher and the text recognizer both read the same immutable
//! [`Frame`](crate::capture::Frame) and never share mutable state, so the
//! control loop runs them side by side.

pub mod aggregate;
pub mod geometry;
pub mod matcher;
pub mod motion;
pub mod text;

pub use aggregate::{aggregate, Facets, Observation};
pub use geometry::Rect;
pub use matcher::{
    MatchError, MatchResult, Matcher, NormalizedCrossCorrelation, OverlapPolicy, ScoreMap, SimilaritySearch,
    Template,
};
pub use motion::Fingerprint;
pub use text::{NoOcr, OcrBackend, OcrError, RawText, Rotation, TesseractCli, TextRecognizer, TextRegion, TextSpan};
