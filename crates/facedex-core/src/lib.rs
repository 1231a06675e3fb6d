//! facedex-core: face matching and embedding engine.
//!
//! Matches unknown face embeddings against a gallery of named identities
//! by Euclidean nearest neighbour. Ships an ONNX-backed embedder that uses
//! SCRFD for face detection and ArcFace for embedding extraction.

pub mod alignment;
pub mod detector;
pub mod embedder;
pub mod matcher;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use detector::FaceDetector;
pub use embedder::{decode_image, EmbedError, Embedder, OnnxEmbedder};
pub use matcher::{
    EuclideanMatcher, FaceMatch, FirstWithinMatcher, MatchError, MatchPolicy, MatchResult,
    Matcher, DEFAULT_MATCH_THRESHOLD, UNKNOWN_NAME,
};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, Detection, Embedding, FaceBox, Identity};

/// Default directory holding `det_10g.onnx` and `w600k_r50.onnx`.
///
/// `$XDG_DATA_HOME/facedex/models`, falling back to `~/.local/share/facedex/models`.
pub fn default_model_dir() -> PathBuf {
    data_home().join("facedex").join("models")
}

/// `$XDG_DATA_HOME`, or `$HOME/.local/share` when unset.
pub fn data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
}
