//! Nearest-neighbour face matching over a gallery of identities.
//!
//! Every stored embedding of every identity is a candidate. Candidates are
//! visited in gallery order, then embedding order within an identity; that
//! order is what breaks exact distance ties.

use crate::types::{Embedding, FaceBox, Identity};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default maximum Euclidean distance accepted as a match.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.47;

/// Name reported for a face that matched nobody.
pub const UNKNOWN_NAME: &str = "Unknown";

#[derive(Error, Debug, PartialEq)]
pub enum MatchError {
    #[error(
        "embedding dimension mismatch: probe has {probe} values but an embedding stored for \
         {owner:?} has {stored}; the gallery was built with a different embedder"
    )]
    DimensionMismatch {
        probe: usize,
        stored: usize,
        owner: String,
    },
    #[error(
        "distance to an embedding stored for {owner:?} is not a number; \
         the probe or the gallery holds NaN values"
    )]
    NotANumber { owner: String },
}

/// Outcome of matching one probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Owner of the accepted candidate, if any.
    pub identity: Option<String>,
    /// Distance to the best candidate. `None` only for an empty gallery.
    pub distance: Option<f32>,
    /// `1 - distance` rounded to three decimals, present only on a match.
    pub confidence: Option<f32>,
}

impl MatchResult {
    fn unmatched(distance: Option<f32>) -> Self {
        Self {
            identity: None,
            distance,
            confidence: None,
        }
    }

    fn matched(owner: &str, distance: f32) -> Self {
        Self {
            identity: Some(owner.to_string()),
            distance: Some(distance),
            confidence: Some(confidence(distance)),
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }

    /// Matched identity name, or [`UNKNOWN_NAME`].
    pub fn display_name(&self) -> &str {
        self.identity.as_deref().unwrap_or(UNKNOWN_NAME)
    }
}

/// Per-face recognition result as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub name: String,
    #[serde(rename = "box")]
    pub bbox: FaceBox,
    pub confidence: Option<f32>,
}

impl FaceMatch {
    pub fn new(result: &MatchResult, bbox: FaceBox) -> Self {
        Self {
            name: result.display_name().to_string(),
            bbox,
            confidence: result.confidence,
        }
    }
}

/// Confidence score for an accepted distance.
///
/// Clamped to [0, 1]: thresholds above 1.0 would otherwise report a
/// negative confidence for distant matches.
pub fn confidence(distance: f32) -> f32 {
    let raw = ((1.0 - f64::from(distance)) * 1000.0).round() / 1000.0;
    raw.clamp(0.0, 1.0) as f32
}

/// One stored embedding together with the identity that owns it.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub owner: &'a str,
    pub embedding: &'a Embedding,
}

/// Flatten a gallery into candidates, preserving gallery then embedding order.
pub fn candidates(gallery: &[Identity]) -> impl Iterator<Item = Candidate<'_>> {
    gallery.iter().flat_map(|identity| {
        identity.embeddings.iter().map(move |embedding| Candidate {
            owner: identity.name.as_str(),
            embedding,
        })
    })
}

fn distance_to(probe: &Embedding, candidate: &Candidate<'_>) -> Result<f32, MatchError> {
    let distance = probe
        .euclidean_distance(candidate.embedding)
        .ok_or_else(|| MatchError::DimensionMismatch {
            probe: probe.dimension(),
            stored: candidate.embedding.dimension(),
            owner: candidate.owner.to_string(),
        })?;
    if distance.is_nan() {
        return Err(MatchError::NotANumber {
            owner: candidate.owner.to_string(),
        });
    }
    Ok(distance)
}

/// Strategy for comparing a probe embedding against a gallery of identities.
pub trait Matcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[Identity],
        threshold: f32,
    ) -> Result<MatchResult, MatchError>;
}

/// Global nearest neighbour: the closest candidate wins if it is strictly
/// closer than the threshold.
///
/// Always scans the whole gallery so that a dimension mismatch anywhere is
/// reported rather than masked by an earlier match.
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[Identity],
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        let mut best: Option<(Candidate<'_>, f32)> = None;

        for candidate in candidates(gallery) {
            let distance = distance_to(probe, &candidate)?;
            // Strict `<` keeps the first-seen candidate on ties.
            let closer = best.map_or(true, |(_, best_distance)| distance < best_distance);
            if closer {
                best = Some((candidate, distance));
            }
        }

        Ok(match best {
            Some((winner, distance)) if distance < threshold => {
                MatchResult::matched(winner.owner, distance)
            }
            Some((_, distance)) => MatchResult::unmatched(Some(distance)),
            None => MatchResult::unmatched(None),
        })
    }
}

/// First acceptable candidate in registration order, with an inclusive
/// tolerance. Compatible with boolean per-face comparison lists where the
/// earliest `true` wins, even if a later candidate is closer.
///
/// Like [`EuclideanMatcher`] it visits every candidate, so a bad embedding
/// after the winner is still reported.
pub struct FirstWithinMatcher;

impl Matcher for FirstWithinMatcher {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[Identity],
        tolerance: f32,
    ) -> Result<MatchResult, MatchError> {
        let mut first: Option<(Candidate<'_>, f32)> = None;
        let mut closest: Option<f32> = None;

        for candidate in candidates(gallery) {
            let distance = distance_to(probe, &candidate)?;
            if first.is_none() && distance <= tolerance {
                first = Some((candidate, distance));
            }
            if closest.map_or(true, |c| distance < c) {
                closest = Some(distance);
            }
        }

        Ok(match first {
            Some((winner, distance)) => MatchResult::matched(winner.owner, distance),
            None => MatchResult::unmatched(closest),
        })
    }
}

/// Matching policy selected by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// [`EuclideanMatcher`].
    #[default]
    Nearest,
    /// [`FirstWithinMatcher`].
    First,
}

impl Matcher for MatchPolicy {
    fn compare(
        &self,
        probe: &Embedding,
        gallery: &[Identity],
        threshold: f32,
    ) -> Result<MatchResult, MatchError> {
        match self {
            MatchPolicy::Nearest => EuclideanMatcher.compare(probe, gallery, threshold),
            MatchPolicy::First => FirstWithinMatcher.compare(probe, gallery, threshold),
        }
    }
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(MatchPolicy::Nearest),
            "first" => Ok(MatchPolicy::First),
            other => Err(format!("unknown match policy {other:?} (expected nearest or first)")),
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchPolicy::Nearest => "nearest",
            MatchPolicy::First => "first",
        })
    }
}
