use std::collections::BTreeMap;

use serde::Serialize;

use crate::geometry::{BoundingBox, DisplayGeometry};

/// Per-emotion probabilities for one face, keyed by expression name.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Expressions(BTreeMap<String, f32>);

impl Expressions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Probability for `name`, zero when the classifier doesn't know it.
    pub fn get(&self, name: &str) -> f32 {
        self.0.get(name).copied().unwrap_or_default()
    }

    /// Probability for `name`, `None` when the classifier has no such label.
    pub fn probability(&self, name: &str) -> Option<f32> {
        self.0.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, probability: f32) {
        self.0.insert(name.into(), probability.clamp(0.0, 1.0));
    }

    pub fn dominant(&self) -> Option<(&str, f32)> {
        self.0
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(name, p)| (name.as_str(), *p))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.0.iter().map(|(name, p)| (name.as_str(), *p))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Turn raw classifier logits into probabilities.
    pub fn from_logits<'a>(labels: impl IntoIterator<Item = &'a str>, logits: &[f32]) -> Self {
        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let sum: f32 = exps.iter().sum();
        let mut expressions = Self::new();
        if sum <= 0.0 || !sum.is_finite() {
            return expressions;
        }
        for (label, e) in labels.into_iter().zip(exps) {
            expressions.insert(label, e / sum);
        }
        expressions
    }
}

impl<K: Into<String>> FromIterator<(K, f32)> for Expressions {
    fn from_iter<T: IntoIterator<Item = (K, f32)>>(iter: T) -> Self {
        let mut expressions = Self::new();
        for (name, p) in iter {
            expressions.insert(name, p);
        }
        expressions
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

/// Everything the models said about one face.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FaceAnalysis {
    pub bbox: BoundingBox,
    pub score: f32,
    pub age: f32,
    pub gender: Option<Gender>,
    pub expressions: Expressions,
}

/// Output of one tick. Boxes are in `input_size` coordinates.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct DetectionResult {
    pub input_size: DisplayGeometry,
    pub faces: Vec<FaceAnalysis>,
}

impl DetectionResult {
    pub fn empty(input_size: DisplayGeometry) -> Self {
        Self {
            input_size,
            faces: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.faces.is_empty()
    }

    /// The face the readings are taken from: the largest one in frame.
    pub fn primary(&self) -> Option<&FaceAnalysis> {
        find_largest_face(&self.faces)
    }

    /// Map every box onto `geometry`.
    pub fn rescaled(&self, geometry: DisplayGeometry) -> Self {
        let (sx, sy) = geometry.scale_from(self.input_size);
        Self {
            input_size: geometry,
            faces: self
                .faces
                .iter()
                .map(|face| FaceAnalysis {
                    bbox: face.bbox.scaled(sx, sy),
                    ..face.clone()
                })
                .collect(),
        }
    }
}

pub fn find_largest_face(faces: &[FaceAnalysis]) -> Option<&FaceAnalysis> {
    faces
        .iter()
        .max_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()))
}
