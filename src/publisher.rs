use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::detection::{Expressions, FaceAnalysis};

/// What the UI shows. Both fields are `None` while no face is in view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgeReading {
    pub age: Option<u32>,
    pub stress_percent: Option<u32>,
}

/// Derives a stress probability in `[0, 1]` from the expression scores.
pub trait StressProjection: Send + Sync + 'static {
    fn stress(&self, expressions: &Expressions) -> Option<f32>;
}

/// Uses a single expression's probability as the stress level.
#[derive(Debug)]
pub struct ExpressionStress {
    expression: String,
    warned: AtomicBool,
}

impl ExpressionStress {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            warned: AtomicBool::new(false),
        }
    }
}

impl Default for ExpressionStress {
    fn default() -> Self {
        Self::new("sad")
    }
}

impl StressProjection for ExpressionStress {
    fn stress(&self, expressions: &Expressions) -> Option<f32> {
        if expressions.is_empty() {
            return None;
        }
        let probability = expressions.probability(&self.expression);
        if probability.is_none() && !self.warned.swap(true, Ordering::Relaxed) {
            let known: Vec<&str> = expressions.iter().map(|(name, _)| name).collect();
            warn!(
                expression = %self.expression,
                ?known,
                "stress expression is not produced by the classifier"
            );
        }
        probability
    }
}

impl<F> StressProjection for F
where
    F: Fn(&Expressions) -> Option<f32> + Send + Sync + 'static,
{
    fn stress(&self, expressions: &Expressions) -> Option<f32> {
        self(expressions)
    }
}

pub struct ResultPublisher {
    projection: Box<dyn StressProjection>,
    sender: watch::Sender<AgeReading>,
}

impl ResultPublisher {
    pub fn new(projection: impl StressProjection) -> Self {
        let (sender, _) = watch::channel(AgeReading::default());
        Self {
            projection: Box::new(projection),
            sender,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<AgeReading> {
        self.sender.subscribe()
    }

    pub fn latest(&self) -> AgeReading {
        *self.sender.borrow()
    }

    pub fn project(&self, face: Option<&FaceAnalysis>) -> AgeReading {
        let Some(face) = face else {
            return AgeReading::default();
        };
        let age = (face.age.is_finite() && face.age > 0.0).then(|| face.age.round() as u32);
        let stress_percent = self
            .projection
            .stress(&face.expressions)
            .filter(|p| p.is_finite())
            .map(|p| (p.clamp(0.0, 1.0) * 100.0).round() as u32);
        AgeReading {
            age,
            stress_percent,
        }
    }

    /// Replace the latest reading. Subscribers only hear about actual changes.
    pub fn publish(&self, face: Option<&FaceAnalysis>) -> AgeReading {
        let reading = self.project(face);
        self.sender.send_if_modified(|current| {
            if *current == reading {
                return false;
            }
            debug!(age = ?reading.age, stress = ?reading.stress_percent, "reading changed");
            *current = reading;
            true
        });
        reading
    }

    pub fn clear(&self) {
        self.publish(None);
    }
}

impl Default for ResultPublisher {
    fn default() -> Self {
        Self::new(ExpressionStress::default())
    }
}
