//! OpenCV backed inference.
//!
//! The detector is either a DNN producing SSD style rows
//! `[image, label, confidence, x1, y1, x2, y2]` in normalized coordinates, or a
//! Haar cascade. The expression classifier returns one logit per label and the
//! age/gender net returns an age scalar plus optional gender probabilities.

use std::sync::Mutex;

use anyhow::{anyhow, bail, Context};
use opencv::core::{self, Mat, Rect, Scalar, Size, Vector};
use opencv::prelude::*;
use opencv::{dnn, imgproc, objdetect, types};
use tracing::trace;

use crate::detection::{DetectionResult, Expressions, FaceAnalysis, Gender};
use crate::frame::Frame;
use crate::geometry::{BoundingBox, DisplayGeometry};
use crate::models::{
    InferenceBackend, ModelArtifact, ModelFormat, ModelKind, ModelManifest, ModelSet,
};

pub const DEFAULT_EXPRESSION_LABELS: [&str; 7] = [
    "neutral",
    "happy",
    "sad",
    "angry",
    "fearful",
    "disgusted",
    "surprised",
];

enum Engine {
    Net(dnn::Net),
    Cascade(objdetect::CascadeClassifier),
}

pub struct DnnModel {
    kind: ModelKind,
    manifest: ModelManifest,
    engine: Mutex<Engine>,
}

impl DnnModel {
    fn input_size(&self) -> Size {
        Size::new(
            self.manifest.input_width as i32,
            self.manifest.input_height as i32,
        )
    }

    fn geometry(&self) -> DisplayGeometry {
        DisplayGeometry::new(self.manifest.input_width, self.manifest.input_height)
    }

    fn blob(&self, image: &Mat) -> anyhow::Result<Mat> {
        let input = if self.manifest.grayscale {
            convert_to_grayscale(image)?
        } else {
            image.try_clone()?
        };
        let [m0, m1, m2] = self.manifest.mean;
        let blob = dnn::blob_from_image(
            &input,
            self.manifest.scale,
            self.input_size(),
            Scalar::new(m0, m1, m2, 0.0),
            self.manifest.swap_rb,
            false,
            core::CV_32F,
        )?;
        Ok(blob)
    }

    /// Run a net over `image` and return every output as a flat vector.
    fn forward(&self, image: &Mat) -> anyhow::Result<Vec<Vec<f32>>> {
        let blob = self.blob(image)?;
        let mut engine = self
            .engine
            .lock()
            .map_err(|_| anyhow!("{} engine lock poisoned", self.kind))?;
        let Engine::Net(net) = &mut *engine else {
            bail!("{} is not a DNN model", self.kind);
        };
        net.set_input(&blob, "", 1.0, Scalar::default())?;
        let names = net.get_unconnected_out_layers_names()?;
        let mut outputs: Vector<Mat> = Vector::new();
        net.forward(&mut outputs, &names)?;

        let mut flat = Vec::with_capacity(outputs.len());
        for output in &outputs {
            flat.push(output.data_typed::<f32>()?.to_vec());
        }
        Ok(flat)
    }
}

/// Inference backend built on `opencv::dnn` and `opencv::objdetect`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DnnBackend;

impl InferenceBackend for DnnBackend {
    type Model = DnnModel;

    fn load(&self, artifact: &ModelArtifact) -> anyhow::Result<DnnModel> {
        let engine = match artifact.manifest.format {
            ModelFormat::Onnx => {
                let weights = artifact.read_weights()?;
                let buffer: Vector<u8> = Vector::from_slice(&weights);
                let net = dnn::read_net_from_onnx_buffer(&buffer)
                    .with_context(|| format!("reading {} network", artifact.kind))?;
                Engine::Net(net)
            }
            ModelFormat::Cascade => {
                if artifact.kind != ModelKind::FaceDetector {
                    bail!("cascade format is only supported for the face detector");
                }
                let path = artifact.shards[0].to_string_lossy().into_owned();
                let classifier = objdetect::CascadeClassifier::new(&path)?;
                if classifier.empty()? {
                    bail!("cascade {} is empty", path);
                }
                Engine::Cascade(classifier)
            }
        };
        Ok(DnnModel {
            kind: artifact.kind,
            manifest: artifact.manifest.clone(),
            engine: Mutex::new(engine),
        })
    }

    fn analyze(
        &self,
        models: &ModelSet<DnnModel>,
        frame: &Frame,
    ) -> anyhow::Result<DetectionResult> {
        let image = frame.to_mat()?;
        let input_size = models.detector.geometry();
        let boxes = detect_faces(&models.detector, &image)?;
        trace!(faces = boxes.len(), "detector pass");

        let (to_frame_x, to_frame_y) = frame.geometry().scale_from(input_size);
        let mut faces = Vec::with_capacity(boxes.len());
        for (bbox, score) in boxes {
            let Some(region) = bbox
                .scaled(to_frame_x, to_frame_y)
                .clamped(frame.width, frame.height)
            else {
                continue;
            };
            let rect = Rect::new(
                region.x as i32,
                region.y as i32,
                (region.width as i32).max(1),
                (region.height as i32).max(1),
            );
            let face = Mat::roi(&image, rect)?.try_clone()?;

            let expressions = classify_expressions(&models.expressions, &face)?;
            let (age, gender) = estimate_age_gender(&models.age_gender, &face)?;
            faces.push(FaceAnalysis {
                bbox,
                score,
                age,
                gender,
                expressions,
            });
        }

        Ok(DetectionResult { input_size, faces })
    }
}

/// Boxes in detector input coordinates with their confidence.
fn detect_faces(detector: &DnnModel, image: &Mat) -> anyhow::Result<Vec<(BoundingBox, f32)>> {
    let is_cascade = {
        let engine = detector
            .engine
            .lock()
            .map_err(|_| anyhow!("detector engine lock poisoned"))?;
        matches!(&*engine, Engine::Cascade(_))
    };
    if is_cascade {
        return detect_with_cascade(detector, image);
    }

    let rows = detector
        .forward(image)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("detector produced no output"))?;
    let (width, height) = (
        detector.manifest.input_width as f32,
        detector.manifest.input_height as f32,
    );
    Ok(rows
        .chunks_exact(7)
        .filter(|row| row[2] >= detector.manifest.threshold)
        .map(|row| {
            let (x1, y1) = (row[3] * width, row[4] * height);
            let (x2, y2) = (row[5] * width, row[6] * height);
            (BoundingBox::new(x1, y1, x2 - x1, y2 - y1), row[2])
        })
        .collect())
}

fn detect_with_cascade(
    detector: &DnnModel,
    image: &Mat,
) -> anyhow::Result<Vec<(BoundingBox, f32)>> {
    let mut reduced = Mat::default();
    imgproc::resize(
        image,
        &mut reduced,
        detector.input_size(),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;
    let gray = convert_to_grayscale(&reduced)?;

    let mut engine = detector
        .engine
        .lock()
        .map_err(|_| anyhow!("detector engine lock poisoned"))?;
    let Engine::Cascade(classifier) = &mut *engine else {
        bail!("detector is not a cascade");
    };

    let mut faces = types::VectorOfRect::new();
    classifier.detect_multi_scale(
        &gray,
        &mut faces,
        1.1,
        2,
        objdetect::CASCADE_SCALE_IMAGE,
        Size::new(30, 30),
        Size::new(0, 0),
    )?;

    Ok(faces
        .iter()
        .map(|face| {
            (
                BoundingBox::new(
                    face.x as f32,
                    face.y as f32,
                    face.width as f32,
                    face.height as f32,
                ),
                1.0,
            )
        })
        .collect())
}

fn classify_expressions(model: &DnnModel, face: &Mat) -> anyhow::Result<Expressions> {
    let logits = model
        .forward(face)?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("expression classifier produced no output"))?;
    if model.manifest.labels.is_empty() {
        Ok(Expressions::from_logits(DEFAULT_EXPRESSION_LABELS, &logits))
    } else {
        Ok(Expressions::from_logits(
            model.manifest.labels.iter().map(String::as_str),
            &logits,
        ))
    }
}

fn estimate_age_gender(model: &DnnModel, face: &Mat) -> anyhow::Result<(f32, Option<Gender>)> {
    let outputs = model.forward(face)?;
    let age = outputs
        .first()
        .and_then(|age| age.first())
        .copied()
        .ok_or_else(|| anyhow!("age estimator produced no age"))?;
    let gender = outputs.get(1).and_then(|probabilities| match probabilities.as_slice() {
        [male] => Some(if *male >= 0.5 { Gender::Male } else { Gender::Female }),
        [male, female, ..] => Some(if male >= female { Gender::Male } else { Gender::Female }),
        [] => None,
    });
    Ok((age, gender))
}

pub fn convert_to_grayscale(image: &Mat) -> anyhow::Result<Mat> {
    let mut gray: Mat = Mat::default();
    imgproc::cvt_color_def(&image, &mut gray, imgproc::COLOR_BGR2GRAY)?;
    Ok(gray)
}
