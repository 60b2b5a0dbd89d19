use opencv::core::{self, Mat, Point, Rect, Scalar};
use opencv::imgproc;
use opencv::prelude::*;

use crate::detection::{DetectionResult, FaceAnalysis};
use crate::frame::Frame;
use crate::geometry::DisplayGeometry;

/// Something detection boxes can be drawn on.
pub trait OverlaySurface: Send + 'static {
    fn dimensions(&self) -> DisplayGeometry;

    fn resize(&mut self, geometry: DisplayGeometry) -> anyhow::Result<()>;

    /// Wipe the whole surface back to transparent.
    fn clear(&mut self) -> anyhow::Result<()>;

    fn draw_face(&mut self, face: &FaceAnalysis) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OverlayRenderer;

impl OverlayRenderer {
    /// Draw `result` on a freshly cleared surface of `geometry`, rescaling
    /// the boxes when the result is still in model coordinates. No result
    /// leaves the surface empty.
    pub fn render<S: OverlaySurface + ?Sized>(
        &self,
        surface: &mut S,
        geometry: DisplayGeometry,
        result: Option<&DetectionResult>,
    ) -> anyhow::Result<()> {
        if surface.dimensions() != geometry {
            surface.resize(geometry)?;
        }
        surface.clear()?;

        let Some(result) = result else {
            return Ok(());
        };
        if result.input_size != geometry {
            return self.draw(surface, &result.rescaled(geometry));
        }
        self.draw(surface, result)
    }

    fn draw<S: OverlaySurface + ?Sized>(
        &self,
        surface: &mut S,
        result: &DetectionResult,
    ) -> anyhow::Result<()> {
        for face in &result.faces {
            surface.draw_face(face)?;
        }
        Ok(())
    }
}

/// Transparent BGRA canvas the size of the video.
pub struct MatCanvas {
    mat: Mat,
    labels: bool,
}

impl MatCanvas {
    pub fn new(geometry: DisplayGeometry) -> anyhow::Result<Self> {
        Ok(Self {
            mat: transparent(geometry)?,
            labels: true,
        })
    }

    pub fn without_labels(mut self) -> Self {
        self.labels = false;
        self
    }

    pub fn mat(&self) -> &Mat {
        &self.mat
    }

    /// Copy every drawn pixel onto `frame`, which must be BGR8 at canvas size.
    pub fn composite_onto(&self, frame: &mut Mat) -> anyhow::Result<()> {
        if frame.size()? != self.mat.size()? {
            anyhow::bail!("canvas and frame sizes differ");
        }
        let mut alpha = Mat::default();
        core::extract_channel(&self.mat, &mut alpha, 3)?;
        let mut bgr = Mat::default();
        imgproc::cvt_color_def(&self.mat, &mut bgr, imgproc::COLOR_BGRA2BGR)?;
        bgr.copy_to_masked(frame, &alpha)?;
        Ok(())
    }

    /// `frame` with the overlay on top, or `None` while the canvas is sized
    /// for another resolution.
    pub fn preview(&self, frame: &Frame) -> anyhow::Result<Option<Mat>> {
        if self.dimensions() != frame.geometry() {
            return Ok(None);
        }
        let mut preview = frame.to_mat()?;
        self.composite_onto(&mut preview)?;
        Ok(Some(preview))
    }
}

fn transparent(geometry: DisplayGeometry) -> anyhow::Result<Mat> {
    let size = core::Size::new(geometry.width as i32, geometry.height as i32);
    Ok(Mat::zeros_size(size, core::CV_8UC4)?.to_mat()?)
}

const BOX_COLOR: (f64, f64, f64) = (255.0, 128.0, 0.0);

impl OverlaySurface for MatCanvas {
    fn dimensions(&self) -> DisplayGeometry {
        let size = self.mat.size().unwrap_or_default();
        DisplayGeometry::new(size.width.max(0) as u32, size.height.max(0) as u32)
    }

    fn resize(&mut self, geometry: DisplayGeometry) -> anyhow::Result<()> {
        self.mat = transparent(geometry)?;
        Ok(())
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        self.mat = transparent(self.dimensions())?;
        Ok(())
    }

    fn draw_face(&mut self, face: &FaceAnalysis) -> anyhow::Result<()> {
        let DisplayGeometry { width, height } = self.dimensions();
        let Some(bbox) = face.bbox.clamped(width, height) else {
            return Ok(());
        };
        let color = Scalar::new(BOX_COLOR.0, BOX_COLOR.1, BOX_COLOR.2, 255.0);
        let rect = Rect::new(
            bbox.x.round() as i32,
            bbox.y.round() as i32,
            bbox.width.round() as i32,
            bbox.height.round() as i32,
        );
        imgproc::rectangle(&mut self.mat, rect, color, 2, imgproc::LINE_8, 0)?;

        if self.labels {
            let label = format!("{:.2}", face.score);
            let origin = Point::new(rect.x, (rect.y - 6).max(12));
            imgproc::put_text(
                &mut self.mat,
                &label,
                origin,
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                color,
                1,
                imgproc::LINE_8,
                false,
            )?;
        }
        Ok(())
    }
}
