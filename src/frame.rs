use anyhow::bail;
use opencv::core::{self, Mat, Scalar};
use opencv::prelude::*;

use crate::geometry::DisplayGeometry;

/// A single captured video frame, packed BGR8.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            data,
        }
    }

    /// Black frame, mostly useful for tests and placeholders.
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(width, height, vec![0; width as usize * height as usize * 3])
    }

    pub fn geometry(&self) -> DisplayGeometry {
        DisplayGeometry::new(self.width, self.height)
    }

    pub fn from_mat(mat: &Mat) -> anyhow::Result<Self> {
        if mat.typ() != core::CV_8UC3 {
            bail!("expected BGR8 frame, got mat type {}", mat.typ());
        }
        let size = mat.size()?;
        let data = if mat.is_continuous() {
            mat.data_bytes()?.to_vec()
        } else {
            mat.try_clone()?.data_bytes()?.to_vec()
        };
        Ok(Self::new(size.width as u32, size.height as u32, data))
    }

    pub fn to_mat(&self) -> anyhow::Result<Mat> {
        let expected = self.width as usize * self.height as usize * 3;
        if self.data.len() != expected {
            bail!(
                "frame buffer has {} bytes, expected {} for {}x{}",
                self.data.len(),
                expected,
                self.width,
                self.height
            );
        }
        let mut mat = Mat::new_rows_cols_with_default(
            self.height as i32,
            self.width as i32,
            core::CV_8UC3,
            Scalar::all(0.0),
        )?;
        mat.data_bytes_mut()?.copy_from_slice(&self.data);
        Ok(mat)
    }
}
