//! 8-bit grayscale frames carried as binary PGM (`P5`) payloads.

use crate::error::PluginError;

/// Value of the camera's `image_format` field.
pub const FORMAT: &str = "PGM";

/// Row-major 8-bit grayscale image.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Columns.
    pub width: usize,
    /// Rows.
    pub height: usize,
    /// `width * height` intensities, top row first.
    pub pixels: Vec<u8>,
}

impl Frame {
    /// An all-black frame.
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width * height],
        }
    }

    /// Set one pixel; coordinates outside the frame are ignored.
    pub fn set(&mut self, x: usize, y: usize, value: u8) {
        if x < self.width && y < self.height {
            self.pixels[y * self.width + x] = value;
        }
    }

    /// One pixel. Panics outside the frame.
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.pixels[y * self.width + x]
    }

    /// Outline of the rectangle spanning `(x0, y0)..=(x1, y1)`, clipped.
    pub fn outline(&mut self, (x0, y0): (usize, usize), (x1, y1): (usize, usize), value: u8) {
        for x in x0..=x1 {
            self.set(x, y0, value);
            self.set(x, y1, value);
        }
        for y in y0..=y1 {
            self.set(x0, y, value);
            self.set(x1, y, value);
        }
    }

    /// Mean and population standard deviation of the pixel values.
    pub fn intensity(&self) -> (f64, f64) {
        if self.pixels.is_empty() {
            return (0.0, 0.0);
        }
        let n = self.pixels.len() as f64;
        let mean = self.pixels.iter().map(|&p| p as f64).sum::<f64>() / n;
        let variance = self
            .pixels
            .iter()
            .map(|&p| (p as f64 - mean).powi(2))
            .sum::<f64>()
            / n;
        (mean, variance.sqrt())
    }

    /// Encode as binary PGM.
    pub fn to_pgm(&self) -> Vec<u8> {
        let mut out = format!("P5\n{} {}\n255\n", self.width, self.height).into_bytes();
        out.extend_from_slice(&self.pixels);
        out
    }

    /// Decode a binary PGM with a maximum value of 255.
    pub fn from_pgm(data: &[u8]) -> Result<Self, PluginError> {
        let invalid = |reason: &str| PluginError::Processing(format!("invalid PGM frame: {reason}"));

        // Four whitespace-separated header tokens, then a single whitespace byte.
        let mut tokens = Vec::with_capacity(4);
        let mut pos = 0;
        while tokens.len() < 4 {
            while pos < data.len() && data[pos].is_ascii_whitespace() {
                pos += 1;
            }
            let start = pos;
            while pos < data.len() && !data[pos].is_ascii_whitespace() {
                pos += 1;
            }
            if start == pos {
                return Err(invalid("truncated header"));
            }
            let token =
                std::str::from_utf8(&data[start..pos]).map_err(|_| invalid("non-ASCII header"))?;
            tokens.push(token);
        }
        pos += 1;

        if tokens[0] != "P5" {
            return Err(invalid("not a binary graymap"));
        }
        let parse = |token: &str| token.parse::<usize>().map_err(|_| invalid("bad dimension"));
        let (width, height, max) = (parse(tokens[1])?, parse(tokens[2])?, parse(tokens[3])?);
        if max != 255 {
            return Err(invalid("only 8-bit frames are supported"));
        }
        let len = width
            .checked_mul(height)
            .ok_or_else(|| invalid("dimensions overflow"))?;
        let pixels = data
            .get(pos..)
            .filter(|rest| rest.len() == len)
            .ok_or_else(|| invalid("pixel data does not match dimensions"))?;

        Ok(Self {
            width,
            height,
            pixels: pixels.to_vec(),
        })
    }
}
