//! Software RGB to 4:2:2 YUV converter
//!
//! Produces studio-swing `2vuy` (UYVY) and `v210` buffers from 8-bit ARGB or
//! BGRA frames. Chroma is the average of each horizontal pixel pair.

use super::{HwError, HwResult, VideoConverter, VideoFrame};
use crate::formats::{Colorspace, PixelFormat};

/// Luma coefficients of a colorspace
#[derive(Debug, Clone, Copy, PartialEq)]
struct Matrix {
    kr: f32,
    kb: f32,
}

impl Matrix {
    fn for_colorspace(colorspace: Colorspace) -> Self {
        match colorspace {
            Colorspace::Rec601 => Self { kr: 0.299, kb: 0.114 },
            Colorspace::Rec709 => Self { kr: 0.2126, kb: 0.0722 },
            Colorspace::Rec2020 => Self { kr: 0.2627, kb: 0.0593 },
        }
    }

    fn luma(&self, [r, g, b]: [f32; 3]) -> f32 {
        self.kr * r + (1.0 - self.kr - self.kb) * g + self.kb * b
    }

    fn chroma(&self, rgb: [f32; 3]) -> (f32, f32) {
        let y = self.luma(rgb);
        let cb = (rgb[2] - y) / (2.0 * (1.0 - self.kb));
        let cr = (rgb[0] - y) / (2.0 * (1.0 - self.kr));
        (cb, cr)
    }
}

/// Studio-swing quantizer for 8 or 10 bit samples
#[derive(Debug, Clone, Copy)]
struct Quantizer {
    scale: f32,
}

impl Quantizer {
    const EIGHT_BIT: Self = Self { scale: 1.0 };
    const TEN_BIT: Self = Self { scale: 4.0 };

    fn luma(&self, y: f32) -> u16 {
        let s = self.scale;
        (16.0 * s + 219.0 * s * y).round().clamp(16.0 * s, 235.0 * s) as u16
    }

    fn chroma(&self, c: f32) -> u16 {
        let s = self.scale;
        (128.0 * s + 224.0 * s * c).round().clamp(16.0 * s, 240.0 * s) as u16
    }
}

/// One horizontal pixel pair in 4:2:2
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pair {
    y: [u16; 2],
    cb: u16,
    cr: u16,
}

fn sample(row: &[u8], x: usize, width: usize, format: PixelFormat) -> [f32; 3] {
    let offset = x.min(width - 1) * 4;
    let px = &row[offset..offset + 4];
    let (r, g, b) = match format {
        PixelFormat::Bgra8 => (px[2], px[1], px[0]),
        _ => (px[1], px[2], px[3]),
    };
    [r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0]
}

fn pair(
    row: &[u8],
    index: usize,
    width: usize,
    format: PixelFormat,
    matrix: Matrix,
    quant: Quantizer,
) -> Pair {
    let left = sample(row, index * 2, width, format);
    let right = sample(row, index * 2 + 1, width, format);
    let mean = [
        (left[0] + right[0]) / 2.0,
        (left[1] + right[1]) / 2.0,
        (left[2] + right[2]) / 2.0,
    ];
    let (cb, cr) = matrix.chroma(mean);
    Pair {
        y: [quant.luma(matrix.luma(left)), quant.luma(matrix.luma(right))],
        cb: quant.chroma(cb),
        cr: quant.chroma(cr),
    }
}

fn pack_uyvy(src: &[u8], dst: &mut [u8], width: usize, format: PixelFormat, matrix: Matrix) {
    for (index, out) in dst.chunks_exact_mut(4).take(width.div_ceil(2)).enumerate() {
        let p = pair(src, index, width, format, matrix, Quantizer::EIGHT_BIT);
        out.copy_from_slice(&[p.cb as u8, p.y[0] as u8, p.cr as u8, p.y[1] as u8]);
    }
}

fn pack_v210(src: &[u8], dst: &mut [u8], width: usize, format: PixelFormat, matrix: Matrix) {
    let word = |a: u16, b: u16, c: u16| (a as u32) | ((b as u32) << 10) | ((c as u32) << 20);
    for (group, out) in dst.chunks_exact_mut(16).take(width.div_ceil(6)).enumerate() {
        let [p0, p1, p2] =
            [0, 1, 2].map(|i| pair(src, group * 3 + i, width, format, matrix, Quantizer::TEN_BIT));
        let words = [
            word(p0.cb, p0.y[0], p0.cr),
            word(p0.y[1], p1.cb, p1.y[0]),
            word(p1.cr, p1.y[1], p2.cb),
            word(p2.y[0], p2.cr, p2.y[1]),
        ];
        for (bytes, value) in out.chunks_exact_mut(4).zip(words) {
            bytes.copy_from_slice(&value.to_le_bytes());
        }
    }
}

/// Software implementation of the hardware color-space converter
#[derive(Debug, Default)]
pub struct SoftwareConverter;

impl SoftwareConverter {
    /// Create a converter
    pub fn new() -> Self {
        Self
    }
}

impl VideoConverter for SoftwareConverter {
    fn convert_new_frame(
        &mut self,
        source: &VideoFrame,
        target: PixelFormat,
        colorspace: Colorspace,
    ) -> HwResult<VideoFrame> {
        if !matches!(source.pixel_format, PixelFormat::Argb8 | PixelFormat::Bgra8) {
            return Err(HwError::InvalidArg);
        }
        let width = source.width as usize;
        let height = source.height as usize;
        if width == 0 || source.row_bytes < width * 4 || source.data.len() < source.row_bytes * height {
            return Err(HwError::InvalidArg);
        }

        let pack = match target {
            PixelFormat::Yuv8 => pack_uyvy,
            PixelFormat::Yuv10 => pack_v210,
            _ => return Err(HwError::InvalidArg),
        };
        let matrix = Matrix::for_colorspace(colorspace);
        let row_bytes = target.row_bytes(source.width);
        let mut data = vec![0u8; row_bytes * height];
        for (src, dst) in source
            .data
            .chunks_exact(source.row_bytes)
            .zip(data.chunks_exact_mut(row_bytes))
        {
            pack(src, dst, width, source.pixel_format, matrix);
        }

        Ok(VideoFrame {
            width: source.width,
            height: source.height,
            row_bytes,
            pixel_format: target,
            data,
        })
    }
}
