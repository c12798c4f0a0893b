//! RGBA8 to device frame conversion
//!
//! RGB-ordered targets are produced by a per-pixel channel reorder with an
//! optional legal-range remap. YUV targets go through an intermediate BGRA
//! frame that the hardware color-space converter turns into the final buffer.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{PlayoutError, Result};
use crate::formats::{Colorspace, PixelFormat};
use crate::hardware::{VideoConverter, VideoFrame, VideoOutput};
use crate::types::RgbaFrame;

/// Lowest legal-range code value
pub const LEGAL_MIN: u8 = 16;
/// Highest legal-range code value
pub const LEGAL_MAX: u8 = 235;

const LEGAL_SPAN: u32 = (LEGAL_MAX - LEGAL_MIN) as u32;

/// RGB-ordered format fed to the hardware converter for YUV targets
pub const YUV_SOURCE_FORMAT: PixelFormat = PixelFormat::Bgra8;

/// Frames that log row-bytes and frame-creation details
const DETAIL_LOG_FRAMES: u32 = 2;

const fn legal_value(value: u8) -> u8 {
    let scaled = (value as u32 * LEGAL_SPAN + 127) / 255 + LEGAL_MIN as u32;
    if scaled < LEGAL_MIN as u32 {
        LEGAL_MIN
    } else if scaled > LEGAL_MAX as u32 {
        LEGAL_MAX
    } else {
        scaled as u8
    }
}

const fn build_legal_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = legal_value(i as u8);
        i += 1;
    }
    table
}

static LEGAL_TABLE: [u8; 256] = build_legal_table();

/// Map a full-range code value into [16, 235] with rounding
#[inline]
pub fn map_to_legal_range(value: u8) -> u8 {
    LEGAL_TABLE[value as usize]
}

/// Write tightly packed RGBA rows into an ARGB or BGRA buffer
///
/// `dst` rows are `row_bytes` apart; R, G and B are remapped when
/// `legal_range` is set, alpha never is.
pub fn convert_rgba_rows(
    src: &[u8],
    dst: &mut [u8],
    width: u32,
    height: u32,
    row_bytes: usize,
    target: PixelFormat,
    legal_range: bool,
) -> Result<()> {
    if !matches!(target, PixelFormat::Argb8 | PixelFormat::Bgra8) {
        return Err(PlayoutError::unsupported(format!(
            "RGBA conversion to {}",
            target
        )));
    }
    let src_row_bytes = width as usize * 4;
    if src.len() < src_row_bytes * height as usize
        || row_bytes < src_row_bytes
        || dst.len() < row_bytes * height as usize
    {
        return Err(PlayoutError::unsupported(format!(
            "buffer too small for {}x{} {}",
            width, height, target
        )));
    }

    let remap = |v: u8| if legal_range { map_to_legal_range(v) } else { v };
    for (src_row, dst_row) in src
        .chunks_exact(src_row_bytes)
        .zip(dst.chunks_exact_mut(row_bytes))
        .take(height as usize)
    {
        for (px, out) in src_row.chunks_exact(4).zip(dst_row.chunks_exact_mut(4)) {
            let (r, g, b, a) = (remap(px[0]), remap(px[1]), remap(px[2]), px[3]);
            let ordered = match target {
                PixelFormat::Argb8 => [a, r, g, b],
                _ => [b, g, r, a],
            };
            out.copy_from_slice(&ordered);
        }
    }
    Ok(())
}

/// Format the top-left, center and bottom-right pixels of a 4-byte-per-pixel buffer
pub fn format_samples(data: &[u8], width: u32, height: u32, row_bytes: usize) -> String {
    let max_x = width.saturating_sub(1) as usize;
    let max_y = height.saturating_sub(1) as usize;
    let points = [
        ("topLeft", 0, 0),
        ("center", (width / 2) as usize, (height / 2) as usize),
        ("bottomRight", max_x, max_y),
    ];
    points
        .iter()
        .map(|(name, x, y)| {
            let index = (*y).min(max_y) * row_bytes + (*x).min(max_x) * 4;
            match data.get(index..index + 4) {
                Some(px) => format!("{}=[{},{},{},{}]", name, px[0], px[1], px[2], px[3]),
                None => format!("{}=[invalid]", name),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Converts producer frames into frames for one negotiated output
pub struct FrameConverter {
    output: Arc<dyn VideoOutput>,
    converter: Option<Box<dyn VideoConverter>>,
    target: PixelFormat,
    colorspace: Colorspace,
    legal_range: bool,
    detail_frames: u32,
    samples_logged: bool,
}

impl FrameConverter {
    /// Create a converter for `target`
    ///
    /// YUV targets need the hardware converter; RGB targets ignore it.
    pub fn new(
        output: Arc<dyn VideoOutput>,
        converter: Option<Box<dyn VideoConverter>>,
        target: PixelFormat,
        colorspace: Colorspace,
        legal_range: bool,
    ) -> Result<Self> {
        if target.is_yuv() && converter.is_none() {
            return Err(PlayoutError::unsupported(format!(
                "{} output without a video converter",
                target
            )));
        }
        Ok(Self {
            output,
            converter,
            target,
            colorspace,
            legal_range,
            detail_frames: DETAIL_LOG_FRAMES,
            samples_logged: false,
        })
    }

    /// Device pixel format produced
    pub fn target(&self) -> PixelFormat {
        self.target
    }

    /// Colorspace handed to the hardware converter
    pub fn colorspace(&self) -> Colorspace {
        self.colorspace
    }

    /// Convert one frame into device layout
    pub fn convert(&mut self, frame: &RgbaFrame) -> Result<VideoFrame> {
        let log_details = self.detail_frames > 0;
        if log_details {
            self.detail_frames -= 1;
        }
        let log_samples = !self.samples_logged;
        if log_samples {
            info!(
                "Input RGBA samples (rowBytes={}): {}",
                frame.width * 4,
                format_samples(frame.data(), frame.width, frame.height, frame.width as usize * 4)
            );
        }

        let rgb_format = if self.target.is_yuv() {
            YUV_SOURCE_FORMAT
        } else {
            self.target
        };
        let rgb = self.rgb_frame(frame, rgb_format, log_details)?;

        if log_samples {
            let stage = if self.target.is_yuv() { "pre-YUV " } else { "" };
            info!(
                "Output samples ({}{}, rowBytes={}, range={}): {}",
                stage,
                rgb_format,
                rgb.row_bytes,
                if self.legal_range { "legal" } else { "full" },
                format_samples(&rgb.data, rgb.width, rgb.height, rgb.row_bytes)
            );
            self.samples_logged = true;
        }

        if !self.target.is_yuv() {
            return Ok(rgb);
        }
        let Some(converter) = self.converter.as_mut() else {
            return Err(PlayoutError::unsupported(format!("{} without a video converter", self.target)));
        };
        converter
            .convert_new_frame(&rgb, self.target, self.colorspace)
            .map_err(|e| PlayoutError::hardware("ConvertNewFrame", e))
    }

    fn rgb_frame(&self, frame: &RgbaFrame, format: PixelFormat, log_details: bool) -> Result<VideoFrame> {
        let row_bytes = self
            .output
            .row_bytes_for_pixel_format(format, frame.width)
            .map_err(|e| PlayoutError::hardware("RowBytesForPixelFormat", e))?;
        if log_details {
            debug!("RowBytesForPixelFormat ok: format={} rowBytes={}", format, row_bytes);
        }

        let mut video = self
            .output
            .create_video_frame(frame.width, frame.height, row_bytes, format)
            .map_err(|e| PlayoutError::hardware("CreateVideoFrame", e))?;
        if log_details {
            debug!(
                "CreateVideoFrame ok: format={} width={} height={} rowBytes={}",
                format, frame.width, frame.height, row_bytes
            );
        }

        convert_rgba_rows(
            frame.data(),
            &mut video.data,
            frame.width,
            frame.height,
            row_bytes,
            format,
            self.legal_range,
        )?;
        Ok(video)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_range_endpoints() {
        assert_eq!(map_to_legal_range(0), 16);
        assert_eq!(map_to_legal_range(255), 235);
        assert_eq!(map_to_legal_range(128), 126);
    }

    #[test]
    fn test_legal_range_matches_rounding() {
        for v in 0..=255u32 {
            let expected = ((v as f64 * 219.0 / 255.0).round() as u32 + 16).clamp(16, 235);
            assert_eq!(map_to_legal_range(v as u8) as u32, expected, "value {}", v);
        }
    }

    #[test]
    fn test_channel_order() {
        let src = [10, 20, 30, 40];
        let mut argb = [0u8; 4];
        convert_rgba_rows(&src, &mut argb, 1, 1, 4, PixelFormat::Argb8, false).unwrap();
        assert_eq!(argb, [40, 10, 20, 30]);

        let mut bgra = [0u8; 4];
        convert_rgba_rows(&src, &mut bgra, 1, 1, 4, PixelFormat::Bgra8, false).unwrap();
        assert_eq!(bgra, [30, 20, 10, 40]);
    }

    #[test]
    fn test_legal_range_leaves_alpha() {
        let src = [0, 255, 0, 0];
        let mut out = [0u8; 4];
        convert_rgba_rows(&src, &mut out, 1, 1, 4, PixelFormat::Bgra8, true).unwrap();
        assert_eq!(out, [16, 235, 16, 0]);
    }

    #[test]
    fn test_padded_rows() {
        let src = [1, 2, 3, 4, 5, 6, 7, 8];
        let mut out = [0xAAu8; 16];
        convert_rgba_rows(&src, &mut out, 1, 2, 8, PixelFormat::Argb8, false).unwrap();
        assert_eq!(&out[0..4], &[4, 1, 2, 3]);
        assert_eq!(&out[4..8], &[0xAA; 4]);
        assert_eq!(&out[8..12], &[8, 5, 6, 7]);
    }

    #[test]
    fn test_yuv_target_rejected() {
        let mut out = [0u8; 4];
        let result = convert_rgba_rows(&[0; 4], &mut out, 1, 1, 4, PixelFormat::Yuv8, false);
        assert!(matches!(result, Err(PlayoutError::Unsupported(_))));
    }

    #[test]
    fn test_format_samples() {
        let data: Vec<u8> = (0..16).collect();
        let text = format_samples(&data, 2, 2, 8);
        assert_eq!(text, "topLeft=[0,1,2,3] center=[12,13,14,15] bottomRight=[12,13,14,15]");
        assert!(format_samples(&data, 4, 4, 16).contains("bottomRight=[invalid]"));
    }
}
