//! Display mode negotiation
//!
//! Picks the (display mode, pixel format) pair a playback session runs in and
//! the colorspace handed to the YUV converter. Modes are visited in the order
//! the device reports them and the first acceptable pair wins.

use tracing::{info, warn};

use crate::catalog::DeviceCatalog;
use crate::config::ModeListConfig;
use crate::error::{PlayoutError, Result};
use crate::formats::{Colorspace, FieldDominance, PixelFormat, mode_flags};
use crate::hardware::{DisplayModeId, HwDisplayMode, SupportedModeFlags, VideoOutput};
use crate::types::{Connection, DisplayModeDescriptor};

/// Largest frame-rate difference still treated as a match
pub const FPS_TOLERANCE: f64 = 0.01;

/// What a session asks the negotiator for
#[derive(Debug, Clone, PartialEq)]
pub struct ModeRequest {
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Frame rate
    pub fps: f64,
    /// Pixel formats to try, in order
    pub pixel_formats: Vec<PixelFormat>,
    /// Connection the output is routed to
    pub connection: Connection,
    /// Mode must support keying
    pub keying: bool,
}

/// The pair a session runs in
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedMode {
    /// Mode handle for enable
    pub mode: DisplayModeId,
    /// Mode name, if reported
    pub name: Option<String>,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Selected device pixel format
    pub pixel_format: PixelFormat,
    /// Frame duration in time-scale units
    pub frame_duration: i64,
    /// Units per second
    pub time_scale: i64,
    /// Mode flag bits
    pub flags: u32,
    /// Field dominance
    pub field_dominance: FieldDominance,
}

impl NegotiatedMode {
    /// Frame rate of the mode
    pub fn fps(&self) -> f64 {
        if self.frame_duration > 0 && self.time_scale > 0 {
            self.time_scale as f64 / self.frame_duration as f64
        } else {
            0.0
        }
    }
}

/// Native colorspace advertised by mode flags, 2020 before 709 before 601
pub fn colorspace_from_flags(flags: u32) -> Option<Colorspace> {
    if flags & mode_flags::COLORSPACE_REC2020 != 0 {
        Some(Colorspace::Rec2020)
    } else if flags & mode_flags::COLORSPACE_REC709 != 0 {
        Some(Colorspace::Rec709)
    } else if flags & mode_flags::COLORSPACE_REC601 != 0 {
        Some(Colorspace::Rec601)
    } else {
        None
    }
}

/// Colorspace for frames of `height` when the mode advertises none
pub fn fallback_colorspace(height: u32) -> Colorspace {
    if height > 0 && height <= 576 {
        Colorspace::Rec601
    } else {
        Colorspace::Rec709
    }
}

/// Resolve the session colorspace from mode flags and an optional override
///
/// A Rec.2020 override on a mode without the Rec.2020 flag is ignored.
pub fn resolve_colorspace(flags: u32, height: u32, requested: Option<Colorspace>) -> Colorspace {
    let auto = colorspace_from_flags(flags).unwrap_or_else(|| {
        let fallback = fallback_colorspace(height);
        info!(
            "Colorspace flags not provided by display mode. Falling back to {}.",
            fallback
        );
        fallback
    });

    match requested {
        None => auto,
        Some(Colorspace::Rec2020) if flags & mode_flags::COLORSPACE_REC2020 == 0 => {
            warn!("Requested colorspace rec2020 is not supported by display mode. Using auto colorspace.");
            auto
        }
        Some(colorspace) => {
            info!("Using colorspace override: {}", colorspace);
            colorspace
        }
    }
}

fn rate_matches(mode: &HwDisplayMode, fps: f64) -> Option<f64> {
    let actual = mode.fps()?;
    ((actual - fps).abs() <= FPS_TOLERANCE).then_some(actual)
}

fn round_fps(fps: f64) -> f64 {
    (fps * 1000.0).round() / 1000.0
}

/// Walks the mode table of one output
pub struct DisplayModeNegotiator<'a> {
    output: &'a dyn VideoOutput,
}

impl<'a> DisplayModeNegotiator<'a> {
    /// Negotiate against `output`
    pub fn new(output: &'a dyn VideoOutput) -> Self {
        Self { output }
    }

    fn supports(&self, connection: Connection, mode: DisplayModeId, format: PixelFormat, keying: bool) -> bool {
        self.output
            .does_support_video_mode(connection, mode, format, SupportedModeFlags { keying })
            .unwrap_or(false)
    }

    /// First (mode, pixel format) pair the device accepts
    pub fn negotiate(&self, request: &ModeRequest) -> Result<NegotiatedMode> {
        let modes = self
            .output
            .display_modes()
            .map_err(|e| PlayoutError::hardware("GetDisplayModeIterator", e))?;

        for mode in modes {
            if mode.width != request.width || mode.height != request.height {
                continue;
            }
            if rate_matches(&mode, request.fps).is_none() {
                continue;
            }
            let Some((frame_duration, time_scale)) = mode.frame_rate else {
                continue;
            };

            let selected = request
                .pixel_formats
                .iter()
                .copied()
                .find(|&format| self.supports(request.connection, mode.id, format, request.keying));
            if let Some(pixel_format) = selected {
                return Ok(NegotiatedMode {
                    mode: mode.id,
                    name: mode.name,
                    width: mode.width,
                    height: mode.height,
                    pixel_format,
                    frame_duration,
                    time_scale,
                    flags: mode.flags,
                    field_dominance: mode.field_dominance,
                });
            }
        }

        Err(PlayoutError::NoDisplayMode {
            width: request.width,
            height: request.height,
            fps: request.fps,
        })
    }

    /// Describe every mode passing the filters, with the formats each supports
    ///
    /// Zero width, height or fps does not filter.
    pub fn list(&self, config: &ModeListConfig, connection: Connection) -> Result<Vec<DisplayModeDescriptor>> {
        let modes = self
            .output
            .display_modes()
            .map_err(|e| PlayoutError::hardware("GetDisplayModeIterator", e))?;

        let mut listed = Vec::new();
        for mode in modes {
            if config.width > 0 && mode.width != config.width {
                continue;
            }
            if config.height > 0 && mode.height != config.height {
                continue;
            }
            let (Some(fps), Some((frame_duration, time_scale))) = (mode.fps(), mode.frame_rate) else {
                continue;
            };
            if config.fps > 0.0 && (fps - config.fps).abs() > FPS_TOLERANCE {
                continue;
            }

            let pixel_formats = PixelFormat::ALL
                .into_iter()
                .filter(|&format| self.supports(connection, mode.id, format, config.keying))
                .collect();

            listed.push(DisplayModeDescriptor {
                name: mode.name.unwrap_or_default(),
                id: mode.id.0,
                width: mode.width,
                height: mode.height,
                fps: round_fps(fps),
                frame_duration,
                time_scale,
                field_dominance: mode.field_dominance,
                connection,
                pixel_formats,
            });
        }
        Ok(listed)
    }
}

/// Resolve a `--list-modes` request end to end
pub fn list_modes(catalog: &DeviceCatalog, config: &ModeListConfig) -> Result<Vec<DisplayModeDescriptor>> {
    let connection = config.validate()?;
    let device = catalog.find_by_id(&config.device_id)?;
    let output = device
        .output()
        .map_err(|e| PlayoutError::hardware("QueryInterface(Output)", e))?;
    DisplayModeNegotiator::new(output.as_ref()).list(config, connection)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_precedence() {
        let all = mode_flags::COLORSPACE_REC601 | mode_flags::COLORSPACE_REC709 | mode_flags::COLORSPACE_REC2020;
        assert_eq!(colorspace_from_flags(all), Some(Colorspace::Rec2020));
        assert_eq!(
            colorspace_from_flags(mode_flags::COLORSPACE_REC601 | mode_flags::COLORSPACE_REC709),
            Some(Colorspace::Rec709)
        );
        assert_eq!(colorspace_from_flags(mode_flags::SUPPORTS_3D), None);
    }

    #[test]
    fn test_height_fallback() {
        assert_eq!(resolve_colorspace(0, 486, None), Colorspace::Rec601);
        assert_eq!(resolve_colorspace(0, 576, None), Colorspace::Rec601);
        assert_eq!(resolve_colorspace(0, 720, None), Colorspace::Rec709);
        assert_eq!(resolve_colorspace(0, 0, None), Colorspace::Rec709);
    }

    #[test]
    fn test_override_rules() {
        let hd = mode_flags::COLORSPACE_REC709;
        assert_eq!(resolve_colorspace(hd, 1080, Some(Colorspace::Rec601)), Colorspace::Rec601);
        assert_eq!(resolve_colorspace(hd, 1080, Some(Colorspace::Rec2020)), Colorspace::Rec709);
        let uhd = mode_flags::COLORSPACE_REC709 | mode_flags::COLORSPACE_REC2020;
        assert_eq!(resolve_colorspace(uhd, 2160, Some(Colorspace::Rec2020)), Colorspace::Rec2020);
        assert_eq!(resolve_colorspace(uhd, 2160, Some(Colorspace::Rec709)), Colorspace::Rec709);
    }

    #[test]
    fn test_round_fps() {
        assert_eq!(round_fps(30000.0 / 1001.0), 29.97);
        assert_eq!(round_fps(24000.0 / 1001.0), 23.976);
    }
}
