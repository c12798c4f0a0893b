//! Pixel format, colorspace and field dominance labels
//!
//! Centralizes the device pixel formats and their vendor codes so the CLI,
//! the negotiator and the converter agree on one label set.

use serde::{Deserialize, Serialize};

/// Build a big-endian four-character code
pub const fn four_cc(code: &[u8; 4]) -> u32 {
    ((code[0] as u32) << 24) | ((code[1] as u32) << 16) | ((code[2] as u32) << 8) | (code[3] as u32)
}

/// Vendor pixel format codes
pub mod code {
    use super::four_cc;

    /// 8-bit 4:2:2 YUV, UYVY byte order
    pub const YUV_8BIT: u32 = four_cc(b"2vuy");
    /// 10-bit 4:2:2 YUV, v210 packing
    pub const YUV_10BIT: u32 = four_cc(b"v210");
    /// 8-bit ARGB
    pub const ARGB_8BIT: u32 = 32;
    /// 8-bit BGRA
    pub const BGRA_8BIT: u32 = four_cc(b"BGRA");
}

/// Device pixel formats this helper can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit 4:2:2 YUV
    #[serde(rename = "8bit_yuv", alias = "yuv8")]
    Yuv8,
    /// 10-bit 4:2:2 YUV
    #[serde(rename = "10bit_yuv", alias = "yuv10")]
    Yuv10,
    /// 8-bit ARGB
    #[serde(rename = "8bit_argb", alias = "argb")]
    Argb8,
    /// 8-bit BGRA
    #[serde(rename = "8bit_bgra", alias = "bgra")]
    Bgra8,
}

impl PixelFormat {
    /// Every format, in the order `--list-modes` probes them
    pub const ALL: [PixelFormat; 4] = [Self::Yuv8, Self::Yuv10, Self::Argb8, Self::Bgra8];

    /// The only format used when no priority list is configured
    pub const FALLBACK: PixelFormat = Self::Argb8;

    /// Label used on the command line and in JSON output
    pub fn label(&self) -> &'static str {
        match self {
            Self::Yuv8 => "8bit_yuv",
            Self::Yuv10 => "10bit_yuv",
            Self::Argb8 => "8bit_argb",
            Self::Bgra8 => "8bit_bgra",
        }
    }

    /// Vendor four-character code
    pub fn code(&self) -> u32 {
        match self {
            Self::Yuv8 => code::YUV_8BIT,
            Self::Yuv10 => code::YUV_10BIT,
            Self::Argb8 => code::ARGB_8BIT,
            Self::Bgra8 => code::BGRA_8BIT,
        }
    }

    /// Look a format up by vendor code
    pub fn from_code(value: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.code() == value)
    }

    /// Whether this format needs the hardware color-space converter
    pub fn is_yuv(&self) -> bool {
        matches!(self, Self::Yuv8 | Self::Yuv10)
    }

    /// Bytes per row for a frame of `width` pixels
    pub fn row_bytes(&self, width: u32) -> usize {
        let width = width as usize;
        match self {
            Self::Argb8 | Self::Bgra8 => width * 4,
            Self::Yuv8 => width * 2,
            // v210 packs 6 pixels into 16 bytes, rows aligned to 48 pixels
            Self::Yuv10 => width.div_ceil(48) * 128,
        }
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = crate::error::PlayoutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "8bit_yuv" | "yuv8" => Ok(Self::Yuv8),
            "10bit_yuv" | "yuv10" => Ok(Self::Yuv10),
            "8bit_argb" | "argb" => Ok(Self::Argb8),
            "8bit_bgra" | "bgra" => Ok(Self::Bgra8),
            _ => Err(crate::error::PlayoutError::UnknownPixelFormat(s.to_string())),
        }
    }
}

/// Parse a comma-separated priority list, skipping empty tokens
///
/// An unknown token fails the whole list; a list with no tokens is an error.
pub fn parse_priority_list(value: &str) -> crate::error::Result<Vec<PixelFormat>> {
    let formats = value
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::parse)
        .collect::<crate::error::Result<Vec<PixelFormat>>>()?;
    if formats.is_empty() {
        return Err(crate::error::PlayoutError::config(
            "Pixel format priority cannot be empty",
        ));
    }
    Ok(formats)
}

/// Output colorspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colorspace {
    /// ITU-R BT.601
    #[serde(alias = "bt601")]
    Rec601,
    /// ITU-R BT.709
    #[serde(alias = "bt709")]
    Rec709,
    /// ITU-R BT.2020
    #[serde(alias = "bt2020")]
    Rec2020,
}

impl Colorspace {
    /// Label used on the command line and in logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rec601 => "rec601",
            Self::Rec709 => "rec709",
            Self::Rec2020 => "rec2020",
        }
    }

    /// Parse a `--colorspace` value; `auto` yields `None`
    pub fn parse_override(value: &str) -> crate::error::Result<Option<Self>> {
        match value {
            "auto" => Ok(None),
            "rec601" | "bt601" => Ok(Some(Self::Rec601)),
            "rec709" | "bt709" => Ok(Some(Self::Rec709)),
            "rec2020" | "bt2020" => Ok(Some(Self::Rec2020)),
            _ => Err(crate::error::PlayoutError::config(format!(
                "Unknown colorspace: {}",
                value
            ))),
        }
    }
}

impl std::fmt::Display for Colorspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Display mode flag bits
pub mod mode_flags {
    /// Mode supports stereoscopic output
    pub const SUPPORTS_3D: u32 = 1 << 0;
    /// Mode is natively Rec.601
    pub const COLORSPACE_REC601: u32 = 1 << 1;
    /// Mode is natively Rec.709
    pub const COLORSPACE_REC709: u32 = 1 << 2;
    /// Mode advertises Rec.2020
    pub const COLORSPACE_REC2020: u32 = 1 << 3;
}

/// Colorspace flag bit for a colorspace
pub fn colorspace_flag(colorspace: Colorspace) -> u32 {
    match colorspace {
        Colorspace::Rec601 => mode_flags::COLORSPACE_REC601,
        Colorspace::Rec709 => mode_flags::COLORSPACE_REC709,
        Colorspace::Rec2020 => mode_flags::COLORSPACE_REC2020,
    }
}

/// Field dominance of a display mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FieldDominance {
    /// Progressive frames
    #[serde(rename = "progressive")]
    Progressive,
    /// Interlaced, upper field first
    #[serde(rename = "interlaced_upper_first")]
    UpperFieldFirst,
    /// Interlaced, lower field first
    #[serde(rename = "interlaced_lower_first")]
    LowerFieldFirst,
    /// Progressive segmented frame
    #[serde(rename = "psf")]
    ProgressiveSegmented,
    /// Not reported
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

impl FieldDominance {
    /// Label used in JSON output and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Progressive => "progressive",
            Self::UpperFieldFirst => "interlaced_upper_first",
            Self::LowerFieldFirst => "interlaced_lower_first",
            Self::ProgressiveSegmented => "psf",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FieldDominance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_four_cc() {
        assert_eq!(four_cc(b"BGRA"), 0x4247_5241);
        assert_eq!(PixelFormat::from_code(four_cc(b"v210")), Some(PixelFormat::Yuv10));
        assert_eq!(PixelFormat::from_code(0xDEAD_BEEF), None);
    }

    #[test]
    fn test_row_bytes() {
        assert_eq!(PixelFormat::Argb8.row_bytes(1920), 7680);
        assert_eq!(PixelFormat::Yuv8.row_bytes(1920), 3840);
        assert_eq!(PixelFormat::Yuv10.row_bytes(1920), 5120);
        assert_eq!(PixelFormat::Yuv10.row_bytes(720), 1920);
    }

    #[test]
    fn test_pixel_format_aliases() {
        assert_eq!("yuv10".parse::<PixelFormat>().unwrap(), PixelFormat::Yuv10);
        assert_eq!("8bit_bgra".parse::<PixelFormat>().unwrap(), PixelFormat::Bgra8);
        assert!("rgba".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_priority_list() {
        let list = parse_priority_list("10bit_yuv,,8bit_yuv").unwrap();
        assert_eq!(list, vec![PixelFormat::Yuv10, PixelFormat::Yuv8]);
        assert!(parse_priority_list(",").is_err());
        assert!(parse_priority_list("8bit_yuv,nope").is_err());
    }

    #[test]
    fn test_colorspace_override() {
        assert_eq!(Colorspace::parse_override("auto").unwrap(), None);
        assert_eq!(Colorspace::parse_override("bt2020").unwrap(), Some(Colorspace::Rec2020));
        assert!(Colorspace::parse_override("p3").is_err());
    }
}
