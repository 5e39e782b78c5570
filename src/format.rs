// Output format negotiation.
// Maps the client-supplied `outputFormat` field to a concrete encoding and quality.

use clap::ValueEnum;

/// Quality used for lossy JPEG output unless reconfigured.
pub const DEFAULT_JPEG_QUALITY: f32 = 0.8;

/// Encodings the server can ask the removal capability for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Png,
    Jpeg,
    Webp,
}

impl OutputFormat {
    pub fn mime(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Webp => "image/webp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "png" => Some(OutputFormat::Png),
            "jpeg" | "jpg" => Some(OutputFormat::Jpeg),
            "webp" => Some(OutputFormat::Webp),
            _ => None,
        }
    }
}

impl TryFrom<&mime::Mime> for OutputFormat {
    type Error = ();

    fn try_from(value: &mime::Mime) -> Result<Self, Self::Error> {
        if value.type_() == mime::IMAGE {
            OutputFormat::from_name(value.subtype().as_str()).ok_or(())
        } else {
            Err(())
        }
    }
}

/// A negotiated output encoding: what the capability must produce and how lossy it may be.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputSpec {
    pub format: OutputFormat,
    /// Encoder quality in `0.0..=1.0`.
    pub quality: f32,
}

impl OutputSpec {
    pub fn mime(&self) -> &'static str {
        self.format.mime()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FormatNegotiator {
    default_format: OutputFormat,
    jpeg_quality: f32,
}

impl Default for FormatNegotiator {
    fn default() -> Self {
        Self {
            default_format: OutputFormat::Png,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl FormatNegotiator {
    pub fn new(default_format: OutputFormat, jpeg_quality: f32) -> Self {
        let jpeg_quality = if jpeg_quality.is_finite() {
            jpeg_quality.clamp(0.0, 1.0)
        } else {
            DEFAULT_JPEG_QUALITY
        };
        Self {
            default_format,
            jpeg_quality,
        }
    }

    /// Resolves a requested format name (`png`, `jpg`, `jpeg`, `webp`, or an `image/*`
    /// MIME type) case-insensitively. Anything unrecognized falls back to the default format.
    pub fn resolve(&self, requested: Option<&str>) -> OutputSpec {
        let format = requested
            .map(|s| s.trim().to_ascii_lowercase())
            .and_then(|s| {
                OutputFormat::from_name(&s).or_else(|| {
                    s.parse::<mime::Mime>()
                        .ok()
                        .and_then(|m| OutputFormat::try_from(&m).ok())
                })
            })
            .unwrap_or(self.default_format);

        let quality = match format {
            OutputFormat::Jpeg => self.jpeg_quality,
            // PNG is lossless and keeps the alpha channel; WEBP is asked for its best.
            OutputFormat::Png | OutputFormat::Webp => 1.0,
        };

        OutputSpec { format, quality }
    }
}
