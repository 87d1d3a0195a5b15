//! Capture modes and their device parameter profiles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::BurstConfig;
use crate::parameters::{keys, Parameters};

/// Named configuration profile controlling burst count, bracketing range and
/// image-processing flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CaptureMode {
    /// Single full-quality shot.
    #[default]
    Standard,
    /// Rapid burst with image processing disabled.
    #[serde(rename = "high-performance")]
    HighPerformanceBurst,
    /// Burst across an exposure compensation range.
    ExposureBracketing,
    /// Burst across a set of zoom levels.
    ZoomBracketing,
    /// Frames taken around the shutter moment.
    TemporalBracketing,
}

impl CaptureMode {
    /// All modes, in menu order.
    pub const ALL: [Self; 5] = [
        Self::Standard,
        Self::HighPerformanceBurst,
        Self::ExposureBracketing,
        Self::ZoomBracketing,
        Self::TemporalBracketing,
    ];

    /// Value of the `capture-mode` parameter for this mode.
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::HighPerformanceBurst => "high-performance",
            Self::ExposureBracketing => "exposure-bracketing",
            Self::ZoomBracketing => "zoom-bracketing",
            Self::TemporalBracketing => "temporal-bracketing",
        }
    }

    /// Whether a single shutter action produces several frames.
    pub const fn is_burst(self) -> bool {
        !matches!(self, Self::Standard)
    }

    /// Number of frames one shutter action produces in this mode.
    pub fn shot_count(self, burst: &BurstConfig) -> u32 {
        let count = match self {
            Self::Standard => 1,
            Self::HighPerformanceBurst => burst.burst_count,
            Self::ExposureBracketing => saturating_len(burst.exposure_range.len()),
            Self::ZoomBracketing => saturating_len(burst.zoom_range.len()),
            Self::TemporalBracketing => burst
                .temporal_negative
                .saturating_add(burst.temporal_positive)
                .saturating_add(1),
        };
        count.max(1)
    }

    /// Write this mode's profile into `params`, clearing keys that belong to
    /// other modes.
    pub fn apply(self, burst: &BurstConfig, params: &mut Parameters) {
        params.set(keys::CAPTURE_MODE, self.wire_name());
        params.set(keys::BURST_CAPTURE, self.shot_count(burst));
        params.remove(keys::EXP_BRACKETING_RANGE);
        params.remove(keys::ZOOM_BRACKETING_RANGE);
        params.set(keys::TEMPORAL_BRACKETING, "disable");
        params.remove(keys::TEMPORAL_RANGE_NEGATIVE);
        params.remove(keys::TEMPORAL_RANGE_POSITIVE);

        match self {
            Self::Standard => {
                params.set(keys::IPP, "ldc-nsf");
            }
            Self::HighPerformanceBurst => {
                params.set(keys::IPP, "off");
            }
            Self::ExposureBracketing => {
                params.set(keys::IPP, "off");
                params.set_list(keys::EXP_BRACKETING_RANGE, &burst.exposure_range);
            }
            Self::ZoomBracketing => {
                params.set(keys::IPP, "off");
                params.set_list(keys::ZOOM_BRACKETING_RANGE, &burst.zoom_range);
            }
            Self::TemporalBracketing => {
                params.set(keys::IPP, "off");
                params.set(keys::TEMPORAL_BRACKETING, "enable");
                params.set(keys::TEMPORAL_RANGE_NEGATIVE, burst.temporal_negative);
                params.set(keys::TEMPORAL_RANGE_POSITIVE, burst.temporal_positive);
            }
        }
    }
}

fn saturating_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Error returned when parsing an unknown mode name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capture mode: {0}")]
pub struct UnknownMode(pub String);

impl FromStr for CaptureMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.wire_name() == s)
            .ok_or_else(|| UnknownMode(s.to_owned()))
    }
}
