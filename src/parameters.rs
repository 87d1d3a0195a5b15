//! Device parameter sets and the store that tracks what still needs to reach
//! the hardware.
//!
//! Parameters travel as a flat `key=value;key=value` string map. The
//! [`ParameterStore`] keeps the last committed set plus the overlays the
//! session wants applied, and only merges the overlays flagged in its
//! [`UpdateSet`] into a fresh device read on commit.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use tracing::debug;

use crate::config::BurstConfig;
use crate::error::Result;
use crate::mode::CaptureMode;

/// Well-known parameter keys.
pub mod keys {
    /// Active capture mode.
    pub const CAPTURE_MODE: &str = "capture-mode";
    /// Comma separated list of supported capture modes.
    pub const CAPTURE_MODE_VALUES: &str = "capture-mode-values";
    /// Frames per shutter action.
    pub const BURST_CAPTURE: &str = "burst-capture";
    /// Exposure compensation steps for exposure bracketing.
    pub const EXP_BRACKETING_RANGE: &str = "exp-bracketing-range";
    /// Zoom levels for zoom bracketing.
    pub const ZOOM_BRACKETING_RANGE: &str = "zoom-bracketing-range";
    /// `enable` or `disable`.
    pub const TEMPORAL_BRACKETING: &str = "temporal-bracketing";
    /// Frames captured before the shutter moment.
    pub const TEMPORAL_RANGE_NEGATIVE: &str = "temporal-bracketing-range-negative";
    /// Frames captured after the shutter moment.
    pub const TEMPORAL_RANGE_POSITIVE: &str = "temporal-bracketing-range-positive";
    /// Image post-processing pipeline.
    pub const IPP: &str = "ipp";
    /// Current zoom index.
    pub const ZOOM: &str = "zoom";
    /// Highest zoom index the device accepts.
    pub const MAX_ZOOM: &str = "max-zoom";
    /// Still capture size as `WxH`.
    pub const PICTURE_SIZE: &str = "picture-size";
    /// Still capture pixel format.
    pub const PICTURE_FORMAT: &str = "picture-format";
    /// Current focus mode.
    pub const FOCUS_MODE: &str = "focus-mode";
    /// Comma separated list of supported focus modes.
    pub const FOCUS_MODE_VALUES: &str = "focus-mode-values";

    /// Keys only some modes set. Cleared before a mode profile is merged.
    pub const MODE_SCOPED: [&str; 4] = [
        EXP_BRACKETING_RANGE,
        ZOOM_BRACKETING_RANGE,
        TEMPORAL_RANGE_NEGATIVE,
        TEMPORAL_RANGE_POSITIVE,
    ];
}

/// Ordered key/value parameter set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Parameters {
    values: BTreeMap<String, String>,
}

impl Parameters {
    /// Create an empty parameter set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    /// Parse the flattened `k=v;k=v` form. Entries without `=` are skipped.
    pub fn unflatten(flat: &str) -> Self {
        let values = flat
            .split(';')
            .filter_map(|entry| entry.split_once('='))
            .map(|(key, value)| (key.to_owned(), value.to_owned()))
            .collect();
        Self { values }
    }

    /// Render the flattened `k=v;k=v` form.
    pub fn flatten(&self) -> String {
        self.values
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Raw value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Value for `key` parsed as an unsigned integer.
    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key).and_then(|value| value.trim().parse().ok())
    }

    /// Comma separated list value for `key`. Empty when absent.
    pub fn get_list(&self, key: &str) -> Vec<&str> {
        self.get(key)
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `WxH` value for `key`.
    pub fn get_size(&self, key: &str) -> Option<(u32, u32)> {
        let (width, height) = self.get(key)?.split_once('x')?;
        Some((width.trim().parse().ok()?, height.trim().parse().ok()?))
    }

    /// Set `key` to `value`.
    pub fn set<V: ToString>(&mut self, key: &str, value: V) {
        self.values.insert(key.to_owned(), value.to_string());
    }

    /// Set `key` to a comma separated list.
    pub fn set_list<V: fmt::Display>(&mut self, key: &str, items: &[V]) {
        let joined = items
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        self.set(key, joined);
    }

    /// Remove `key`, returning its old value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    /// Copy every entry of `other` over this set.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in &other.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the set has no entries.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Which parameter subsets changed since the last commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpdateSet(u8);

impl UpdateSet {
    /// Nothing pending.
    pub const EMPTY: Self = Self(0);
    /// Re-read capabilities and reapply every overlay.
    pub const INITIALIZE: Self = Self(1);
    /// Zoom level changed.
    pub const ZOOM: Self = Self(1 << 1);
    /// A user preference changed.
    pub const PREFERENCE: Self = Self(1 << 2);
    /// Capture mode profile changed.
    pub const MODE: Self = Self(1 << 3);
    /// Every subset.
    pub const ALL: Self = Self(0b1111);

    /// Whether every flag of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no flag is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for UpdateSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for UpdateSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Capabilities negotiated with the device at initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Capture modes the device accepts.
    pub modes: Vec<CaptureMode>,
    /// Highest zoom index.
    pub max_zoom: u32,
    /// Whether the device can run a focus sweep.
    pub auto_focus: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            modes: vec![CaptureMode::Standard],
            max_zoom: 0,
            auto_focus: false,
        }
    }
}

impl Capabilities {
    /// Derive capabilities from a device parameter read.
    ///
    /// A device that lists no capture modes still supports `standard`.
    pub fn from_parameters(params: &Parameters) -> Self {
        let mut modes: Vec<CaptureMode> = params
            .get_list(keys::CAPTURE_MODE_VALUES)
            .into_iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        if !modes.contains(&CaptureMode::Standard) {
            modes.insert(0, CaptureMode::Standard);
        }

        let auto_focus = params
            .get_list(keys::FOCUS_MODE_VALUES)
            .iter()
            .any(|mode| *mode == "auto" || *mode == "continuous-picture");

        Self {
            modes,
            max_zoom: params.get_u32(keys::MAX_ZOOM).unwrap_or(0),
            auto_focus,
        }
    }

    /// Whether `mode` is in the negotiated set.
    pub fn supports(&self, mode: CaptureMode) -> bool {
        self.modes.contains(&mode)
    }
}

/// Device side of a parameter round-trip.
pub trait ParameterChannel {
    /// Read the device's current parameters.
    fn get_parameters(&self) -> Result<Parameters>;

    /// Write a full parameter set to the device.
    fn set_parameters(&self, params: &Parameters) -> Result<()>;
}

/// Last committed parameters plus the overlays still waiting for a commit.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    committed: Parameters,
    capabilities: Capabilities,
    mode: CaptureMode,
    mode_overlay: Parameters,
    preferences: Parameters,
    zoom: Option<u32>,
    pending: UpdateSet,
    version: u64,
}

impl ParameterStore {
    /// Create a store that will initialize on its first commit.
    pub fn new(mode: CaptureMode, burst: &BurstConfig) -> Self {
        let mut mode_overlay = Parameters::new();
        mode.apply(burst, &mut mode_overlay);
        Self {
            committed: Parameters::new(),
            capabilities: Capabilities::default(),
            mode,
            mode_overlay,
            preferences: Parameters::new(),
            zoom: None,
            pending: UpdateSet::ALL,
            version: 0,
        }
    }

    /// Parameters as of the last successful commit.
    pub const fn committed(&self) -> &Parameters {
        &self.committed
    }

    /// Capabilities learned at the last initialize commit.
    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Mode whose profile the store holds.
    pub const fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Subsets waiting for a commit.
    pub const fn pending(&self) -> UpdateSet {
        self.pending
    }

    /// Number of successful commits.
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Requested zoom index, if any.
    pub const fn zoom(&self) -> Option<u32> {
        self.zoom
    }

    /// Replace the mode profile.
    pub fn set_mode(&mut self, mode: CaptureMode, burst: &BurstConfig) {
        let mut overlay = Parameters::new();
        mode.apply(burst, &mut overlay);
        self.mode = mode;
        self.mode_overlay = overlay;
        self.pending |= UpdateSet::MODE;
    }

    /// Record a user preference.
    pub fn set_preference<V: ToString>(&mut self, key: &str, value: V) {
        self.preferences.set(key, value);
        self.pending |= UpdateSet::PREFERENCE;
    }

    /// Record a zoom index.
    pub fn set_zoom(&mut self, level: u32) {
        self.zoom = Some(level);
        self.pending |= UpdateSet::ZOOM;
    }

    /// Flag subsets for the next commit.
    pub fn mark(&mut self, updates: UpdateSet) {
        self.pending |= updates;
    }

    /// Merge the pending overlays into a fresh device read and write it back.
    ///
    /// Does nothing when no subset is pending. On failure the pending set and
    /// the committed snapshot are unchanged.
    pub fn commit<C: ParameterChannel + ?Sized>(&mut self, channel: &C) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(false);
        }

        let pending = self.pending;
        let mut fresh = channel.get_parameters()?;
        let initialize = pending.contains(UpdateSet::INITIALIZE);

        let capabilities = if initialize {
            Capabilities::from_parameters(&fresh)
        } else {
            self.capabilities.clone()
        };

        if initialize || pending.contains(UpdateSet::MODE) {
            for key in keys::MODE_SCOPED {
                fresh.remove(key);
            }
            fresh.merge(&self.mode_overlay);
        }
        if initialize || pending.contains(UpdateSet::PREFERENCE) {
            fresh.merge(&self.preferences);
        }
        if initialize || pending.contains(UpdateSet::ZOOM) {
            if let Some(zoom) = self.zoom {
                fresh.set(keys::ZOOM, zoom);
            }
        }

        channel.set_parameters(&fresh)?;

        self.committed = fresh;
        self.capabilities = capabilities;
        self.pending = UpdateSet::EMPTY;
        self.version += 1;
        debug!(
            version = self.version,
            updates = ?pending,
            "committed device parameters"
        );
        Ok(true)
    }
}
