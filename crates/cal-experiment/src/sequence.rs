//! Sequences and series.
//!
//! A [`Sequence`] describes one scan leg. On disk it is a TOML file:
//!
//! ```toml
//! name = "visible"
//! storage_path = "data/visible"
//! sample_time = 1.0
//!
//! [metadata]
//! shutter = false
//!
//! [[instruments]]
//! kind = "monochromator"
//! id = "cs260"
//! start_wavelength = 0.4
//! stop_wavelength = 0.8
//! step_wavelength = 0.01
//! grating_transitions = [{ wavelength = 0.0, grating = 1 }]
//! osf_transitions = [{ wavelength = 0.0, osf = 1 }, { wavelength = 0.6, osf = 2 }]
//!
//! [[instruments]]
//! kind = "lockin"
//! id = "sr830"
//! time_constant = 0.1
//! sample_rate = 64.0
//! measure = true
//! sensitivity_transitions = [{ wavelength = 0.0, sensitivity = 0.001 }]
//! ```
//!
//! A [`Series`] is an ordered list of sequences, stored as a text file with one
//! sequence file name per line, resolved relative to the series file.

use crate::transition_table::{
    GratingTransition, OsfTransition, PositionTransition, SensitivityTransition,
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

fn default_storage_path() -> PathBuf {
    PathBuf::from("data")
}

fn default_sample_time() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// One scan leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    /// Sequence name, used in archive records and CSV file names.
    pub name: String,
    /// Directory receiving the archive and CSV files.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,
    /// Seconds of data taken per measured step.
    #[serde(default = "default_sample_time")]
    pub sample_time: f64,
    /// Which readbacks end up in archive metadata.
    #[serde(default)]
    pub metadata: MetadataFlags,
    /// Instrument sections, in file order.
    #[serde(default)]
    pub instruments: Vec<InstrumentSection>,
}

impl Sequence {
    /// Empty sequence named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage_path: default_storage_path(),
            sample_time: default_sample_time(),
            metadata: MetadataFlags::default(),
            instruments: Vec::new(),
        }
    }

    /// Append an instrument section.
    pub fn with_instrument(mut self, section: impl Into<InstrumentSection>) -> Self {
        self.instruments.push(section.into());
        self
    }

    /// Set the storage directory.
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = path.into();
        self
    }

    /// Set the sample time.
    pub fn with_sample_time(mut self, seconds: f64) -> Self {
        self.sample_time = seconds;
        self
    }

    /// Parse TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a sequence file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read sequence file {}", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("Invalid sequence file {}", path.display()))
    }

    /// Write the sequence to `path`; refuses to replace an existing file
    /// unless `overwrite` is set.
    pub fn save(&self, path: &Path, overwrite: bool) -> Result<()> {
        if path.exists() && !overwrite {
            bail!("Sequence file {} already exists", path.display());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self)?;
        std::fs::write(path, text)
            .with_context(|| format!("Failed to write sequence file {}", path.display()))
    }

    /// File name used when saving inside a series.
    pub fn file_name(&self) -> String {
        let stem: String = self
            .name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        format!("{}.toml", stem)
    }
}

/// Archive metadata inclusion flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataFlags {
    /// Monochromator wavelength.
    pub wavelength: bool,
    /// Monochromator grating.
    pub grating: bool,
    /// Monochromator order-sorting filter.
    pub order_sort_filter: bool,
    /// Monochromator shutter.
    pub shutter: bool,
    /// Lock-in settings.
    pub lockin: bool,
    /// ND filter position.
    pub ndf: bool,
    /// Detector settings.
    pub detector: bool,
}

impl Default for MetadataFlags {
    fn default() -> Self {
        Self {
            wavelength: true,
            grating: true,
            order_sort_filter: true,
            shutter: true,
            lockin: true,
            ndf: true,
            detector: true,
        }
    }
}

impl MetadataFlags {
    /// Whether parameter `key` of an instrument of `kind` is archived.
    pub fn includes(&self, kind: InstrumentKind, key: &str) -> bool {
        match kind {
            InstrumentKind::Monochromator => match key {
                "wavelength" => self.wavelength,
                "grating" => self.grating,
                "order_sort_filter" => self.order_sort_filter,
                "shutter" => self.shutter,
                _ => false,
            },
            InstrumentKind::Lockin => self.lockin,
            InstrumentKind::Ndf => self.ndf,
            InstrumentKind::Detector => self.detector,
        }
    }
}

/// Role an instrument plays in a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    /// Wavelength source.
    Monochromator,
    /// Lock-in amplifier.
    Lockin,
    /// Neutral density filter wheel.
    Ndf,
    /// Power detector.
    Detector,
}

impl fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Monochromator => write!(f, "monochromator"),
            Self::Lockin => write!(f, "lockin"),
            Self::Ndf => write!(f, "ndf"),
            Self::Detector => write!(f, "detector"),
        }
    }
}

/// Monochromator shutter position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutterState {
    /// Light passes.
    #[default]
    Open,
    /// Light blocked.
    Closed,
}

impl ShutterState {
    /// Parameter value sent to the monochromator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

/// One `[[instruments]]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstrumentSection {
    /// Wavelength sweep.
    Monochromator(MonochromatorSection),
    /// Lock-in settings.
    Lockin(LockinSection),
    /// ND filter positions.
    Ndf(NdfSection),
    /// Detector settings.
    Detector(DetectorSection),
}

impl InstrumentSection {
    /// Instrument id.
    pub fn id(&self) -> &str {
        match self {
            Self::Monochromator(s) => &s.id,
            Self::Lockin(s) => &s.id,
            Self::Ndf(s) => &s.id,
            Self::Detector(s) => &s.id,
        }
    }

    /// Section kind.
    pub fn kind(&self) -> InstrumentKind {
        match self {
            Self::Monochromator(_) => InstrumentKind::Monochromator,
            Self::Lockin(_) => InstrumentKind::Lockin,
            Self::Ndf(_) => InstrumentKind::Ndf,
            Self::Detector(_) => InstrumentKind::Detector,
        }
    }
}

/// Monochromator sweep, wavelengths in µm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonochromatorSection {
    /// Instrument id.
    pub id: String,
    /// First wavelength.
    pub start_wavelength: f64,
    /// Exclusive upper bound.
    pub stop_wavelength: f64,
    /// Increment, must be positive.
    pub step_wavelength: f64,
    /// Shutter state during the sweep.
    #[serde(default)]
    pub shutter: ShutterState,
    /// Grating change points.
    pub grating_transitions: Vec<GratingTransition>,
    /// Order-sorting filter change points.
    pub osf_transitions: Vec<OsfTransition>,
}

/// Lock-in settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockinSection {
    /// Instrument id.
    pub id: String,
    /// Time constant (s), constant across the sequence.
    pub time_constant: f64,
    /// Sample rate (Hz), constant across the sequence.
    pub sample_rate: f64,
    /// Sensitivity change points.
    pub sensitivity_transitions: Vec<SensitivityTransition>,
    /// Measure at every step.
    #[serde(default = "default_true")]
    pub measure: bool,
}

/// ND filter wheel positions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdfSection {
    /// Instrument id.
    pub id: String,
    /// Position change points.
    pub position_transitions: Vec<PositionTransition>,
}

/// Power detector settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorSection {
    /// Instrument id.
    pub id: String,
    /// Sample rate (Hz).
    pub sample_rate: f64,
    /// Measure at every step.
    #[serde(default = "default_true")]
    pub measure: bool,
}

impl From<MonochromatorSection> for InstrumentSection {
    fn from(s: MonochromatorSection) -> Self {
        Self::Monochromator(s)
    }
}

impl From<LockinSection> for InstrumentSection {
    fn from(s: LockinSection) -> Self {
        Self::Lockin(s)
    }
}

impl From<NdfSection> for InstrumentSection {
    fn from(s: NdfSection) -> Self {
        Self::Ndf(s)
    }
}

impl From<DetectorSection> for InstrumentSection {
    fn from(s: DetectorSection) -> Self {
        Self::Detector(s)
    }
}

/// Ordered list of sequences run back to back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    /// Sequences in run order.
    pub sequences: Vec<Sequence>,
}

impl Series {
    /// Series of `sequences`.
    pub fn new(sequences: Vec<Sequence>) -> Self {
        Self { sequences }
    }

    /// Number of sequences.
    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    /// No sequences.
    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// Load a series file. Each non-blank line not starting with `#` names a
    /// sequence file relative to the series file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read series file {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let sequences = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| Sequence::load(&base.join(line)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { sequences })
    }

    /// Save every sequence next to `path` and write the series file listing
    /// them. Existing files are only replaced when `overwrite` is set.
    pub fn save(&self, path: &Path, overwrite: bool) -> Result<()> {
        if path.exists() && !overwrite {
            bail!("Series file {} already exists", path.display());
        }
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let mut listing = String::new();
        for sequence in &self.sequences {
            let file_name = sequence.file_name();
            sequence.save(&base.join(&file_name), overwrite)?;
            listing.push_str(&file_name);
            listing.push('\n');
        }
        std::fs::write(path, listing)
            .with_context(|| format!("Failed to write series file {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VISIBLE: &str = r#"
name = "visible"
storage_path = "out"
sample_time = 0.5

[metadata]
shutter = false

[[instruments]]
kind = "lockin"
id = "sr830"
time_constant = 0.1
sample_rate = 64.0
sensitivity_transitions = [{ wavelength = 0.0, sensitivity = 0.001 }]

[[instruments]]
kind = "monochromator"
id = "cs260"
start_wavelength = 0.5
stop_wavelength = 0.6
step_wavelength = 0.05
grating_transitions = [{ wavelength = 0.0, grating = 1 }]
osf_transitions = [{ wavelength = 0.0, osf = 1 }]
"#;

    #[test]
    fn parses_tagged_sections() {
        let seq = Sequence::from_toml(VISIBLE).unwrap();
        assert_eq!(seq.name, "visible");
        assert_eq!(seq.storage_path, PathBuf::from("out"));
        assert!(!seq.metadata.shutter);
        assert!(seq.metadata.wavelength);
        assert_eq!(seq.instruments.len(), 2);
        assert_eq!(seq.instruments[0].kind(), InstrumentKind::Lockin);
        assert_eq!(seq.instruments[1].id(), "cs260");
        match &seq.instruments[1] {
            InstrumentSection::Monochromator(m) => assert_eq!(m.shutter, ShutterState::Open),
            other => panic!("unexpected section {other:?}"),
        }
        match &seq.instruments[0] {
            InstrumentSection::Lockin(l) => assert!(l.measure),
            other => panic!("unexpected section {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let text = "name = \"x\"\n[[instruments]]\nkind = \"laser\"\nid = \"l1\"\n";
        assert!(Sequence::from_toml(text).is_err());
    }

    #[test]
    fn metadata_flags_select_keys() {
        let flags = MetadataFlags {
            shutter: false,
            ..MetadataFlags::default()
        };
        assert!(flags.includes(InstrumentKind::Monochromator, "wavelength"));
        assert!(!flags.includes(InstrumentKind::Monochromator, "shutter"));
        assert!(flags.includes(InstrumentKind::Lockin, "sensitivity"));
    }

    #[test]
    fn sequence_save_respects_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visible.toml");
        let seq = Sequence::from_toml(VISIBLE).unwrap();
        seq.save(&path, false).unwrap();
        assert!(seq.save(&path, false).is_err());
        seq.save(&path, true).unwrap();
        assert_eq!(Sequence::load(&path).unwrap(), seq);
    }

    #[test]
    fn series_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let visible = Sequence::from_toml(VISIBLE).unwrap();
        let mut infrared = visible.clone();
        infrared.name = "infra red".into();
        let series = Series::new(vec![visible, infrared]);

        let path = dir.path().join("calibration.series");
        series.save(&path, false).unwrap();
        let listing = std::fs::read_to_string(&path).unwrap();
        assert_eq!(listing, "visible.toml\ninfra_red.toml\n");

        let loaded = Series::load(&path).unwrap();
        assert_eq!(loaded, series);
    }

    #[test]
    fn series_skips_comments_and_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("visible.toml"), VISIBLE).unwrap();
        let path = dir.path().join("run.series");
        std::fs::write(&path, "# visible only\n\nvisible.toml\n").unwrap();
        let series = Series::load(&path).unwrap();
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn missing_sequence_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.series");
        std::fs::write(&path, "absent.toml\n").unwrap();
        let err = Series::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("absent.toml"));
    }
}
