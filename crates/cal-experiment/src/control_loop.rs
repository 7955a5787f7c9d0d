//! Expanding a [`Series`] into a flat, step-aligned [`ControlLoop`].
//!
//! Each sequence is expanded on its own: the monochromator section produces the
//! wavelength list, every other section derives its per-step settings from
//! those wavelengths. Sections that come before the monochromator in the file
//! are deferred until the wavelengths exist. Sequences are then concatenated;
//! instruments that a sequence does not mention get empty commands for its
//! steps so every instrument has exactly one command per step.

use crate::error::BuildError;
use crate::sequence::{
    DetectorSection, InstrumentKind, InstrumentSection, LockinSection, MetadataFlags,
    MonochromatorSection, NdfSection, Sequence, Series,
};
use crate::transition_table::{resolve, Threshold};
use cal_core::{MeasureRequest, Parameters};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Parameter names used in step commands.
pub mod keys {
    /// Wavelength (µm on the monochromator, nm on the detector).
    pub const WAVELENGTH: &str = "wavelength";
    /// Grating index.
    pub const GRATING: &str = "grating";
    /// Order-sorting filter index.
    pub const ORDER_SORT_FILTER: &str = "order_sort_filter";
    /// Shutter, `"open"` or `"closed"`.
    pub const SHUTTER: &str = "shutter";
    /// Lock-in sensitivity.
    pub const SENSITIVITY: &str = "sensitivity";
    /// Lock-in time constant.
    pub const TIME_CONSTANT: &str = "time_constant";
    /// Acquisition rate.
    pub const SAMPLE_RATE: &str = "sample_rate";
    /// Filter wheel position.
    pub const POSITION: &str = "position";
}

/// Wavelength rounding grid (µm).
const WAVELENGTH_RESOLUTION: f64 = 1e-9;
const WAVELENGTH_SCALE: f64 = 1e9;

/// What one instrument does in one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepCommand {
    /// Parameters to apply (empty for a no-op).
    pub set: Parameters,
    /// Measurement to take after moving, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measure: Option<MeasureRequest>,
}

impl StepCommand {
    /// No-op command.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Whether the command neither moves nor measures.
    pub fn is_idle(&self) -> bool {
        self.set.is_empty() && self.measure.is_none()
    }
}

/// The steps contributed by one sequence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SequenceSpan {
    /// Sequence name.
    pub name: String,
    /// Position of the sequence in the series.
    pub series_index: usize,
    /// First flat step index.
    pub start: usize,
    /// Number of steps.
    pub len: usize,
    /// Storage directory.
    pub storage_path: PathBuf,
    /// Seconds per measurement.
    pub sample_time: f64,
    /// Metadata inclusion flags.
    pub metadata: MetadataFlags,
}

impl SequenceSpan {
    /// Whether flat index `index` falls in this span.
    pub fn contains(&self, index: usize) -> bool {
        index >= self.start && index < self.start + self.len
    }
}

/// Step-aligned command lists for every instrument of a series.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControlLoop {
    commands: BTreeMap<String, Vec<StepCommand>>,
    kinds: BTreeMap<String, InstrumentKind>,
    spans: Vec<SequenceSpan>,
    len: usize,
}

impl ControlLoop {
    /// Number of steps.
    pub fn len(&self) -> usize {
        self.len
    }

    /// No steps.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Instrument ids, sorted.
    pub fn instruments(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Kind of instrument `id`.
    pub fn kind(&self, id: &str) -> Option<InstrumentKind> {
        self.kinds.get(id).copied()
    }

    /// Every command for `id`.
    pub fn commands(&self, id: &str) -> Option<&[StepCommand]> {
        self.commands.get(id).map(Vec::as_slice)
    }

    /// Commands for step `index`, in instrument id order.
    pub fn step(&self, index: usize) -> Vec<(&str, &StepCommand)> {
        self.commands
            .iter()
            .filter_map(|(id, cmds)| cmds.get(index).map(|c| (id.as_str(), c)))
            .collect()
    }

    /// Per-sequence spans, in series order.
    pub fn spans(&self) -> &[SequenceSpan] {
        &self.spans
    }

    /// Span containing step `index`.
    pub fn span_at(&self, index: usize) -> Option<&SequenceSpan> {
        self.spans.iter().find(|s| s.contains(index))
    }

    /// `(series_index, sequence_index)` of step `index`.
    pub fn position(&self, index: usize) -> Option<(usize, usize)> {
        self.span_at(index)
            .map(|span| (span.series_index, index - span.start))
    }

    /// Check that every instrument has exactly one command per step.
    pub fn validate(&self) -> Result<(), BuildError> {
        for (id, cmds) in &self.commands {
            if cmds.len() != self.len {
                return Err(BuildError::Misaligned {
                    instrument: id.clone(),
                    actual: cmds.len(),
                    expected: self.len,
                });
            }
        }
        let spanned: usize = self.spans.iter().map(|s| s.len).sum();
        if spanned != self.len {
            return Err(BuildError::Misaligned {
                instrument: "<spans>".into(),
                actual: spanned,
                expected: self.len,
            });
        }
        Ok(())
    }
}

/// Builds control loops from series. Holds no state between builds.
#[derive(Debug, Default, Clone, Copy)]
pub struct ControlLoopBuilder;

impl ControlLoopBuilder {
    /// Expand and flatten every sequence of `series`.
    pub fn build(&self, series: &Series) -> Result<ControlLoop, BuildError> {
        let expansions = series
            .sequences
            .iter()
            .map(expand_sequence)
            .collect::<Result<Vec<_>, _>>()?;

        let mut kinds: BTreeMap<String, InstrumentKind> = BTreeMap::new();
        for expansion in &expansions {
            for (id, kind) in &expansion.kinds {
                match kinds.get(id) {
                    Some(existing) if existing != kind => {
                        return Err(BuildError::ConflictingKind {
                            instrument: id.clone(),
                            first: existing.to_string(),
                            second: kind.to_string(),
                        })
                    }
                    Some(_) => {}
                    None => {
                        kinds.insert(id.clone(), *kind);
                    }
                }
            }
        }
        let ids: BTreeSet<&String> = kinds.keys().collect();

        let mut control_loop = ControlLoop {
            kinds: kinds.clone(),
            ..ControlLoop::default()
        };
        for (series_index, (sequence, expansion)) in
            series.sequences.iter().zip(expansions).enumerate()
        {
            let Expansion {
                len, mut commands, ..
            } = expansion;
            for id in &ids {
                let cmds = commands
                    .remove(*id)
                    .unwrap_or_else(|| vec![StepCommand::idle(); len]);
                control_loop
                    .commands
                    .entry((*id).clone())
                    .or_default()
                    .extend(cmds);
            }
            control_loop.spans.push(SequenceSpan {
                name: sequence.name.clone(),
                series_index,
                start: control_loop.len,
                len,
                storage_path: sequence.storage_path.clone(),
                sample_time: sequence.sample_time,
                metadata: sequence.metadata,
            });
            control_loop.len += len;
        }

        control_loop.validate()?;
        Ok(control_loop)
    }
}

struct Expansion {
    len: usize,
    commands: BTreeMap<String, Vec<StepCommand>>,
    kinds: BTreeMap<String, InstrumentKind>,
}

/// Wavelengths and deferred sections of the sequence being expanded.
#[derive(Default)]
struct SequencePass<'a> {
    waves: Option<Vec<f64>>,
    deferred: Vec<&'a InstrumentSection>,
}

fn expand_sequence(sequence: &Sequence) -> Result<Expansion, BuildError> {
    let mut pass = SequencePass::default();
    let mut commands = BTreeMap::new();
    let mut kinds = BTreeMap::new();

    for section in &sequence.instruments {
        if kinds.insert(section.id().to_string(), section.kind()).is_some() {
            return Err(BuildError::DuplicateInstrument {
                sequence: sequence.name.clone(),
                instrument: section.id().to_string(),
            });
        }
        match (section, &pass.waves) {
            (InstrumentSection::Monochromator(mono), None) => {
                let (waves, cmds) = expand_monochromator(sequence, mono)?;
                commands.insert(mono.id.clone(), cmds);
                pass.waves = Some(waves);
            }
            (InstrumentSection::Monochromator(_), Some(_)) => {
                return Err(BuildError::DuplicateMonochromator {
                    sequence: sequence.name.clone(),
                });
            }
            (dependent, Some(waves)) => {
                commands.insert(
                    dependent.id().to_string(),
                    expand_dependent(sequence, dependent, waves)?,
                );
            }
            (dependent, None) => pass.deferred.push(dependent),
        }
    }

    if let Some(first) = pass.deferred.first() {
        let waves = pass
            .waves
            .as_deref()
            .ok_or_else(|| BuildError::MissingWavelengths {
                sequence: sequence.name.clone(),
                instrument: first.id().to_string(),
            })?;
        for dependent in &pass.deferred {
            commands.insert(
                dependent.id().to_string(),
                expand_dependent(sequence, dependent, waves)?,
            );
        }
    }

    Ok(Expansion {
        len: pass.waves.as_ref().map_or(0, Vec::len),
        commands,
        kinds,
    })
}

fn expand_dependent(
    sequence: &Sequence,
    section: &InstrumentSection,
    waves: &[f64],
) -> Result<Vec<StepCommand>, BuildError> {
    match section {
        InstrumentSection::Lockin(lockin) => expand_lockin(sequence, lockin, waves),
        InstrumentSection::Ndf(ndf) => expand_ndf(sequence, ndf, waves),
        InstrumentSection::Detector(detector) => Ok(expand_detector(sequence, detector, waves)),
        InstrumentSection::Monochromator(_) => Err(BuildError::DuplicateMonochromator {
            sequence: sequence.name.clone(),
        }),
    }
}

fn table<T: Threshold>(
    sequence: &Sequence,
    instrument: &str,
    name: &'static str,
    entries: &[T],
    waves: &[f64],
) -> Result<Vec<T::Value>, BuildError> {
    resolve(entries, waves).ok_or_else(|| BuildError::EmptyTransitionTable {
        sequence: sequence.name.clone(),
        instrument: instrument.to_string(),
        table: name,
    })
}

fn expand_monochromator(
    sequence: &Sequence,
    mono: &MonochromatorSection,
) -> Result<(Vec<f64>, Vec<StepCommand>), BuildError> {
    let waves = arange(mono.start_wavelength, mono.stop_wavelength, mono.step_wavelength)
        .ok_or_else(|| BuildError::InvalidRange {
            sequence: sequence.name.clone(),
            start: mono.start_wavelength,
            stop: mono.stop_wavelength,
            step: mono.step_wavelength,
        })?;
    let gratings = table(sequence, &mono.id, "grating", &mono.grating_transitions, &waves)?;
    let filters = table(sequence, &mono.id, "osf", &mono.osf_transitions, &waves)?;

    let commands = waves
        .iter()
        .zip(gratings)
        .zip(filters)
        .map(|((wavelength, grating), osf)| StepCommand {
            set: Parameters::from([
                (keys::WAVELENGTH.to_string(), json!(wavelength)),
                (keys::GRATING.to_string(), json!(grating)),
                (keys::ORDER_SORT_FILTER.to_string(), json!(osf)),
                (keys::SHUTTER.to_string(), json!(mono.shutter.as_str())),
            ]),
            measure: None,
        })
        .collect();
    Ok((waves, commands))
}

fn expand_lockin(
    sequence: &Sequence,
    lockin: &LockinSection,
    waves: &[f64],
) -> Result<Vec<StepCommand>, BuildError> {
    let sensitivities = table(
        sequence,
        &lockin.id,
        "sensitivity",
        &lockin.sensitivity_transitions,
        waves,
    )?;
    Ok(sensitivities
        .into_iter()
        .map(|sensitivity| StepCommand {
            set: Parameters::from([
                (keys::SENSITIVITY.to_string(), json!(sensitivity)),
                (keys::TIME_CONSTANT.to_string(), json!(lockin.time_constant)),
                (keys::SAMPLE_RATE.to_string(), json!(lockin.sample_rate)),
            ]),
            measure: lockin.measure.then(|| MeasureRequest {
                sample_rate: lockin.sample_rate,
                sample_time: sequence.sample_time,
            }),
        })
        .collect())
}

fn expand_ndf(
    sequence: &Sequence,
    ndf: &NdfSection,
    waves: &[f64],
) -> Result<Vec<StepCommand>, BuildError> {
    let positions = table(sequence, &ndf.id, "position", &ndf.position_transitions, waves)?;
    Ok(positions
        .into_iter()
        .map(|position| StepCommand {
            set: Parameters::from([(keys::POSITION.to_string(), json!(position))]),
            measure: None,
        })
        .collect())
}

fn expand_detector(
    sequence: &Sequence,
    detector: &DetectorSection,
    waves: &[f64],
) -> Vec<StepCommand> {
    waves
        .iter()
        .map(|w| StepCommand {
            set: Parameters::from([
                (keys::WAVELENGTH.to_string(), json!(round_to_grid(w * 1e3))),
                (keys::SAMPLE_RATE.to_string(), json!(detector.sample_rate)),
            ]),
            measure: detector.measure.then(|| MeasureRequest {
                sample_rate: detector.sample_rate,
                sample_time: sequence.sample_time,
            }),
        })
        .collect()
}

fn round_to_grid(value: f64) -> f64 {
    (value * WAVELENGTH_SCALE).round() / WAVELENGTH_SCALE
}

/// `start, start + step, …` up to but excluding `stop`, rounded to 1e-9.
///
/// Returns `None` for a non-positive step or non-finite bounds.
pub fn arange(start: f64, stop: f64, step: f64) -> Option<Vec<f64>> {
    if !(step > 0.0) || !start.is_finite() || !stop.is_finite() {
        return None;
    }
    let count = ((stop - start) / step - WAVELENGTH_RESOLUTION).ceil();
    if count <= 0.0 {
        return Some(Vec::new());
    }
    Some(
        (0..count as usize)
            .map(|i| round_to_grid(start + i as f64 * step))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transition_table::{
        GratingTransition, OsfTransition, PositionTransition, SensitivityTransition,
    };

    fn mono(start: f64, stop: f64, step: f64) -> MonochromatorSection {
        MonochromatorSection {
            id: "cs260".into(),
            start_wavelength: start,
            stop_wavelength: stop,
            step_wavelength: step,
            shutter: Default::default(),
            grating_transitions: vec![GratingTransition { wavelength: 0.0, grating: 1 }],
            osf_transitions: vec![OsfTransition { wavelength: 0.0, osf: 1 }],
        }
    }

    fn lockin(id: &str) -> LockinSection {
        LockinSection {
            id: id.into(),
            time_constant: 0.1,
            sample_rate: 64.0,
            sensitivity_transitions: vec![SensitivityTransition {
                wavelength: 0.0,
                sensitivity: 1e-3,
            }],
            measure: true,
        }
    }

    fn ndf() -> NdfSection {
        NdfSection {
            id: "ndf".into(),
            position_transitions: vec![
                PositionTransition { wavelength: 0.0, position: 1 },
                PositionTransition { wavelength: 0.52, position: 2 },
            ],
        }
    }

    #[test]
    fn arange_excludes_stop() {
        assert_eq!(arange(0.5, 0.6, 0.05).unwrap(), vec![0.5, 0.55]);
        assert_eq!(arange(0.5, 0.65, 0.05).unwrap(), vec![0.5, 0.55, 0.6]);
        assert_eq!(arange(1.0, 1.0, 0.1).unwrap(), Vec::<f64>::new());
        assert!(arange(0.5, 0.6, 0.0).is_none());
        assert!(arange(0.5, 0.6, -0.1).is_none());
    }

    #[test]
    fn single_sequence_scenario() {
        let seq = Sequence::new("visible")
            .with_instrument(mono(0.5, 0.6, 0.05))
            .with_instrument(lockin("sr830"));
        let cl = ControlLoopBuilder.build(&Series::new(vec![seq])).unwrap();

        assert_eq!(cl.len(), 2);
        let cs260 = cl.commands("cs260").unwrap();
        assert_eq!(cs260[0].set[keys::WAVELENGTH], json!(0.5));
        assert_eq!(cs260[1].set[keys::WAVELENGTH], json!(0.55));
        assert_eq!(cs260[0].set[keys::GRATING], json!(1));
        assert_eq!(cs260[0].set[keys::SHUTTER], json!("open"));
        let sr830 = cl.commands("sr830").unwrap();
        assert!(sr830.iter().all(|c| c.measure.is_some()));
        assert_eq!(cl.position(1), Some((0, 1)));
    }

    #[test]
    fn sequences_concatenate_and_pad_missing_instruments() {
        let first = Sequence::new("first")
            .with_instrument(mono(0.5, 0.65, 0.05))
            .with_instrument(lockin("sr830"));
        let second = Sequence::new("second")
            .with_instrument(mono(1.0, 1.2, 0.1))
            .with_instrument(lockin("sr510"));
        let cl = ControlLoopBuilder
            .build(&Series::new(vec![first, second]))
            .unwrap();

        assert_eq!(cl.len(), 5);
        assert_eq!(
            cl.instruments().collect::<Vec<_>>(),
            vec!["cs260", "sr510", "sr830"]
        );
        for id in ["cs260", "sr510", "sr830"] {
            assert_eq!(cl.commands(id).unwrap().len(), 5);
        }
        let sr830 = cl.commands("sr830").unwrap();
        assert!(!sr830[2].is_idle());
        assert!(sr830[3].is_idle() && sr830[4].is_idle());
        let sr510 = cl.commands("sr510").unwrap();
        assert!(sr510[..3].iter().all(StepCommand::is_idle));

        let waves: Vec<_> = cl
            .commands("cs260")
            .unwrap()
            .iter()
            .map(|c| c.set[keys::WAVELENGTH].as_f64().unwrap())
            .collect();
        assert_eq!(waves, vec![0.5, 0.55, 0.6, 1.0, 1.1]);
        assert_eq!(cl.position(3), Some((1, 0)));
        assert_eq!(cl.span_at(4).unwrap().name, "second");
        cl.validate().unwrap();
    }

    #[test]
    fn builder_is_idempotent() {
        let series = Series::new(vec![
            Sequence::new("a")
                .with_instrument(ndf())
                .with_instrument(mono(0.5, 0.6, 0.01)),
            Sequence::new("b").with_instrument(mono(0.7, 0.8, 0.02)),
        ]);
        let builder = ControlLoopBuilder;
        assert_eq!(builder.build(&series).unwrap(), builder.build(&series).unwrap());
    }

    #[test]
    fn sections_before_monochromator_are_deferred() {
        let seq = Sequence::new("deferred")
            .with_instrument(ndf())
            .with_instrument(DetectorSection {
                id: "s401c".into(),
                sample_rate: 10.0,
                measure: true,
            })
            .with_instrument(mono(0.5, 0.6, 0.01));
        let cl = ControlLoopBuilder.build(&Series::new(vec![seq])).unwrap();

        assert_eq!(cl.len(), 10);
        let positions: Vec<_> = cl
            .commands("ndf")
            .unwrap()
            .iter()
            .map(|c| c.set[keys::POSITION].as_u64().unwrap())
            .collect();
        assert_eq!(positions, vec![1, 1, 1, 2, 2, 2, 2, 2, 2, 2]);
        let detector = cl.commands("s401c").unwrap();
        assert_eq!(detector[0].set[keys::WAVELENGTH], json!(500.0));
        assert_eq!(detector[3].set[keys::WAVELENGTH], json!(530.0));
    }

    #[test]
    fn wavelengths_do_not_leak_between_sequences() {
        let series = Series::new(vec![
            Sequence::new("with_mono").with_instrument(mono(0.5, 0.6, 0.05)),
            Sequence::new("without_mono").with_instrument(ndf()),
        ]);
        let err = ControlLoopBuilder.build(&series).unwrap_err();
        assert_eq!(
            err,
            BuildError::MissingWavelengths {
                sequence: "without_mono".into(),
                instrument: "ndf".into()
            }
        );
    }

    #[test]
    fn empty_transition_table_is_an_error() {
        let mut section = mono(0.5, 0.6, 0.05);
        section.osf_transitions.clear();
        let series = Series::new(vec![Sequence::new("bad").with_instrument(section)]);
        assert!(matches!(
            ControlLoopBuilder.build(&series),
            Err(BuildError::EmptyTransitionTable { table: "osf", .. })
        ));
    }

    #[test]
    fn invalid_step_is_an_error() {
        let series = Series::new(vec![Sequence::new("bad").with_instrument(mono(0.5, 0.6, 0.0))]);
        assert!(matches!(
            ControlLoopBuilder.build(&series),
            Err(BuildError::InvalidRange { .. })
        ));
    }

    #[test]
    fn duplicate_instrument_in_sequence_is_an_error() {
        let seq = Sequence::new("dup")
            .with_instrument(mono(0.5, 0.6, 0.05))
            .with_instrument(lockin("sr830"))
            .with_instrument(lockin("sr830"));
        assert!(matches!(
            ControlLoopBuilder.build(&Series::new(vec![seq])),
            Err(BuildError::DuplicateInstrument { .. })
        ));
    }
}
