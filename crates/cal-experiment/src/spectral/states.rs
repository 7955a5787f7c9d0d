//! Actions of the spectral calibration states.

use super::context::{LoopIndices, MachineInput, SpectralContext};
use super::moves::apply_parameters;
use super::{CONTROL_LOOP_COMPLETE, MODE, MODE_AUTO, MODE_MANUAL, WAITING_COMPLETE};
use crate::control_loop::ControlLoop;
use crate::machine::{ActionResult, MachineContext, MachineFault};
use crate::sequence::MetadataFlags;
use anyhow::{anyhow, bail, Context};
use cal_core::{
    diff, ArchiveRecord, MeasureRequest, MessageLevel, ParameterQuery, Parameters, RecorderEvent,
    ViewerEvent,
};
use cal_storage::ExpIdGenerator;
use chrono::Utc;
use futures::future::try_join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Archive metadata key for parameter `key` of instrument `id`,
/// e.g. `CS260 ORDER SORT FILTER`.
pub fn metadata_key(id: &str, key: &str) -> String {
    format!("{} {}", id.to_uppercase(), key.replace('_', " ").to_uppercase())
}

/// Readbacks selected by `flags`, under their archive keys.
pub fn build_metadata(
    control_loop: &ControlLoop,
    flags: &MetadataFlags,
    readbacks: &BTreeMap<String, Parameters>,
) -> BTreeMap<String, Value> {
    let mut metadata = BTreeMap::new();
    for (id, parameters) in readbacks {
        let Some(kind) = control_loop.kind(id) else {
            continue;
        };
        for (key, value) in parameters {
            if flags.includes(kind, key) {
                metadata.insert(metadata_key(id, key), value.clone());
            }
        }
    }
    metadata
}

/// Initializing: open every instrument and publish a first snapshot.
pub(crate) async fn initialize(ctx: Arc<SpectralContext>, _cancel: CancellationToken) -> ActionResult {
    ctx.registry.open_all()?;
    let snapshot = ctx.registry.snapshot_all().await?;
    let count = snapshot.len();
    for (instrument, parameters) in snapshot {
        ctx.sink.emit_to_viewer(ViewerEvent::Parameters {
            instrument,
            parameters,
        });
    }
    info!(instruments = count, "Bench initialised");
    ctx.notify(MessageLevel::Info, format!("{} instruments initialised", count));
    Ok(())
}

/// Waiting: block until a manual command or a series arrives.
pub(crate) async fn wait_for_input(ctx: Arc<SpectralContext>, cancel: CancellationToken) -> ActionResult {
    ctx.reset_for_waiting();

    let received = {
        let mut input = ctx.input.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = input.recv() => received,
        }
    };
    let input = received.ok_or_else(|| anyhow!("Input channel closed"))?;

    let mode = match &input {
        MachineInput::Manual(_) => MODE_MANUAL,
        MachineInput::Auto(_) => MODE_AUTO,
    };
    debug!(mode, "Input received");
    ctx.run.lock().pending = Some(input);
    ctx.args().set(MODE, mode);
    ctx.args().set(WAITING_COMPLETE, true);
    Ok(())
}

/// Thinking: expand the series and start (or resume) the run.
pub(crate) fn plan_run(ctx: &SpectralContext) -> ActionResult {
    let pending = ctx.run.lock().pending.take();
    let series = match pending {
        Some(MachineInput::Auto(series)) => series,
        _ => bail!("No series to run"),
    };
    let control_loop = ctx
        .builder
        .build(&series)
        .context("Failed to build control loop")?;
    let steps = control_loop.len();
    let resuming = ctx.take_paused();

    let (run_uid, start) = {
        let mut run = ctx.run.lock();
        let start = if resuming && run.indices.control_loop_index < steps {
            run.indices.control_loop_index
        } else {
            0
        };
        let (series_index, sequence_index) = control_loop.position(start).unwrap_or((0, 0));
        run.indices = LoopIndices {
            control_loop_index: start,
            series_index,
            sequence_index,
        };
        if start == 0 {
            run.last_archived = None;
        }
        if start == 0 || run.run_uid.is_none() {
            run.run_uid = Some(Uuid::new_v4().to_string());
            run.exp_ids = Some(ExpIdGenerator::now());
        }
        run.control_loop = Some(Arc::new(control_loop));
        (run.run_uid.clone().unwrap_or_default(), start)
    };

    info!(run_uid = %run_uid, steps, start, "Run started");
    ctx.sink.emit_to_viewer(ViewerEvent::RunStarted {
        run_uid,
        steps,
        start_index: start,
    });
    if start > 0 {
        ctx.notify(MessageLevel::Info, format!("Resuming at step {}", start));
    }
    Ok(())
}

/// Manual: apply the pending manual command.
pub(crate) async fn apply_manual(ctx: Arc<SpectralContext>, cancel: CancellationToken) -> ActionResult {
    let pending = ctx.run.lock().pending.take();
    let command = match pending {
        Some(MachineInput::Manual(command)) => command,
        _ => bail!("No manual command to apply"),
    };

    for (id, requested) in &command.commands {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let instrument = ctx.registry.require(id)?;
        let readback = apply_parameters(instrument.as_ref(), requested)
            .await
            .with_context(|| format!("Manual move of '{}' failed", id))?;
        ctx.sink.emit_to_viewer(ViewerEvent::Parameters {
            instrument: id.clone(),
            parameters: readback,
        });
    }
    ctx.notify(
        MessageLevel::Info,
        format!("Manual command applied to {} instruments", command.commands.len()),
    );
    Ok(())
}

/// Moving: finish the run, or bring every instrument to the current step.
pub(crate) async fn move_instruments(ctx: Arc<SpectralContext>, cancel: CancellationToken) -> ActionResult {
    let (control_loop, index) = ctx.current_step()?;

    if index >= control_loop.len() {
        let run_uid = {
            let mut run = ctx.run.lock();
            run.indices = LoopIndices::default();
            run.control_loop = None;
            run.exp_ids = None;
            run.run_uid.take().unwrap_or_default()
        };
        ctx.args().set(CONTROL_LOOP_COMPLETE, true);
        info!(run_uid = %run_uid, steps = control_loop.len(), "Run complete");
        ctx.sink.emit_to_viewer(ViewerEvent::RunComplete {
            run_uid,
            steps: control_loop.len(),
        });
        ctx.notify(
            MessageLevel::Info,
            format!("Run complete after {} steps", control_loop.len()),
        );
        return Ok(());
    }

    ctx.args().set(CONTROL_LOOP_COMPLETE, false);
    {
        let mut run = ctx.run.lock();
        if let Some((series_index, sequence_index)) = control_loop.position(index) {
            run.indices.series_index = series_index;
            run.indices.sequence_index = sequence_index;
        }
        run.readbacks.clear();
        run.requested.clear();
        run.measurements.clear();
        run.summaries.clear();
    }

    for (id, command) in control_loop.step(index) {
        if command.is_idle() {
            continue;
        }
        if cancel.is_cancelled() {
            return Ok(());
        }
        let instrument = ctx.registry.require(id)?;
        let readback = apply_parameters(instrument.as_ref(), &command.set)
            .await
            .with_context(|| format!("Moving '{}' for step {} failed", id, index))?;
        ctx.sink.emit_to_viewer(ViewerEvent::Parameters {
            instrument: id.to_string(),
            parameters: readback.clone(),
        });
        ctx.run.lock().readbacks.insert(id.to_string(), readback);
    }
    debug!(index, "Instruments in position");
    Ok(())
}

/// Measuring: run every requested measurement concurrently.
pub(crate) async fn measure(ctx: Arc<SpectralContext>, cancel: CancellationToken) -> ActionResult {
    let (control_loop, index) = ctx.current_step()?;
    let requests: Vec<(String, MeasureRequest)> = control_loop
        .step(index)
        .into_iter()
        .filter_map(|(id, command)| command.measure.clone().map(|m| (id.to_string(), m)))
        .collect();
    ctx.run.lock().requested = requests.iter().map(|(id, _)| id.clone()).collect();

    let acquisitions = requests.iter().map(|(id, request)| {
        let measurable = ctx.registry.get_measurable(id);
        let cancel = cancel.clone();
        async move {
            let measurable =
                measurable.ok_or_else(|| anyhow!("Instrument '{}' cannot measure", id))?;
            measurable
                .measure(request, &cancel)
                .await
                .with_context(|| format!("Measurement on '{}' failed", id))
        }
    });
    let measurements = try_join_all(acquisitions).await?;

    for ((id, _), measurement) in requests.into_iter().zip(measurements) {
        ctx.sink.emit_to_recorder(RecorderEvent::Samples {
            index,
            measurement: measurement.clone(),
        });
        ctx.run.lock().measurements.insert(id, measurement);
    }
    Ok(())
}

/// Checking: warn about empty measurements and readbacks that missed their
/// target.
pub(crate) fn check_step(ctx: &SpectralContext) -> ActionResult {
    let (control_loop, index) = ctx.current_step()?;
    let mut problems = Vec::new();
    {
        let run = ctx.run.lock();
        for id in &run.requested {
            if run.measurements.get(id).map_or(true, |m| m.samples.is_empty()) {
                problems.push(format!("'{}' returned no samples at step {}", id, index));
            }
        }
        for (id, command) in control_loop.step(index) {
            if let Some(readback) = run.readbacks.get(id) {
                let missed = diff(readback, &command.set);
                if !missed.is_empty() {
                    let keys: Vec<&str> = missed.keys().map(String::as_str).collect();
                    problems.push(format!(
                        "'{}' did not reach {} at step {}",
                        id,
                        keys.join(", "),
                        index
                    ));
                }
            }
        }
    }
    for problem in problems {
        warn!(index, "{}", problem);
        ctx.notify(MessageLevel::Warning, problem);
    }
    Ok(())
}

/// Compressing: reduce raw samples to per-channel statistics.
pub(crate) fn compress(ctx: &SpectralContext) -> ActionResult {
    let mut run = ctx.run.lock();
    let summaries = run
        .measurements
        .iter()
        .map(|(id, m)| (id.clone(), m.summarize()))
        .collect();
    run.summaries = summaries;
    Ok(())
}

/// Archiving: read back, build the record and write it out.
pub(crate) async fn archive(ctx: Arc<SpectralContext>, _cancel: CancellationToken) -> ActionResult {
    let (control_loop, index) = ctx.current_step()?;
    let span = control_loop
        .span_at(index)
        .cloned()
        .ok_or_else(|| anyhow!("Step {} belongs to no sequence", index))?;

    let mut fresh = BTreeMap::new();
    for (id, command) in control_loop.step(index) {
        if command.is_idle() {
            continue;
        }
        let instrument = ctx.registry.require(id)?;
        let readback = instrument
            .get_parameters(&ParameterQuery::All)
            .await
            .with_context(|| format!("Readback of '{}' failed", id))?;
        fresh.insert(id.to_string(), readback);
    }

    let (exp_id, readbacks, summaries, measurements) = {
        let mut run = ctx.run.lock();
        let exp_id = run
            .exp_ids
            .as_ref()
            .map(|ids| ids.id_for(index))
            .ok_or_else(|| anyhow!("Run has no experiment id generator"))?;
        run.readbacks.extend(fresh);
        (
            exp_id,
            run.readbacks.clone(),
            run.summaries.clone(),
            run.measurements.clone(),
        )
    };

    let record = ArchiveRecord {
        exp_id: exp_id.clone(),
        sequence_name: span.name.clone(),
        series_index: span.series_index,
        sequence_index: index - span.start,
        timestamp: Utc::now(),
        metadata: build_metadata(&control_loop, &span.metadata, &readbacks),
        measurements: summaries,
    };

    if ctx.settings.write_json {
        let path = ctx.archive.append(&span.storage_path, &record).await?;
        ctx.mark_archived(index);
        debug!(path = %path.display(), exp_id = %exp_id, "Record archived");
    }
    if ctx.settings.write_csv {
        for measurement in measurements.values() {
            ctx.csv
                .append(&span.storage_path, &span.name, &exp_id, measurement)
                .await?;
        }
    }
    ctx.mark_archived(index);

    ctx.sink.emit_to_recorder(RecorderEvent::Record(record));
    ctx.sink.emit_to_viewer(ViewerEvent::StepArchived {
        exp_id: exp_id.clone(),
        index,
    });
    info!(exp_id = %exp_id, index, sequence = %span.name, "Step archived");
    Ok(())
}

/// Resetting: advance to the next step.
pub(crate) fn advance(ctx: &SpectralContext) -> ActionResult {
    let mut run = ctx.run.lock();
    run.indices.control_loop_index += 1;
    let next = run.indices.control_loop_index;
    let position = run.control_loop.as_ref().and_then(|cl| cl.position(next));
    if let Some((series_index, sequence_index)) = position {
        run.indices.series_index = series_index;
        run.indices.sequence_index = sequence_index;
    }
    Ok(())
}

/// Error handler: record the fault for the operator.
pub(crate) fn report_fault(ctx: &SpectralContext, fault: &MachineFault) {
    error!(state = %fault.state, error = %fault.message, "Calibration halted");
    ctx.messages()
        .push(MessageLevel::Error, format!("Calibration halted: {}", fault));
    ctx.sink.emit_to_viewer(ViewerEvent::Error {
        state: fault.state.clone(),
        message: fault.message.clone(),
    });
}
