use std::io::{Read, Seek};

use log::{debug, warn};

use crate::actions::{ActionCtx, Phase};
use crate::archive::FirmwareArchive;
use crate::error::ApplyError;
use crate::fat::{FAT_CACHE_SIZE, FatController, FixedTimeProvider};
use crate::manifest::{self, Config, EventKind, Task};
use crate::output::Output;
use crate::progress::{Progress, ProgressReporter};
use crate::sparse::{ChunkSource, SparseStream};
use crate::task;

/// Scratch buffer for pulling resource payloads out of the archive.
const READ_BUF_SIZE: usize = 64 * 1024;

enum Pass {
    Plan,
    Run,
}

/// Apply a firmware archive to the output sink.
///
/// Verifies the manifest, selects a task by title prefix, computes the total
/// progress work, then streams the archive's resources through the selected
/// task's action lists. On failure the sink may be partially written; no
/// rollback is attempted.
pub fn run_apply<R: Read + Seek>(
    source: R,
    task_prefix: &str,
    output: Output,
    reporter: &mut dyn ProgressReporter,
    public_key: Option<&[u8; 32]>,
) -> Result<(), ApplyError> {
    let mut progress = Progress::new(reporter);
    progress.begin();

    let mut archive = FirmwareArchive::open(source)?;
    let cfg = manifest::parse_and_verify(archive.manifest_bytes(), archive.signature(), public_key)?;
    let time = FixedTimeProvider::new(cfg.creation_date);

    let task = task::select_task(&cfg, task_prefix, &output)
        .ok_or_else(|| ApplyError::NoApplicableTask(task_prefix.to_string()))?;
    debug!("selected task '{}'", task.title);

    let mut output = output;
    let mut fat = FatController::new(FAT_CACHE_SIZE);

    // Plan pass: total up the progress units for every event of the task.
    // A file-resource missing from the manifest is not worth failing over
    // here; the execute pass never sees it because the archive has no
    // matching entry.
    dispatch(
        &cfg, task, EventKind::Init, None, Phase::Init, Pass::Plan,
        &mut output, &mut fat, time, &mut progress, None,
    )?;
    for event in &task.on_resource {
        let id = event.resource.as_deref().unwrap_or_default();
        if cfg.resource(id).is_none() {
            warn!("can't find file-resource for '{id}'");
            continue;
        }
        dispatch(
            &cfg, task, EventKind::Resource, Some(id), Phase::File, Pass::Plan,
            &mut output, &mut fat, time, &mut progress, None,
        )?;
    }
    dispatch(
        &cfg, task, EventKind::Finish, None, Phase::Finish, Pass::Plan,
        &mut output, &mut fat, time, &mut progress, None,
    )?;

    // Execute pass: drive the archive entry by entry; each entry's payload
    // is deconcatenated by the sparse reader and fed to the matching
    // on-resource actions.
    dispatch(
        &cfg, task, EventKind::Init, None, Phase::Init, Pass::Run,
        &mut output, &mut fat, time, &mut progress, None,
    )?;

    let mut read_buf = vec![0u8; READ_BUF_SIZE];
    for index in archive.resource_indices() {
        let (id, mut entry) = archive.resource_entry(index)?;
        let resource = cfg
            .resource(&id)
            .ok_or_else(|| ApplyError::SparseMapInvalid {
                resource: id.clone(),
                msg: "archive entry has no file-resource section",
            })?;

        let mut stream = SparseStream::new(&resource.map, &mut entry, &mut read_buf);
        dispatch(
            &cfg, task, EventKind::Resource, Some(&id), Phase::File, Pass::Run,
            &mut output, &mut fat, time, &mut progress, Some(&mut stream),
        )?;

        // The payload hash covers the concatenated data segments, so it can
        // only be checked when the stream was drained.
        if let Some(expected) = &resource.sha256 {
            if stream.raw_consumed() == resource.map.data_size() {
                if !stream.verify_hash(expected) {
                    return Err(ApplyError::ResourceHash(id));
                }
            } else if stream.raw_consumed() > 0 {
                debug!("resource '{id}' partially consumed; skipping hash check");
            }
        }
    }

    dispatch(
        &cfg, task, EventKind::Finish, None, Phase::Finish, Pass::Run,
        &mut output, &mut fat, time, &mut progress, None,
    )?;

    // Flush the FAT cache in case it was used.
    fat.bind(&output, -1, time)?;

    // Close the sink before reporting 100%; the final flush can take a
    // while on real devices.
    output.finish()?;
    progress.complete();

    Ok(())
}

/// Resolve the event section for `kind` (+ parameter) and apply the pass
/// visitor to each of its actions in order.
///
/// The action context only exists for the duration of this call, so the
/// current event is exposed exactly while the visitor runs and released on
/// every exit path.
#[allow(clippy::too_many_arguments)]
fn dispatch<'a, 'k>(
    cfg: &'a Config,
    task: &'a Task,
    kind: EventKind,
    param: Option<&str>,
    phase: Phase,
    pass: Pass,
    output: &'a mut Output,
    fat: &'a mut FatController,
    time: FixedTimeProvider,
    progress: &'a mut Progress<'k>,
    stream: Option<&'a mut dyn ChunkSource>,
) -> Result<(), ApplyError> {
    let Some(event) = task.event(kind, param) else {
        return Ok(());
    };

    let mut ctx = ActionCtx {
        cfg,
        event,
        phase,
        output,
        fat,
        time,
        progress,
        stream,
    };

    let resource = event.resource.as_deref().and_then(|id| cfg.resource(id));
    for action in &event.actions {
        match pass {
            Pass::Plan => ctx.progress.plan(action.progress_units(resource)),
            Pass::Run => action.run(&mut ctx)?,
        }
    }
    Ok(())
}
