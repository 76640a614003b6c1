use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek};
use std::path::Path;

use crate::error::ApplyError;
use crate::orchestrator;
use crate::output::Output;
use crate::progress::ProgressReporter;

/// Apply a firmware archive to an output sink.
///
/// `source` is the archive (any seekable reader); `task_prefix` selects the
/// first applicable task whose title starts with it; `public_key` is a
/// 32-byte Ed25519 key, or `None` to skip signature checking.
///
/// Progress is reported synchronously as integers in [0, 100]. On failure
/// the sink may be partially written: callers must treat a failed apply as
/// destructive.
pub fn apply<R: Read + Seek>(
    source: R,
    task_prefix: &str,
    output: Output,
    reporter: &mut dyn ProgressReporter,
    public_key: Option<&[u8; 32]>,
) -> Result<(), ApplyError> {
    orchestrator::run_apply(source, task_prefix, output, reporter, public_key)
}

/// Convenience wrapper over [`apply`] taking filesystem paths for the
/// archive and the destination device or image file.
pub fn apply_path(
    firmware: &Path,
    task_prefix: &str,
    output: &Path,
    reporter: &mut dyn ProgressReporter,
    public_key: Option<&[u8; 32]>,
) -> Result<(), ApplyError> {
    let source = File::open(firmware)?;
    let sink = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(output)?;
    apply(
        BufReader::new(source),
        task_prefix,
        Output::from_file(sink),
        reporter,
        public_key,
    )
}
