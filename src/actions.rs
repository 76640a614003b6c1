use std::io::{self, Read, Write};

use crate::error::ApplyError;
use crate::fat::{FatController, FixedTimeProvider, SECTOR_SIZE};
use crate::manifest::{Config, Event, Resource};
use crate::mbr;
use crate::output::Output;
use crate::progress::Progress;
use crate::sparse::ChunkSource;

/// Progress accounted for actions that do a fixed amount of work; write
/// actions account their resource's data byte count instead.
pub const ACTION_PROGRESS_UNITS: u64 = 4096;

/// Which part of the task lifecycle is currently dispatching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    File,
    Finish,
}

/// Capabilities exposed to actions while their event dispatches.
///
/// One context is built per event dispatch and dropped when the dispatch
/// ends, so the current event can never outlive it. `stream` is only present
/// for `on-resource` events during the execute pass.
pub struct ActionCtx<'a, 'k> {
    pub cfg: &'a Config,
    pub event: &'a Event,
    pub phase: Phase,
    pub output: &'a mut Output,
    pub fat: &'a mut FatController,
    pub time: FixedTimeProvider,
    pub progress: &'a mut Progress<'k>,
    pub stream: Option<&'a mut (dyn ChunkSource + 'a)>,
}

/// One funlist entry: a named operation with parsed parameters.
///
/// Every variant supports the same two operations: progress accounting
/// (plan pass) and execution (run pass).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    RawWrite {
        dest_block_offset: u64,
    },
    FatMkfs {
        block_offset: u64,
        block_count: u32,
    },
    FatWrite {
        block_offset: u64,
        filename: String,
    },
    FatMkdir {
        block_offset: u64,
        dirname: String,
    },
    FatTouch {
        block_offset: u64,
        filename: String,
    },
    FatMv {
        block_offset: u64,
        from: String,
        to: String,
    },
    FatRm {
        block_offset: u64,
        filename: String,
    },
    FatCp {
        block_offset: u64,
        from: String,
        to: String,
    },
    MbrWrite {
        name: String,
    },
}

impl Action {
    /// Parse one argc chain (name plus arguments) from a funlist.
    pub fn parse(chain: &[String]) -> Result<Self, String> {
        let name = chain[0].as_str();
        let args = &chain[1..];

        let argc = |n: usize| -> Result<(), String> {
            if args.len() == n {
                Ok(())
            } else {
                Err(format!("{name} expects {n} argument(s), got {}", args.len()))
            }
        };
        let block = |i: usize| -> Result<u64, String> {
            args[i]
                .parse::<i64>()
                .ok()
                .and_then(|n| u64::try_from(n).ok())
                .ok_or_else(|| format!("{name}: bad block offset '{}'", args[i]))
        };

        match name {
            "raw_write" => {
                argc(1)?;
                Ok(Self::RawWrite {
                    dest_block_offset: block(0)?,
                })
            }
            "fat_mkfs" => {
                argc(2)?;
                Ok(Self::FatMkfs {
                    block_offset: block(0)?,
                    block_count: args[1]
                        .parse()
                        .map_err(|_| format!("fat_mkfs: bad block count '{}'", args[1]))?,
                })
            }
            "fat_write" => {
                argc(2)?;
                Ok(Self::FatWrite {
                    block_offset: block(0)?,
                    filename: args[1].clone(),
                })
            }
            "fat_mkdir" => {
                argc(2)?;
                Ok(Self::FatMkdir {
                    block_offset: block(0)?,
                    dirname: args[1].clone(),
                })
            }
            "fat_touch" => {
                argc(2)?;
                Ok(Self::FatTouch {
                    block_offset: block(0)?,
                    filename: args[1].clone(),
                })
            }
            "fat_mv" => {
                argc(3)?;
                Ok(Self::FatMv {
                    block_offset: block(0)?,
                    from: args[1].clone(),
                    to: args[2].clone(),
                })
            }
            "fat_rm" => {
                argc(2)?;
                Ok(Self::FatRm {
                    block_offset: block(0)?,
                    filename: args[1].clone(),
                })
            }
            "fat_cp" => {
                argc(3)?;
                Ok(Self::FatCp {
                    block_offset: block(0)?,
                    from: args[1].clone(),
                    to: args[2].clone(),
                })
            }
            "mbr_write" => {
                argc(1)?;
                Ok(Self::MbrWrite {
                    name: args[0].clone(),
                })
            }
            _ => Err(format!("unknown function '{name}'")),
        }
    }

    /// Progress units this action will account for when run (compute-progress
    /// visitor). `resource` is the file-resource of the enclosing
    /// `on-resource` event, if any.
    pub fn progress_units(&self, resource: Option<&Resource>) -> u64 {
        match self {
            Self::RawWrite { .. } | Self::FatWrite { .. } => resource
                .map(|r| r.map.data_size())
                .unwrap_or(ACTION_PROGRESS_UNITS),
            _ => ACTION_PROGRESS_UNITS,
        }
    }

    /// Execute the action (run visitor).
    pub fn run(&self, ctx: &mut ActionCtx) -> Result<(), ApplyError> {
        match self {
            Self::RawWrite { dest_block_offset } => {
                let stream = require_stream(ctx.phase, &mut ctx.stream, "raw_write")?;
                let base = dest_block_offset * SECTOR_SIZE;
                while let Some(chunk) = stream.next_chunk()? {
                    ctx.output.write_all_at(chunk.data, base + chunk.offset)?;
                    ctx.progress.advance(chunk.data.len() as u64);
                }
                Ok(())
            }

            Self::FatMkfs {
                block_offset,
                block_count,
            } => {
                ctx.fat.bind(ctx.output, *block_offset as i64, ctx.time)?;
                ctx.fat.format(*block_count)?;
                ctx.progress.advance(ACTION_PROGRESS_UNITS);
                Ok(())
            }

            Self::FatWrite {
                block_offset,
                filename,
            } => {
                ctx.fat.bind(ctx.output, *block_offset as i64, ctx.time)?;
                let vol = ctx.fat.volume()?;
                let root = vol.root_dir();
                let mut file = root.create_file(filename).map_err(aerr("fat_write"))?;
                file.truncate().map_err(aerr("fat_write"))?;

                let stream = require_stream(ctx.phase, &mut ctx.stream, "fat_write")?;
                let mut cursor = 0u64;
                while let Some(chunk) = stream.next_chunk()? {
                    // FAT has no holes; fill any gap with zeros.
                    let mut gap = chunk.offset.saturating_sub(cursor);
                    while gap > 0 {
                        let n = gap.min(ZEROS.len() as u64) as usize;
                        file.write_all(&ZEROS[..n]).map_err(aerr("fat_write"))?;
                        gap -= n as u64;
                    }
                    file.write_all(chunk.data).map_err(aerr("fat_write"))?;
                    cursor = chunk.offset + chunk.data.len() as u64;
                    ctx.progress.advance(chunk.data.len() as u64);
                }
                file.flush().map_err(aerr("fat_write"))?;
                Ok(())
            }

            Self::FatMkdir {
                block_offset,
                dirname,
            } => {
                ctx.fat.bind(ctx.output, *block_offset as i64, ctx.time)?;
                let root = ctx.fat.volume()?.root_dir();
                root.create_dir(dirname).map_err(aerr("fat_mkdir"))?;
                ctx.progress.advance(ACTION_PROGRESS_UNITS);
                Ok(())
            }

            Self::FatTouch {
                block_offset,
                filename,
            } => {
                ctx.fat.bind(ctx.output, *block_offset as i64, ctx.time)?;
                let root = ctx.fat.volume()?.root_dir();
                root.create_file(filename).map_err(aerr("fat_touch"))?;
                ctx.progress.advance(ACTION_PROGRESS_UNITS);
                Ok(())
            }

            Self::FatMv {
                block_offset,
                from,
                to,
            } => {
                ctx.fat.bind(ctx.output, *block_offset as i64, ctx.time)?;
                let root = ctx.fat.volume()?.root_dir();
                root.rename(from, &root, to).map_err(aerr("fat_mv"))?;
                ctx.progress.advance(ACTION_PROGRESS_UNITS);
                Ok(())
            }

            Self::FatRm {
                block_offset,
                filename,
            } => {
                ctx.fat.bind(ctx.output, *block_offset as i64, ctx.time)?;
                let root = ctx.fat.volume()?.root_dir();
                root.remove(filename).map_err(aerr("fat_rm"))?;
                ctx.progress.advance(ACTION_PROGRESS_UNITS);
                Ok(())
            }

            Self::FatCp {
                block_offset,
                from,
                to,
            } => {
                ctx.fat.bind(ctx.output, *block_offset as i64, ctx.time)?;
                let root = ctx.fat.volume()?.root_dir();
                let mut data = Vec::new();
                root.open_file(from)
                    .and_then(|mut f| f.read_to_end(&mut data))
                    .map_err(aerr("fat_cp"))?;
                let mut dst = root.create_file(to).map_err(aerr("fat_cp"))?;
                dst.truncate().map_err(aerr("fat_cp"))?;
                dst.write_all(&data).map_err(aerr("fat_cp"))?;
                ctx.progress.advance(ACTION_PROGRESS_UNITS);
                Ok(())
            }

            Self::MbrWrite { name } => {
                let def = ctx.cfg.mbr(name).ok_or_else(|| ApplyError::Action {
                    action: "mbr_write",
                    msg: format!("no mbr section '{name}'"),
                })?;
                let sector = mbr::encode(&def.partitions);
                ctx.output.write_all_at(&sector, 0)?;
                ctx.progress.advance(ACTION_PROGRESS_UNITS);
                Ok(())
            }
        }
    }
}

const ZEROS: [u8; 4096] = [0u8; 4096];

fn require_stream<'s, 'a>(
    phase: Phase,
    stream: &'s mut Option<&'a mut (dyn ChunkSource + 'a)>,
    action: &'static str,
) -> Result<&'s mut (dyn ChunkSource + 'a), ApplyError> {
    match stream {
        Some(s) if phase == Phase::File => Ok(&mut **s),
        _ => Err(ApplyError::Action {
            action,
            msg: "only valid in an on-resource event".into(),
        }),
    }
}

fn aerr(action: &'static str) -> impl Fn(io::Error) -> ApplyError {
    move |e| ApplyError::Action {
        action,
        msg: e.to_string(),
    }
}
