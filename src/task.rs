use log::{debug, warn};

use crate::manifest::{Config, Task};
use crate::mbr;
use crate::output::Output;

/// A reqlist predicate. Unknown names are kept so evaluation can reject the
/// task instead of failing the whole apply: a manifest from a newer tool
/// must not select a task this build cannot vet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    PartitionOffset { partition: usize, block_offset: u32 },
    Unknown(String),
}

impl Requirement {
    pub fn parse(chain: &[String]) -> Result<Self, String> {
        let name = chain[0].as_str();
        let args = &chain[1..];
        match name {
            "require_partition_offset" => {
                if args.len() != 2 {
                    return Err("require_partition_offset expects 2 arguments".into());
                }
                let partition: usize = args[0]
                    .parse()
                    .ok()
                    .filter(|&i| i < 4)
                    .ok_or_else(|| format!("bad partition index '{}'", args[0]))?;
                let block_offset = args[1]
                    .parse()
                    .map_err(|_| format!("bad block offset '{}'", args[1]))?;
                Ok(Self::PartitionOffset {
                    partition,
                    block_offset,
                })
            }
            _ => Ok(Self::Unknown(name.to_string())),
        }
    }

    /// Evaluate against the current sink contents. A failure to read or
    /// decode counts as "not satisfied", never as a hard error.
    pub fn is_met(&self, output: &Output) -> bool {
        match self {
            Self::PartitionOffset {
                partition,
                block_offset,
            } => read_partitions(output)
                .is_some_and(|parts| parts[*partition].block_offset == *block_offset),
            Self::Unknown(name) => {
                warn!("unknown requirement '{name}'; treating as unsatisfied");
                false
            }
        }
    }
}

/// Return the first task in manifest order whose title starts with `prefix`
/// and whose constraints are all satisfied.
pub fn select_task<'a>(cfg: &'a Config, prefix: &str, output: &Output) -> Option<&'a Task> {
    cfg.tasks.iter().find(|task| {
        task.title.starts_with(prefix)
            && legacy_constraint_met(task, output)
            && task.requirements.iter().all(|req| req.is_met(output))
    })
}

/// Legacy `require-partition1-offset` gate, kept for compatibility with old
/// manifests. An unreadable output (e.g. a non-seekable sink) fails the
/// constraint, which is the right answer for it anyway.
fn legacy_constraint_met(task: &Task, output: &Output) -> bool {
    let required = task.require_partition1_offset;
    if required < 0 {
        return true;
    }
    match read_partitions(output) {
        Some(parts) => i64::from(parts[1].block_offset) == required,
        None => {
            debug!(
                "task '{}': MBR unreadable, legacy offset constraint fails",
                task.title
            );
            false
        }
    }
}

fn read_partitions(output: &Output) -> Option<[mbr::Partition; 4]> {
    let mut sector = [0u8; mbr::MBR_SIZE];
    let n = output.read_at(&mut sector, 0).ok()?;
    if n != mbr::MBR_SIZE {
        return None;
    }
    mbr::decode(&sector)
}
