//! Placement and serialization of the measurement report.
//!
//! The report is a JSON document of the shape
//!
//! ```text
//! {
//!   "cpu in mhz": "2400",
//!   "threads": [
//!     {
//!       "id": "1234",
//!       "regions": [
//!         {
//!           "computation": {
//!             "region_count": "2",
//!             "cycles": "5000",
//!             "PAPI_TOT_INS": { "total": "900", "read_1": "100", "read_2": "450" }
//!           }
//!         }
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! All numbers are written as strings.

use crate::store::{RegionNode, RegionStore, RegionValue};
use crate::util::{local_timestamp, mkdir_p, unix_seconds};
use crate::{Config, Registry, Result, ThreadId};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::Write;
use std::os::unix::io::FromRawFd;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Measurement directory of the `generation`-th report under `prefix`.
///
/// Defaults to the current working directory if no prefix is given.
pub fn measurement_dir(prefix: Option<&Path>, generation: u32) -> Result<PathBuf> {
    let prefix = match prefix {
        Some(p) => p.to_path_buf(),
        None => std::env::current_dir()?,
    };
    Ok(if generation > 0 {
        prefix.join(format!("papi_{}", generation))
    } else {
        prefix.join("papi")
    })
}

/// Move an existing directory `dir` out of the way by appending a timestamp.
///
/// Directories modified at `now` or later are left alone, since another process of the same
/// run may have created them already. Returns the new location if `dir` was renamed.
pub fn rotate_existing(dir: &Path, now: SystemTime) -> Result<Option<PathBuf>> {
    let meta = match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => meta,
        _ => return Ok(None),
    };
    if unix_seconds(meta.modified()?) >= unix_seconds(now) {
        return Ok(None);
    }
    let mut target = dir.as_os_str().to_owned();
    target.push("-");
    target.push(local_timestamp(now));
    let target = PathBuf::from(target);
    std::fs::rename(dir, &target)?;
    Ok(Some(target))
}

/// Determine the measurement directory and rotate a previous one.
///
/// Failing to rotate is only a warning.
pub fn prepare_output_dir(prefix: Option<&Path>, generation: u32, cfg: &Config) -> Result<PathBuf> {
    let dir = measurement_dir(prefix, generation)?;
    match rotate_existing(&dir, SystemTime::now()) {
        Ok(Some(moved)) => log::debug!("Moved {} to {}", dir.display(), moved.display()),
        Ok(None) => {}
        Err(e) => {
            log::debug!("Rename of {} failed - {}", dir.display(), e);
            hl_warn!(
                cfg,
                "Cannot rename old measurement directory.\nIf you use MPI, another process may have already renamed the directory."
            );
        }
    }
    Ok(dir)
}

/// Names of all slots: `region_count`, `cycles`, then every tracked event.
pub fn field_names(registry: &Registry) -> Vec<String> {
    let mut names = vec![String::from("region_count"), String::from("cycles")];
    names.extend(registry.names());
    names
}

fn field_value(value: &RegionValue) -> Value {
    if value.reads.is_empty() {
        return Value::String(value.total.to_string());
    }
    let mut obj = Map::new();
    obj.insert("total".into(), Value::String(value.total.to_string()));
    for (idx, read) in value.reads.iter().enumerate() {
        obj.insert(format!("read_{}", idx + 1), Value::String(read.to_string()));
    }
    Value::Object(obj)
}

fn region_value(region: &RegionNode, fields: &[String]) -> Value {
    let events: Map<String, Value> = fields
        .iter()
        .zip(region.values.iter())
        .map(|(name, value)| (name.clone(), field_value(value)))
        .collect();
    let mut obj = Map::new();
    obj.insert(region.name.clone(), Value::Object(events));
    Value::Object(obj)
}

/// Build the report document.
///
/// Only threads that are both known to the backend and present in `store` are listed.
pub fn build_report(store: &RegionStore, fields: &[String], known: &[ThreadId], mhz: u64) -> Value {
    let threads: Vec<Value> = store
        .threads()
        .filter(|tid| known.contains(tid))
        .map(|tid| {
            let regions: Vec<Value> = store
                .regions(tid)
                .map(|region| region_value(region, fields))
                .collect();
            let mut obj = Map::new();
            obj.insert("id".into(), Value::String(tid.to_string()));
            obj.insert("regions".into(), Value::Array(regions));
            Value::Object(obj)
        })
        .collect();

    let mut root = Map::new();
    root.insert("cpu in mhz".into(), Value::String(mhz.to_string()));
    root.insert("threads".into(), Value::Array(threads));
    Value::Object(root)
}

/// Create the report file of this process inside `dir`.
///
/// The file is named `rank_NNNN` after a non-negative `rank`, otherwise a unique name of the
/// form `rank_XXXXXX` is generated.
pub fn create_report_file(dir: &Path, rank: Option<i64>) -> Result<(File, PathBuf)> {
    match rank {
        Some(rank) if rank >= 0 => {
            let path = dir.join(format!("rank_{:04}", rank));
            Ok((File::create(&path)?, path))
        }
        _ => {
            let (fd, path) = nix::unistd::mkstemp(&dir.join("rank_XXXXXX"))?;
            // SAFETY: `mkstemp` returned a freshly opened descriptor that nothing else owns.
            Ok((unsafe { File::from_raw_fd(fd) }, path))
        }
    }
}

/// Write `doc` into `file`.
pub fn write_report<W: Write>(mut out: W, doc: &Value) -> Result<()> {
    serde_json::to_writer_pretty(&mut out, doc)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

/// Create the measurement directory and write `doc` to this process' report file.
pub fn save(dir: &Path, rank: Option<i64>, doc: &Value) -> Result<PathBuf> {
    mkdir_p(dir)?;
    let (file, path) = create_report_file(dir, rank)?;
    write_report(std::io::BufWriter::new(file), doc)?;
    Ok(path)
}

/// Copy the report at `path` into `out` under a `PAPI-HL Output:` banner.
pub fn echo<W: Write>(mut out: W, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    writeln!(out, "\n\nPAPI-HL Output:\n{}", content)?;
    out.flush()?;
    Ok(())
}
