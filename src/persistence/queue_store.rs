//! Work queue store — prompt files with TOML front matter.
//!
//! Each `*.md` file in the queue directory is one work unit:
//!
//! ```text
//! +++
//! id = 3
//! status = "queued"
//! retry_count = 0
//! title = "Wire up the branch monitor"
//! +++
//! Prompt body handed to the agent...
//! ```
//!
//! `id` falls back to the leading digits of the file name. Keys the store
//! does not know about are preserved on rewrite. The queue is read fresh
//! on every call; nothing is cached between ticks.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::models::work_unit::{WorkStatus, WorkUnit};
use crate::{AppError, Result};

/// Persistent source of work units.
pub trait WorkQueueStore: Send + Sync {
    /// Load all work units in queue order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Queue` if the backing storage cannot be read.
    fn load_work_units(&self) -> Result<Vec<WorkUnit>>;

    /// Persist a new status for a unit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id, `AppError::Queue`
    /// on write failure.
    fn mark_status(&self, id: u32, status: WorkStatus) -> Result<()>;

    /// Put a unit back in the queue with a new retry counter.
    ///
    /// Status and counter are written together: either both change or
    /// neither does.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown id, `AppError::Queue`
    /// on write failure.
    fn requeue(&self, id: u32, retry_count: u32) -> Result<()>;
}

const DELIMITER: &str = "+++";

#[derive(Debug, Deserialize)]
struct FrontMatter {
    id: Option<u32>,
    #[serde(default)]
    status: Option<WorkStatus>,
    #[serde(default)]
    retry_count: u32,
    #[serde(default)]
    title: Option<String>,
}

/// Split a prompt file into its front matter and body.
///
/// Returns `None` when the file does not open with a `+++` fence or the
/// closing fence is missing.
#[must_use]
pub fn split_front_matter(raw: &str) -> Option<(&str, &str)> {
    let after = raw.strip_prefix(DELIMITER)?;
    let rest = after
        .strip_prefix("\r\n")
        .or_else(|| after.strip_prefix('\n'))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == DELIMITER {
            let header = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Some((header, body));
        }
        offset += line.len();
    }
    None
}

fn id_from_file_name(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_str()?;
    let digits: String = stem.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Store backed by a directory of prompt files.
#[derive(Debug, Clone)]
pub struct PromptDirStore {
    dir: PathBuf,
}

impl PromptDirStore {
    /// Store reading `*.md` files from `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Queue directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn prompt_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            debug!(dir = %self.dir.display(), "queue directory missing; queue is empty");
            return Ok(Vec::new());
        }
        let pattern = self.dir.join("*.md");
        let pattern = pattern
            .to_str()
            .ok_or_else(|| AppError::Queue("queue directory is not valid UTF-8".into()))?;
        let paths = glob::glob(pattern)
            .map_err(|err| AppError::Queue(format!("invalid queue glob: {err}")))?
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(err) => {
                    warn!(%err, "unreadable queue entry");
                    None
                }
            })
            .collect();
        Ok(paths)
    }

    fn parse_unit(path: &Path) -> Result<WorkUnit> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Queue(format!("failed to read {}: {err}", path.display())))?;
        let (header, _) = split_front_matter(&raw)
            .ok_or_else(|| AppError::Queue(format!("{} has no front matter", path.display())))?;
        let meta: FrontMatter = toml::from_str(header).map_err(|err| {
            AppError::Queue(format!("invalid front matter in {}: {err}", path.display()))
        })?;
        let id = meta
            .id
            .or_else(|| id_from_file_name(path))
            .ok_or_else(|| AppError::Queue(format!("{} has no id", path.display())))?;

        Ok(WorkUnit {
            id,
            status: meta.status.unwrap_or(WorkStatus::Queued),
            retry_count: meta.retry_count,
            title: meta.title,
            path: Some(path.to_path_buf()),
        })
    }

    fn path_for(&self, id: u32) -> Result<PathBuf> {
        self.load_work_units()?
            .into_iter()
            .find(|unit| unit.id == id)
            .and_then(|unit| unit.path)
            .ok_or_else(|| AppError::NotFound(format!("work unit {id}")))
    }

    /// Rewrite front-matter keys of unit `id` in one file replacement,
    /// stamping `updated_at`.
    fn update_fields(&self, id: u32, fields: &[(&str, toml::Value)]) -> Result<()> {
        let path = self.path_for(id)?;
        let raw = fs::read_to_string(&path)
            .map_err(|err| AppError::Queue(format!("failed to read {}: {err}", path.display())))?;
        let (header, body) = split_front_matter(&raw)
            .ok_or_else(|| AppError::Queue(format!("{} has no front matter", path.display())))?;

        let mut table: toml::Table = toml::from_str(header).map_err(|err| {
            AppError::Queue(format!("invalid front matter in {}: {err}", path.display()))
        })?;
        for (key, value) in fields {
            table.insert((*key).to_owned(), value.clone());
        }
        table.insert(
            "updated_at".to_owned(),
            toml::Value::String(Utc::now().to_rfc3339()),
        );

        let mut header = toml::to_string(&table)?;
        if !header.ends_with('\n') {
            header.push('\n');
        }
        let rendered = format!("{DELIMITER}\n{header}{DELIMITER}\n{body}");
        write_atomic(&path, &rendered)
    }
}

fn status_value(status: WorkStatus) -> toml::Value {
    toml::Value::String(status.as_str().to_owned())
}

/// Write via a temp file in the same directory, then rename over `path`.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Queue("prompt path has no parent directory".into()))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Queue(format!("failed to create temporary file: {err}")))?;
    tmp.write_all(content.as_bytes())
        .map_err(|err| AppError::Queue(format!("failed to write temporary file: {err}")))?;
    tmp.persist(path)
        .map_err(|err| AppError::Queue(format!("failed to replace {}: {err}", path.display())))?;
    Ok(())
}

impl WorkQueueStore for PromptDirStore {
    fn load_work_units(&self) -> Result<Vec<WorkUnit>> {
        let mut units = Vec::new();
        for path in self.prompt_files()? {
            match Self::parse_unit(&path) {
                Ok(unit) => units.push(unit),
                Err(err) => warn!(%err, "skipping prompt file"),
            }
        }
        units.sort_by_key(|unit| unit.id);
        Ok(units)
    }

    fn mark_status(&self, id: u32, status: WorkStatus) -> Result<()> {
        self.update_fields(id, &[("status", status_value(status))])
    }

    fn requeue(&self, id: u32, retry_count: u32) -> Result<()> {
        self.update_fields(
            id,
            &[
                ("status", status_value(WorkStatus::Queued)),
                ("retry_count", toml::Value::Integer(i64::from(retry_count))),
            ],
        )
    }
}

/// In-memory store, for embedding the loop without a queue directory.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    units: Mutex<Vec<WorkUnit>>,
}

impl MemoryQueueStore {
    /// Store seeded with `units` in the given order.
    #[must_use]
    pub fn new(units: Vec<WorkUnit>) -> Self {
        Self {
            units: Mutex::new(units),
        }
    }

    /// Copy of the stored units.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Queue` if the lock is poisoned.
    pub fn units(&self) -> Result<Vec<WorkUnit>> {
        self.units
            .lock()
            .map(|guard| guard.clone())
            .map_err(|_| AppError::Queue("queue lock poisoned".into()))
    }

    /// Append a unit.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Queue` if the lock is poisoned.
    pub fn push(&self, unit: WorkUnit) -> Result<()> {
        self.units
            .lock()
            .map_err(|_| AppError::Queue("queue lock poisoned".into()))?
            .push(unit);
        Ok(())
    }

    fn update(&self, id: u32, apply: impl FnOnce(&mut WorkUnit)) -> Result<()> {
        let mut guard = self
            .units
            .lock()
            .map_err(|_| AppError::Queue("queue lock poisoned".into()))?;
        let unit = guard
            .iter_mut()
            .find(|unit| unit.id == id)
            .ok_or_else(|| AppError::NotFound(format!("work unit {id}")))?;
        apply(unit);
        Ok(())
    }
}

impl WorkQueueStore for MemoryQueueStore {
    fn load_work_units(&self) -> Result<Vec<WorkUnit>> {
        let mut units = self.units()?;
        units.sort_by_key(|unit| unit.id);
        Ok(units)
    }

    fn mark_status(&self, id: u32, status: WorkStatus) -> Result<()> {
        self.update(id, |unit| unit.status = status)
    }

    fn requeue(&self, id: u32, retry_count: u32) -> Result<()> {
        self.update(id, |unit| {
            unit.status = WorkStatus::Queued;
            unit.retry_count = retry_count;
        })
    }
}
