//! On-disk workspace for persisted definitions.
//!
//! A workspace is a named directory under `<root>/workspaces/` with a
//! `configs/` area for definition snapshots and a `workdir/` scratch area
//! owned by the supervisor. Snapshot files are JSONL: one record per
//! logical entity, each wrapped in an owner-tagged envelope so a component
//! can never clobber another component's file.

use foreman_core::{ForemanError, ForemanResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// One line of a snapshot file.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    owner: String,
    entity: serde_json::Value,
}

/// A named on-disk scope for persisted configs.
#[derive(Debug, Clone)]
pub struct Workspace {
    name: String,
    configs_dir: PathBuf,
    workdir: PathBuf,
}

impl Workspace {
    /// Open (creating if necessary) the workspace `<root>/workspaces/<name>/`.
    pub async fn open(root: impl AsRef<Path>, name: impl Into<String>) -> ForemanResult<Self> {
        let name = name.into();
        let base = root.as_ref().join("workspaces").join(&name);
        let configs_dir = base.join("configs");
        let workdir = base.join("workdir");
        tokio::fs::create_dir_all(&configs_dir).await?;
        tokio::fs::create_dir_all(&workdir).await?;
        info!(workspace = %name, path = %base.display(), "opened workspace");
        Ok(Self {
            name,
            configs_dir,
            workdir,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Supervisor-owned scratch area.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Hand out a writer scope for one component. Every record the scope
    /// writes is tagged with `owner`, and the scope refuses to touch files
    /// whose records carry a different tag.
    pub fn scope(&self, owner: impl Into<String>) -> WorkspaceScope {
        WorkspaceScope {
            configs_dir: self.configs_dir.clone(),
            owner: owner.into(),
        }
    }
}

/// An owner-scoped handle onto the workspace `configs/` area.
#[derive(Debug, Clone)]
pub struct WorkspaceScope {
    configs_dir: PathBuf,
    owner: String,
}

impl WorkspaceScope {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    fn file_path(&self, file: &str) -> ForemanResult<PathBuf> {
        if file.is_empty() || file.contains(['/', '\\']) || file.contains("..") {
            return Err(ForemanError::IllegalState(format!(
                "snapshot file name '{file}' must be a plain file name"
            )));
        }
        Ok(self.configs_dir.join(file))
    }

    /// Rewrite `file` with the given entities, one JSONL record each.
    /// The write is atomic: a temp file is written and renamed over the
    /// target. Fails if the existing file belongs to another owner.
    pub async fn write_snapshot<T: Serialize>(
        &self,
        file: &str,
        entities: &[T],
    ) -> ForemanResult<()> {
        let path = self.file_path(file)?;
        self.check_ownership(&path).await?;

        let mut buf = String::new();
        for entity in entities {
            let record = SnapshotRecord {
                owner: self.owner.clone(),
                entity: serde_json::to_value(entity)?,
            };
            buf.push_str(&serde_json::to_string(&record)?);
            buf.push('\n');
        }

        let tmp = path.with_extension("jsonl.tmp");
        tokio::fs::write(&tmp, buf).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Read `file` back as entities. A missing file is an empty set;
    /// an unparsable line fails the whole read.
    pub async fn read_snapshot<T: DeserializeOwned>(&self, file: &str) -> ForemanResult<Vec<T>> {
        let path = self.file_path(file)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        let mut entities = Vec::new();
        for (line_no, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: SnapshotRecord = serde_json::from_str(line).map_err(|e| {
                ForemanError::RestoreFailed(format!("{file} line {}: {e}", line_no + 1))
            })?;
            if record.owner != self.owner {
                return Err(ForemanError::IllegalState(format!(
                    "snapshot '{file}' belongs to '{}', not '{}'",
                    record.owner, self.owner
                )));
            }
            let entity = serde_json::from_value(record.entity).map_err(|e| {
                ForemanError::RestoreFailed(format!("{file} line {}: {e}", line_no + 1))
            })?;
            entities.push(entity);
        }
        Ok(entities)
    }

    /// Verify that the file on disk, if any, is tagged with this scope's
    /// owner. Only the first record is inspected; files are homogeneous.
    async fn check_ownership(&self, path: &Path) -> ForemanResult<()> {
        if !path.exists() {
            return Ok(());
        }
        let data = tokio::fs::read_to_string(path).await?;
        let Some(first) = data.lines().find(|l| !l.trim().is_empty()) else {
            return Ok(());
        };
        let record: SnapshotRecord = serde_json::from_str(first)
            .map_err(|e| ForemanError::RestoreFailed(format!("{}: {e}", path.display())))?;
        if record.owner != self.owner {
            return Err(ForemanError::IllegalState(format!(
                "snapshot '{}' belongs to '{}', not '{}'",
                path.display(),
                record.owner,
                self.owner
            )));
        }
        Ok(())
    }
}
