//! C3 Workspace Pool — a pre-warmed pool of checkouts with shared
//! dependency caches and parallel refresh (`SPEC_FULL.md` §4.3).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crossbeam_channel::{Receiver, bounded};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{DroverError, Result};
use crate::model::{TaskId, WorkspaceId, now_unix};
use crate::workspace::manager::{self, WorkspaceManager};

/// Well-known lockfiles whose combined hash gates shared-cache validity.
const LOCKFILES: &[&str] = &["package-lock.json", "yarn.lock", "go.sum", "Cargo.lock"];

/// Environment variable pointing agent subprocesses at the shared module
/// cache directory.
pub const ENV_MOD_CACHE_DIR: &str = "DROVER_MOD_CACHE_DIR";
/// Environment variable pointing agent subprocesses at the shared build
/// artifact directory.
pub const ENV_BUILD_CACHE_DIR: &str = "DROVER_BUILD_CACHE_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceState {
    Cold,
    Warming,
    Warm,
    InUse,
    Draining,
}

#[derive(Debug, Clone)]
struct Entry {
    path: PathBuf,
    state: WorkspaceState,
    read_only: bool,
    created_at: i64,
    assigned_task: Option<TaskId>,
    last_refresh: Option<i64>,
    last_refresh_ok: Option<bool>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub cold: u32,
    pub warming: u32,
    pub warm: u32,
    pub in_use: u32,
    pub draining: u32,
}

impl PoolStats {
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.cold + self.warming + self.warm + self.in_use + self.draining
    }
}

#[derive(Debug, Clone)]
pub struct RefreshResult {
    pub id: WorkspaceId,
    pub ok: bool,
    pub detail: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct CacheState {
    lockfile_hash: Option<String>,
}

pub struct WorkspacePool {
    manager: Arc<WorkspaceManager>,
    project_root: PathBuf,
    cache_dir: PathBuf,
    min_size: u32,
    max_size: u32,
    entries: RwLock<HashMap<WorkspaceId, Entry>>,
    next_id: AtomicU64,
}

impl WorkspacePool {
    #[must_use]
    pub fn new(manager: Arc<WorkspaceManager>, project_root: &Path, cache_dir: PathBuf, min_size: u32, max_size: u32) -> Self {
        Self {
            manager,
            project_root: project_root.to_owned(),
            cache_dir,
            min_size,
            max_size: max_size.max(min_size),
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    fn fresh_id(&self) -> WorkspaceId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        WorkspaceId::new(format!("ws-{n:06}")).unwrap_or_else(|_| WorkspaceId::new("ws").unwrap())
    }

    /// Warm `count` new workspaces synchronously (pool start / deficit
    /// top-up). Warmup failure transitions that workspace to draining
    /// rather than propagating, per `spec.md` §4.3 failure modes.
    pub fn warm_n(&self, count: u32) -> Result<()> {
        self.rebuild_cache_if_invalid()?;
        for _ in 0..count {
            let id = self.fresh_id();
            self.entries.write().unwrap_or_else(|e| e.into_inner()).insert(
                id.clone(),
                Entry {
                    path: PathBuf::new(),
                    state: WorkspaceState::Warming,
                    read_only: false,
                    created_at: now_unix(),
                    assigned_task: None,
                    last_refresh: None,
                    last_refresh_ok: None,
                },
            );
            match self.warm_one(&id) {
                Ok(path) => {
                    let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
                    if let Some(entry) = entries.get_mut(&id) {
                        entry.path = path;
                        entry.state = WorkspaceState::Warm;
                    }
                }
                Err(_) => {
                    let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
                    if let Some(entry) = entries.get_mut(&id) {
                        entry.state = WorkspaceState::Draining;
                    }
                }
            }
        }
        Ok(())
    }

    fn warm_one(&self, id: &WorkspaceId) -> Result<PathBuf> {
        let path = self.manager.create(id)?;
        self.link_shared_caches(&path);
        Ok(path)
    }

    fn link_shared_caches(&self, path: &Path) {
        let shared = self.cache_dir.join("node_modules_shared");
        if shared.exists() {
            let target = path.join("node_modules");
            #[cfg(unix)]
            {
                let _ = std::os::unix::fs::symlink(&shared, &target);
            }
            #[cfg(not(unix))]
            {
                let _ = (&shared, &target);
            }
        }
    }

    /// Acquire a warm, non-read-only, non-in-use workspace for `task_id`;
    /// ad-hoc creates one when the pool has capacity but nothing is free
    /// (invariant I4), else fails with `NoneAvailable` (invariant I2/I3).
    ///
    /// A reused warm workspace is re-created off current trunk before being
    /// handed back (`spec.md` §8 P2): its previous branch may be behind the
    /// merges other tasks landed while it sat idle, and a stale `git fetch`
    /// of an upstream remote would not fix that.
    pub fn acquire(&self, task_id: &TaskId) -> Result<(WorkspaceId, PathBuf)> {
        let reuse_id = {
            let entries = self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            entries
                .iter()
                .find(|(_, e)| e.state == WorkspaceState::Warm && !e.read_only)
                .map(|(id, _)| id.clone())
        };
        if let Some(id) = reuse_id {
            let path = self.warm_one(&id)?;
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get_mut(&id) {
                entry.path = path.clone();
                entry.state = WorkspaceState::InUse;
                entry.assigned_task = Some(task_id.clone());
            }
            return Ok((id, path));
        }

        let total = self.stats().total();
        if total >= self.max_size {
            return Err(DroverError::NoneAvailable);
        }

        let id = self.fresh_id();
        let path = self.warm_one(&id)?;
        self.entries.write().unwrap_or_else(|e| e.into_inner()).insert(
            id.clone(),
            Entry {
                path: path.clone(),
                state: WorkspaceState::InUse,
                read_only: false,
                created_at: now_unix(),
                assigned_task: Some(task_id.clone()),
                last_refresh: None,
                last_refresh_ok: None,
            },
        );
        Ok((id, path))
    }

    /// Release a workspace. `retain = true` returns it to the warm pool
    /// (I5); `retain = false` marks it draining for the replenisher to
    /// remove.
    pub fn release(&self, id: &WorkspaceId, retain: bool) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(id) {
            entry.assigned_task = None;
            entry.state = if retain {
                WorkspaceState::Warm
            } else {
                WorkspaceState::Draining
            };
        }
    }

    #[must_use]
    pub fn is_read_only(&self, id: &WorkspaceId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .is_some_and(|e| e.read_only)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let entries = self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut stats = PoolStats::default();
        for entry in entries.values() {
            match entry.state {
                WorkspaceState::Cold => stats.cold += 1,
                WorkspaceState::Warming => stats.warming += 1,
                WorkspaceState::Warm => stats.warm += 1,
                WorkspaceState::InUse => stats.in_use += 1,
                WorkspaceState::Draining => stats.draining += 1,
            }
        }
        stats
    }

    /// One tick of the replenisher loop (`spec.md` §4.3): rebuild caches if
    /// invalidated, top up to `min_size`, sweep draining workspaces. The
    /// scheduler calls this on a 5s interval from its own thread.
    pub fn replenish_once(&self) -> Result<()> {
        self.rebuild_cache_if_invalid()?;

        let stats = self.stats();
        let deficit = self
            .min_size
            .saturating_sub(stats.warm + stats.warming + stats.in_use)
            .min(self.max_size.saturating_sub(stats.total()));
        if deficit > 0 {
            self.warm_n(deficit)?;
        }

        let draining: Vec<WorkspaceId> = {
            let entries = self.entries.read().unwrap_or_else(std::sync::PoisonError::into_inner);
            entries
                .iter()
                .filter(|(_, e)| e.state == WorkspaceState::Draining)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in draining {
            manager::aggressive_remove(&self.manager.path_of(&id));
            self.manager.remove(&id);
            self.entries.write().unwrap_or_else(|e| e.into_inner()).remove(&id);
        }
        Ok(())
    }

    /// Parallel fetch of every non-draining workspace; each is marked
    /// read-only for the duration of its own refresh. Results stream on a
    /// bounded channel that closes once all complete.
    #[must_use]
    pub fn refresh_all(self: &Arc<Self>) -> Receiver<RefreshResult> {
        let ids: Vec<WorkspaceId> = {
            let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
            entries
                .iter_mut()
                .filter(|(_, e)| e.state != WorkspaceState::Draining)
                .map(|(id, e)| {
                    e.read_only = true;
                    id.clone()
                })
                .collect()
        };
        let (tx, rx) = bounded(ids.len().max(1));
        let pool = Arc::clone(self);
        std::thread::spawn(move || {
            rayon::scope(|scope| {
                for id in ids {
                    let pool = &pool;
                    let tx = tx.clone();
                    scope.spawn(move |_| {
                        let result = pool.refresh_one(&id);
                        let _ = tx.send(result);
                    });
                }
            });
        });
        rx
    }

    fn refresh_one(&self, id: &WorkspaceId) -> RefreshResult {
        let path = self
            .entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .map(|e| e.path.clone());
        let ok = path.is_some_and(|p| {
            std::process::Command::new("git")
                .args(["fetch", "--all", "--quiet"])
                .current_dir(p)
                .status()
                .is_ok_and(|s| s.success())
        });
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(id) {
            entry.read_only = false;
            entry.last_refresh = Some(now_unix());
            entry.last_refresh_ok = Some(ok);
        }
        RefreshResult {
            id: id.clone(),
            ok,
            detail: None,
        }
    }

    fn rebuild_cache_if_invalid(&self) -> Result<bool> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let state_path = self.cache_dir.join("cache_state.json");
        let current_hash = lockfile_hash(&self.project_root);
        let previous: CacheState = std::fs::read_to_string(&state_path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();

        if previous.lockfile_hash.as_deref() == Some(current_hash.as_str()) {
            return Ok(false);
        }

        let shared = self.cache_dir.join("node_modules_shared");
        let _ = std::fs::remove_dir_all(&shared);
        std::fs::create_dir_all(&shared)?;
        std::fs::create_dir_all(self.cache_dir.join("mod_cache"))?;
        std::fs::create_dir_all(self.cache_dir.join("target_shared"))?;

        let new_state = CacheState {
            lockfile_hash: Some(current_hash),
        };
        std::fs::write(&state_path, serde_json::to_string_pretty(&new_state)?)?;
        Ok(true)
    }

    /// Environment variables to export to agent subprocesses pointing at
    /// the shared module/build caches (`spec.md` §4.3).
    #[must_use]
    pub fn cache_env(&self) -> Vec<(String, String)> {
        vec![
            (
                ENV_MOD_CACHE_DIR.to_owned(),
                self.cache_dir.join("mod_cache").display().to_string(),
            ),
            (
                ENV_BUILD_CACHE_DIR.to_owned(),
                self.cache_dir.join("target_shared").display().to_string(),
            ),
        ]
    }
}

fn lockfile_hash(project_root: &Path) -> String {
    let mut hasher = Sha256::new();
    for name in LOCKFILES {
        if let Ok(contents) = std::fs::read(project_root.join(name)) {
            hasher.update(name.as_bytes());
            hasher.update(&contents);
        }
    }
    format!("{:x}", hasher.finalize())
}
