//! On-disk run sentinel.
//!
//! A small JSON marker under `<root>/.ivaldi/{p2p,mesh}.state` used purely
//! to detect whether a previous process instance still owns the listener
//! port. This is the tiebreaker the façade consults before binding: a live
//! PID found here means `Start` must refuse.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed sentinel file: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Which subsystem a sentinel file tracks. Spec requires one sentinel each
/// for the P2P network and the mesh overlay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SentinelKind {
    P2p,
    Mesh,
}

impl SentinelKind {
    fn file_name(self) -> &'static str {
        match self {
            SentinelKind::P2p => "p2p.state",
            SentinelKind::Mesh => "mesh.state",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SentinelState {
    pub running: bool,
    pub node_id: String,
    pub port: u16,
    pub discovery_port: u16,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub pid: u32,
}

pub struct Sentinel {
    path: PathBuf,
}

impl Sentinel {
    pub fn new(root: impl AsRef<Path>, kind: SentinelKind) -> Self {
        Self {
            path: root.as_ref().join(".ivaldi").join(kind.file_name()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the sentinel, reconciling `running` against the OS's own view
    /// of whether `pid` is still alive. If the file disagrees with reality
    /// it is rewritten here (with `running=false`) before being returned.
    pub async fn load(&self) -> Result<Option<SentinelState>, SentinelError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut state: SentinelState = serde_json::from_slice(&bytes)?;
        let actually_alive = state.pid > 0 && pid_is_alive(state.pid);
        if state.running != actually_alive {
            state.running = actually_alive;
            self.write(&state).await?;
        }
        Ok(Some(state))
    }

    /// Whether a live previous instance owns this sentinel.
    pub async fn is_running(&self) -> Result<bool, SentinelError> {
        Ok(self.load().await?.map(|s| s.running).unwrap_or(false))
    }

    pub async fn write(&self, state: &SentinelState) -> Result<(), SentinelError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&self.path, bytes).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
                .await;
        }
        Ok(())
    }

    /// Mark the sentinel as stopped in place, leaving the rest of the
    /// record (node id, ports) intact for diagnostics.
    pub async fn clear(&self) -> Result<(), SentinelError> {
        if let Some(mut state) = self.load().await? {
            state.running = false;
            self.write(&state).await?;
        }
        Ok(())
    }
}

fn pid_is_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    system.process(Pid::from_u32(pid)).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_state(pid: u32, running: bool) -> SentinelState {
        SentinelState {
            running,
            node_id: "deadbeef".into(),
            port: 9090,
            discovery_port: 9091,
            started_at: Utc::now(),
            pid,
        }
    }

    #[tokio::test]
    async fn missing_file_is_not_running() {
        let dir = tempdir::TempDir::new("ivaldi-sentinel").unwrap();
        let sentinel = Sentinel::new(dir.path(), SentinelKind::P2p);
        assert!(!sentinel.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn live_pid_round_trip() {
        let dir = tempdir::TempDir::new("ivaldi-sentinel").unwrap();
        let sentinel = Sentinel::new(dir.path(), SentinelKind::P2p);
        let our_pid = std::process::id();
        sentinel.write(&sample_state(our_pid, true)).await.unwrap();
        assert!(sentinel.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn dead_pid_is_rewritten_as_not_running() {
        let dir = tempdir::TempDir::new("ivaldi-sentinel").unwrap();
        let sentinel = Sentinel::new(dir.path(), SentinelKind::P2p);
        // A PID vanishingly unlikely to be alive.
        sentinel.write(&sample_state(u32::MAX - 1, true)).await.unwrap();

        assert!(!sentinel.is_running().await.unwrap());

        // The rewrite should have persisted running=false.
        let bytes = tokio::fs::read(sentinel.path()).await.unwrap();
        let state: SentinelState = serde_json::from_slice(&bytes).unwrap();
        assert!(!state.running);
    }

    #[tokio::test]
    async fn clear_marks_running_false_without_losing_other_fields() {
        let dir = tempdir::TempDir::new("ivaldi-sentinel").unwrap();
        let sentinel = Sentinel::new(dir.path(), SentinelKind::P2p);
        let our_pid = std::process::id();
        sentinel.write(&sample_state(our_pid, true)).await.unwrap();

        sentinel.clear().await.unwrap();
        let state = sentinel.load().await.unwrap().unwrap();
        assert!(!state.running);
        assert_eq!(state.node_id, "deadbeef");
    }
}
