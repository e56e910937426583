//! PID ledger
//!
//! Every transcoder the relay spawns is recorded in a plain text file, one
//! PID per line. If the relay crashes, the next start reads the ledger and
//! kills whatever is left over before serving anything.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::Mutex;

/// Persistent record of spawned transcoder processes
#[derive(Debug, Clone)]
pub struct PidLedger {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl PidLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Location of the ledger file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a PID
    pub async fn record(&self, pid: u32) -> io::Result<()> {
        let _guard = self.lock.lock().await;

        let mut pids = read_pids(&self.path).await?;
        pids.push(pid);
        write_pids(&self.path, &pids).await
    }

    /// Drop a PID after its process has exited
    pub async fn remove(&self, pid: u32) -> io::Result<()> {
        let _guard = self.lock.lock().await;

        let mut pids = read_pids(&self.path).await?;
        pids.retain(|p| *p != pid);
        write_pids(&self.path, &pids).await
    }

    /// All recorded PIDs
    pub async fn pids(&self) -> io::Result<Vec<u32>> {
        let _guard = self.lock.lock().await;
        read_pids(&self.path).await
    }

    /// Force-kill every recorded process and delete the ledger
    ///
    /// Returns the PIDs a kill was attempted for. Processes that are already
    /// gone are ignored.
    pub async fn kill_orphans(&self) -> io::Result<Vec<u32>> {
        let _guard = self.lock.lock().await;

        let pids = read_pids(&self.path).await?;
        for pid in &pids {
            match Command::new("kill").arg("-9").arg(pid.to_string()).output().await {
                Ok(output) if output.status.success() => {
                    tracing::info!(pid, "Killed orphaned transcoder");
                }
                Ok(_) => {
                    tracing::debug!(pid, "Orphaned transcoder already gone");
                }
                Err(e) => {
                    tracing::warn!(pid, error = %e, "Could not run kill");
                }
            }
        }

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        Ok(pids)
    }
}

async fn read_pids(path: &Path) -> io::Result<Vec<u32>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    Ok(content
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect())
}

async fn write_pids(path: &Path, pids: &[u32]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut content = String::new();
    for pid in pids {
        content.push_str(&pid.to_string());
        content.push('\n');
    }
    tokio::fs::write(path, content).await
}
