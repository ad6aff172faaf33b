//! Background processes whose output is streamed onto the event bus.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use event_bus::EventBus;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Grace period between SIGTERM and SIGKILL when the caller gives none.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {path}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("spawned process has no pid")]
    NoPid,

    #[error("no running process with pid {0}")]
    UnknownProcess(u32),
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct ExecOptions {
    pub env: HashMap<String, String>,
    pub cwd: String,
}

/// A process to start in the background.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundSpec {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Receives `[line]` for every stdout/stderr line. Empty disables it.
    #[serde(default)]
    pub out_event: String,
    /// Receives `[exitCode]` once the process is gone. Empty disables it.
    #[serde(default)]
    pub end_event: String,
    #[serde(default)]
    pub options: ExecOptions,
}

#[derive(Clone)]
struct Tracked {
    exited: CancellationToken,
    force: CancellationToken,
}

/// Processes started through [`ProcessRunner::spawn`] that have not exited
/// yet, keyed by pid.
type Table = Arc<Mutex<HashMap<u32, Tracked>>>;

pub struct ProcessRunner {
    bus: Arc<EventBus>,
    running: Table,
}

fn lock(table: &Table) -> std::sync::MutexGuard<'_, HashMap<u32, Tracked>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProcessRunner {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start `spec` in its own process group and return its pid. Output and
    /// exit are reported asynchronously on the bus.
    pub fn spawn(&self, spec: BackgroundSpec) -> Result<u32, ExecError> {
        let mut cmd = Command::new(&spec.path);
        cmd.args(&spec.args)
            .envs(&spec.options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !spec.options.cwd.is_empty() {
            cmd.current_dir(&spec.options.cwd);
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            path: spec.path.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            let _ = child.start_kill();
            return Err(ExecError::NoPid);
        };

        let tracked = Tracked {
            exited: CancellationToken::new(),
            force: CancellationToken::new(),
        };
        self.table().insert(pid, tracked.clone());
        info!(pid, path = %spec.path, "background process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let bus = Arc::clone(&self.bus);
        let out_event = spec.out_event;
        let end_event = spec.end_event;
        let running = Arc::clone(&self.running);

        tokio::spawn(async move {
            let out = stdout.map(|r| {
                tokio::spawn(emit_lines(r, Arc::clone(&bus), out_event.clone()))
            });
            let err = stderr.map(|r| tokio::spawn(emit_lines(r, Arc::clone(&bus), out_event)));

            let status = tokio::select! {
                status = child.wait() => status,
                () = tracked.force.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            for pump in [out, err].into_iter().flatten() {
                let _ = pump.await;
            }

            let code = match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(err) => {
                    warn!(pid, %err, "waiting on background process failed");
                    -1
                }
            };
            info!(pid, code, "background process exited");

            lock(&running).remove(&pid);
            tracked.exited.cancel();
            if !end_event.is_empty() {
                bus.emit(&end_event, vec![Value::from(code)]).await;
            }
        });

        Ok(pid)
    }

    /// SIGTERM the process group of `pid`, then SIGKILL it if it is still
    /// running after `grace`.
    pub async fn kill(&self, pid: u32, grace: Duration) -> Result<(), ExecError> {
        let tracked = self
            .table()
            .get(&pid)
            .cloned()
            .ok_or(ExecError::UnknownProcess(pid))?;

        #[cfg(unix)]
        signal_group(pid, "TERM").await;
        #[cfg(not(unix))]
        tracked.force.cancel();

        if tokio::time::timeout(grace, tracked.exited.cancelled())
            .await
            .is_ok()
        {
            info!(pid, "background process stopped after SIGTERM");
            return Ok(());
        }

        warn!(pid, grace_secs = grace.as_secs(), "process ignored SIGTERM; sending SIGKILL");
        #[cfg(unix)]
        signal_group(pid, "KILL").await;
        tracked.force.cancel();
        Ok(())
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.table().contains_key(&pid)
    }

    pub fn running_count(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Tracked>> {
        lock(&self.running)
    }
}

/// Send `signal` to the process group led by `pid`, falling back to the
/// single process when the group signal fails.
#[cfg(unix)]
async fn signal_group(pid: u32, signal: &str) {
    let group = format!("-{pid}");
    let status = Command::new("kill")
        .args(["-s", signal, "--", &group])
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {
            debug!(pid, signal, "signal sent to process group");
        }
        _ => {
            let _ = Command::new("kill")
                .args(["-s", signal, &pid.to_string()])
                .status()
                .await;
        }
    }
}

async fn emit_lines<R>(reader: R, bus: Arc<EventBus>, event: String)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => return,
            Ok(_) => {
                if event.is_empty() {
                    continue;
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                bus.emit(&event, vec![Value::from(line)]).await;
            }
            Err(err) => {
                debug!(%err, "process output read failed");
                return;
            }
        }
    }
}
