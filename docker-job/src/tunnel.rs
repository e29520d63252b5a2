//! Forward a remote Docker socket to a local Unix socket with `ssh -L`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cli::SshTarget;
use crate::error::TunnelError;

const SSH_BIN: &str = "ssh";
const SOCKET_WAIT: Duration = Duration::from_secs(15);
const SOCKET_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// A running ssh port forward. Dropping it stops ssh and removes the socket.
pub struct SshTunnel {
    child: Child,
    socket: PathBuf,
}

impl SshTunnel {
    pub async fn open(target: &SshTarget) -> Result<Self, TunnelError> {
        let socket = std::env::temp_dir().join(format!("dj-{}.sock", Uuid::new_v4()));
        let mut cmd = ssh_command(target, &socket);

        info!(host = %target.host, cmd = ?cmd.as_std(), "Opening ssh tunnel");
        let mut child = cmd.spawn().map_err(TunnelError::Spawn)?;
        let started = Instant::now();

        loop {
            if let Ok(Some(status)) = child.try_wait() {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                let stderr = stderr.trim().to_string();
                error!(status = ?status, stderr = %stderr, "ssh exited before the tunnel was up");
                return Err(TunnelError::Exited { status, stderr });
            }

            if tokio::fs::try_exists(&socket).await.unwrap_or(false) {
                debug!(socket = %socket.display(), "Tunnel socket ready");
                if let Some(pipe) = child.stderr.take() {
                    forward_stderr(pipe);
                }
                return Ok(Self { child, socket });
            }

            if started.elapsed() > SOCKET_WAIT {
                let _ = child.start_kill();
                return Err(TunnelError::Timeout(socket.display().to_string()));
            }
            sleep(SOCKET_CHECK_INTERVAL).await;
        }
    }

    /// Local socket connected to the remote daemon.
    pub fn socket(&self) -> &Path {
        &self.socket
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(error = %e, "Failed to stop ssh");
        }
        let _ = std::fs::remove_file(&self.socket);
    }
}

/// Keep reading ssh's stderr into the log so the pipe never fills up.
/// Resolves to the number of lines read once ssh closes it.
fn forward_stderr<R>(pipe: R) -> JoinHandle<usize>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        let mut count = 0;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    count += 1;
                    debug!(line = %line, "ssh");
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read ssh stderr");
                    break;
                }
            }
        }
        count
    })
}

fn ssh_command(target: &SshTarget, socket: &Path) -> Command {
    let mut cmd = Command::new(SSH_BIN);
    cmd.arg("-N")
        .arg("-o")
        .arg("ExitOnForwardFailure=yes")
        .arg("-L")
        .arg(format!("{}:{}", socket.display(), target.remote_socket));
    if let Some(identity) = &target.identity_file {
        cmd.arg("-i").arg(identity);
    }
    cmd.arg(target.destination())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}
