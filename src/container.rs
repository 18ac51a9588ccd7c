//! Toolchain container orchestration.
//!
//! One live container serves exactly one probe, named `<base>-p<probeId>`
//! and declared as a compose service of the same name. The manager starts
//! containers lazily, runs commands inside them, and kills named processes
//! inside them when a session has to be torn down. Containers run
//! privileged with `/dev:/dev`; nothing here grants more than the compose
//! descriptor already does.

use crate::ports::PortPlan;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Bound on lazy container start (`compose up -d`).
pub const COMPOSE_UP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container '{container}' failed to start: {detail}")]
    StartFailed { container: String, detail: String },

    #[error("exec in '{container}' failed with code {code}")]
    ExecFailed { container: String, code: i32 },

    #[error("docker invocation failed: {0}")]
    Docker(#[from] std::io::Error),
}

/// Runtime name of the container serving one probe.
pub fn container_name(base: &str, probe_id: u32) -> String {
    format!("{base}-p{probe_id}")
}

/// Captured output of a completed in-container command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr in one log blob, the shape clients receive.
    pub fn combined_log(&self) -> String {
        let mut log = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !log.is_empty() && !log.ends_with('\n') {
                log.push('\n');
            }
            log.push_str(&self.stderr);
        }
        log
    }
}

/// A long-running server spawned inside a container.
///
/// The held child is the host-side `docker exec` client; it exits when the
/// in-container command exits, which makes it the liveness signal for the
/// supervisor. In-container processes are addressed by name or port
/// pattern, never by pid (pid namespaces differ).
#[derive(Debug)]
pub struct ServerHandle {
    child: Child,
    container: String,
    pid: Option<u32>,
}

impl ServerHandle {
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Host-side pid of the exec client.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking liveness probe.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for the in-container command to exit.
    pub async fn wait(&mut self) -> std::io::Result<std::process::ExitStatus> {
        self.child.wait().await
    }

    /// Kill the host-side exec client. Does not touch in-container
    /// processes; pair with [`ContainerManager::pkill_pattern`].
    pub async fn kill_client(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Lazy container lifecycle plus in-container execution.
#[derive(Debug, Clone)]
pub struct ContainerManager {
    compose_file: PathBuf,
}

impl ContainerManager {
    pub fn new(compose_file: PathBuf) -> Self {
        Self { compose_file }
    }

    /// Ensure the named container/service is running, starting it via
    /// `compose up -d` on first use. Bounded by [`COMPOSE_UP_TIMEOUT`].
    pub async fn ensure_up(&self, name: &str) -> Result<(), ContainerError> {
        if self.is_running(name).await? {
            return Ok(());
        }

        debug!(container = name, "starting container");
        let up = Command::new("docker")
            .arg("compose")
            .arg("-f")
            .arg(&self.compose_file)
            .args(["up", "-d", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = tokio::time::timeout(COMPOSE_UP_TIMEOUT, up)
            .await
            .map_err(|_| ContainerError::StartFailed {
                container: name.to_string(),
                detail: format!("compose up timed out after {COMPOSE_UP_TIMEOUT:?}"),
            })??;

        if !output.status.success() {
            return Err(ContainerError::StartFailed {
                container: name.to_string(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        if !self.is_running(name).await? {
            return Err(ContainerError::StartFailed {
                container: name.to_string(),
                detail: "container not running after compose up".to_string(),
            });
        }
        Ok(())
    }

    async fn is_running(&self, name: &str) -> Result<bool, ContainerError> {
        let output = Command::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await?;
        Ok(output.status.success()
            && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    /// Run a command inside the container to completion, capturing output.
    /// A non-zero tool exit is data, not an error; the caller decides.
    /// Exec-client failures (container gone, command unstartable) are
    /// errors, distinguished by docker's reserved exit codes.
    pub async fn exec_capture(
        &self,
        container: &str,
        command: &str,
    ) -> Result<ExecOutput, ContainerError> {
        let output = Command::new("docker")
            .args(["exec", container, "/bin/bash", "-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        // 125/126: the docker client or runtime failed before the command
        // ran at all.
        if (exit_code == 125 || exit_code == 126)
            && stderr.contains("Error response from daemon")
        {
            return Err(ContainerError::ExecFailed {
                container: container.to_string(),
                code: exit_code,
            });
        }

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
        })
    }

    /// Spawn a long-running server inside the container and return a
    /// handle on the exec client.
    pub fn spawn_server(
        &self,
        container: &str,
        command: &str,
    ) -> Result<ServerHandle, ContainerError> {
        let child = Command::new("docker")
            .args(["exec", container, "/bin/bash", "-c", command])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        debug!(container, pid, "server spawned");
        Ok(ServerHandle {
            child,
            container: container.to_string(),
            pid,
        })
    }

    /// `pkill -<signal> -f <pattern>` inside the container. Absence of a
    /// match is not an error.
    pub async fn pkill_pattern(&self, container: &str, pattern: &str, signal: &str) {
        let result = Command::new("docker")
            .args(["exec", container, "pkill", signal, "-f", pattern])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!(container, pattern, error = %e, "pkill pattern failed");
        }
    }

    /// `pkill -<signal> <name>` inside the container, exact process name.
    pub async fn pkill_exact(&self, container: &str, name: &str, signal: &str) {
        let result = Command::new("docker")
            .args(["exec", container, "pkill", signal, name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = result {
            warn!(container, process = name, error = %e, "pkill failed");
        }
    }

    /// Kill residual debug servers for one probe: by port pattern first,
    /// then the per-interface binary names.
    pub async fn cleanup_servers(
        &self,
        container: &str,
        interface: &str,
        ports: &PortPlan,
        signal: &str,
    ) {
        for pattern in port_patterns(ports) {
            self.pkill_pattern(container, &pattern, signal).await;
        }
        for name in residual_binaries(interface) {
            self.pkill_exact(container, name, signal).await;
        }
    }
}

/// Port-derived kill patterns for servers bound to one probe's ports.
pub fn port_patterns(ports: &PortPlan) -> Vec<String> {
    vec![
        format!("gdb_port {}", ports.gdb),
        format!("port {}", ports.gdb),
        format!("RTTTelnetPort {}", ports.rtt),
        format!("TCP-LISTEN:{}", ports.rtt),
        format!("TCP-LISTEN:{}", ports.print),
    ]
}

/// Residual server binaries per probe interface. The per-interface cleanup
/// hook for tools whose grandchildren outlive SIGTERM.
pub fn residual_binaries(interface: &str) -> &'static [&'static str] {
    match interface {
        "jlink" => &["JLinkGDBServer", "JLinkGDBServerCLExe", "JLinkRTTClient", "JLinkExe"],
        "wch-link" => &["openocd", "wlink", "socat"],
        "cmsis-dap" | "esp-usb-jtag" => &["openocd"],
        "usb-uart" => &["socat"],
        _ => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortBases;

    #[test]
    fn container_name_pattern() {
        assert_eq!(container_name("debug-box-arm", 1), "debug-box-arm-p1");
        assert_eq!(container_name("debug-box-wch", 12), "debug-box-wch-p12");
    }

    #[test]
    fn combined_log_joins_streams() {
        let out = ExecOutput {
            exit_code: 1,
            stdout: "Connecting...".to_string(),
            stderr: "ERROR: no emulator".to_string(),
        };
        assert!(!out.success());
        assert_eq!(out.combined_log(), "Connecting...\nERROR: no emulator");

        let quiet = ExecOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(quiet.success());
        assert_eq!(quiet.combined_log(), "");
    }

    #[test]
    fn port_patterns_cover_all_services() {
        let ports = PortBases::default().plan(1);
        let patterns = port_patterns(&ports);
        assert!(patterns.iter().any(|p| p.contains("3331")));
        assert!(patterns.iter().any(|p| p.contains("3531")));
        assert!(patterns.iter().any(|p| p.contains("3631")));
    }

    #[test]
    fn residual_binaries_per_interface() {
        assert!(residual_binaries("jlink").contains(&"JLinkGDBServer"));
        assert!(residual_binaries("wch-link").contains(&"wlink"));
        assert!(residual_binaries("rp2040-bootsel").is_empty());
    }
}
