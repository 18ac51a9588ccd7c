//! The dispatch decision core.
//!
//! One entry point, [`Dispatcher::dispatch`], turns a validated request
//! into work: a synchronous flash run, or a spawned server handed to a
//! session supervisor. Validation is ordered and fail-fast; no state
//! changes before the first error. Mutual exclusion lives entirely in the
//! per-probe lock, so dispatches against different probes never wait on
//! each other.

use crate::config::{HubConfig, Mode};
use crate::container::{container_name, ContainerError, ContainerManager};
use crate::error::DispatchError;
use crate::inventory::{self, UsbDevice};
use crate::lock::ProbeLock;
use crate::ports::PortPlan;
use crate::session::{
    SessionInfo, SessionKind, SessionTable, Supervisor, TERM_TIMEOUT,
};
use crate::staging::StagedFirmware;
use crate::template::{self, TemplateVars};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// A parsed `/dispatch` request.
#[derive(Debug)]
pub struct DispatchRequest {
    pub target: String,
    pub probe_id: u32,
    pub mode: Mode,
    pub transport: Option<String>,
    /// Present iff the client uploaded a firmware file.
    pub firmware: Option<StagedFirmware>,
}

/// Successful dispatch result.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Flash ran to completion with exit code 0.
    Flash {
        exit_code: i32,
        log: String,
        duration_ms: u64,
    },
    /// A long-lived server was spawned and handed to its supervisor.
    Started { kind: SessionKind, ports: PortPlan },
}

/// The decision core, shared across HTTP handlers.
#[derive(Clone)]
pub struct Dispatcher {
    config: Arc<HubConfig>,
    manager: ContainerManager,
    table: SessionTable,
}

impl Dispatcher {
    pub fn new(config: Arc<HubConfig>, manager: ContainerManager, table: SessionTable) -> Self {
        Self {
            config,
            manager,
            table,
        }
    }

    pub fn table(&self) -> &SessionTable {
        &self.table
    }

    /// Validate and execute one dispatch against the given bus view.
    pub async fn dispatch(
        &self,
        req: DispatchRequest,
        devices: &[UsbDevice],
    ) -> Result<DispatchOutcome, DispatchError> {
        // A stop kind=all that lands between here and execution aborts the
        // dispatch; snapshot the epoch before doing anything.
        let stop_epoch = self.table.stop_epoch(req.probe_id);

        let target = self
            .config
            .get_target(&req.target)
            .ok_or_else(|| DispatchError::UnknownTarget(req.target.clone()))?;

        let probe = self
            .config
            .get_probe(req.probe_id)
            .ok_or(DispatchError::UnknownProbe(req.probe_id))?;

        let status = inventory::probe_status(probe, devices);
        if !status.connected {
            return Err(DispatchError::ProbeNotConnected(req.probe_id));
        }

        let interface = probe.interface.as_str();
        if !target
            .compatible_probes
            .for_mode(req.mode)
            .iter()
            .any(|i| i == interface)
        {
            return Err(DispatchError::IncompatibleProbe {
                probe_id: req.probe_id,
                interface: interface.to_string(),
                target: req.target.clone(),
                mode: req.mode,
            });
        }

        let transport = self.config.resolve_transport(
            &req.target,
            probe,
            req.transport.as_deref(),
            req.mode,
        )?;

        match req.mode {
            Mode::Flash if req.firmware.is_none() => {
                return Err(DispatchError::InvalidRequest(
                    "mode 'flash' requires a firmware file".to_string(),
                ));
            }
            Mode::Debug | Mode::Print if req.firmware.is_some() => {
                return Err(DispatchError::InvalidRequest(format!(
                    "mode '{}' does not accept a firmware file",
                    req.mode
                )));
            }
            _ => {}
        }

        let ports = self.config.ports.plan(probe.id);

        // Present for compatible interfaces by load-time validation, but
        // never trusted blindly at this distance from the catalog.
        let template_str = self
            .config
            .resolve_command(&req.target, interface, req.mode)
            .ok_or_else(|| {
                DispatchError::Internal(format!(
                    "no command for target={}, interface={interface}, mode={}",
                    req.target, req.mode
                ))
            })?;

        let container_key = target.container.for_interface(interface).ok_or_else(|| {
            DispatchError::Internal(format!(
                "no container selection for interface {interface}"
            ))
        })?;
        let container_base = self
            .config
            .get_container(container_key)
            .ok_or_else(|| {
                DispatchError::Internal(format!("undefined container '{container_key}'"))
            })?
            .name
            .as_str();
        let container = container_name(container_base, probe.id);

        let mut vars = TemplateVars::new();
        vars.set("gdb_port", ports.gdb)
            .set("telnet_port", ports.telnet)
            .set("rtt_port", ports.rtt)
            .set("print_port", ports.print)
            .set_opt(
                "serial",
                Some(probe.serial.as_str()).filter(|s| !s.is_empty()),
            )
            .set_opt("device_path", probe.device_path.as_deref())
            .set_opt("transport", transport.as_deref())
            .set_opt("uart_baud", target.uart_baud)
            .set_opt(
                "firmware_path",
                req.firmware.as_ref().map(|f| f.path().display().to_string()),
            );
        let command = template::render(template_str, &vars)?;

        let lock = ProbeLock::try_acquire(&self.config.server.lock_dir, req.probe_id)?;

        if self.table.stop_epoch(req.probe_id) != stop_epoch {
            return Err(DispatchError::DispatchAborted(req.probe_id));
        }

        info!(
            mcu = %req.target,
            probe_id = req.probe_id,
            mode = %req.mode,
            container = %container,
            command = %command,
            "dispatching"
        );

        match req.mode {
            Mode::Flash => {
                let Some(firmware) = req.firmware else {
                    return Err(DispatchError::InvalidRequest(
                        "mode 'flash' requires a firmware file".to_string(),
                    ));
                };
                self.run_flash(probe.id, interface, &container, &command, ports, lock, firmware)
                    .await
            }
            Mode::Debug => {
                self.start_session(
                    SessionKind::Debug,
                    probe.id,
                    interface,
                    &container,
                    &command,
                    ports,
                    ports.gdb,
                    lock,
                )
                .await
            }
            Mode::Print => {
                self.start_session(
                    SessionKind::Print,
                    probe.id,
                    interface,
                    &container,
                    &command,
                    ports,
                    ports.print,
                    lock,
                )
                .await
            }
        }
    }

    /// Run a flash command to completion inside the probe's container. The
    /// lock, the table entry, and the staged firmware are all released on
    /// every exit path.
    #[allow(clippy::too_many_arguments)]
    async fn run_flash(
        &self,
        probe_id: u32,
        interface: &str,
        container: &str,
        command: &str,
        ports: PortPlan,
        lock: ProbeLock,
        firmware: StagedFirmware,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.manager.ensure_up(container).await?;

        let info = SessionInfo::new(
            probe_id,
            SessionKind::Flash,
            container.to_string(),
            None,
            ports,
        );
        let (guard, cancel) = self
            .table
            .register(info)
            .map_err(|_| DispatchError::ProbeBusy(probe_id))?;

        let started = Instant::now();
        let exec = self.manager.exec_capture(container, command);
        tokio::pin!(exec);

        let output = tokio::select! {
            out = &mut exec => out,
            _ = cancel.cancelled() => {
                warn!(probe_id, container, "flash aborted by stop request");
                self.manager
                    .cleanup_servers(container, interface, &ports, "-TERM")
                    .await;
                if tokio::time::timeout(TERM_TIMEOUT, &mut exec).await.is_err() {
                    self.manager
                        .cleanup_servers(container, interface, &ports, "-KILL")
                        .await;
                }
                drop(lock);
                drop(guard);
                return Err(DispatchError::DispatchAborted(probe_id));
            }
        };

        drop(lock);
        drop(guard);
        drop(firmware);

        let output = output.map_err(|e: ContainerError| DispatchError::from(e))?;
        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            probe_id,
            exit_code = output.exit_code,
            duration_ms,
            "flash finished"
        );

        if output.success() {
            Ok(DispatchOutcome::Flash {
                exit_code: output.exit_code,
                log: output.combined_log(),
                duration_ms,
            })
        } else {
            Err(DispatchError::ToolFailed {
                exit_code: output.exit_code,
                log: output.combined_log(),
            })
        }
    }

    /// Spawn a long-lived server and hand everything to its supervisor.
    #[allow(clippy::too_many_arguments)]
    async fn start_session(
        &self,
        kind: SessionKind,
        probe_id: u32,
        interface: &str,
        container: &str,
        command: &str,
        ports: PortPlan,
        primary_port: u16,
        lock: ProbeLock,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.manager.ensure_up(container).await?;

        // Residual servers from a crashed session would hold the ports.
        self.manager
            .cleanup_servers(container, interface, &ports, "-TERM")
            .await;

        let mut server = self
            .manager
            .spawn_server(container, command)
            .map_err(|e| DispatchError::Internal(e.to_string()))?;

        let info = SessionInfo::new(
            probe_id,
            kind,
            container.to_string(),
            server.pid(),
            ports,
        );
        let (guard, cancel) = match self.table.register(info) {
            Ok(pair) => pair,
            Err(_) => {
                server.kill_client().await;
                return Err(DispatchError::Internal(format!(
                    "session table already holds probe {probe_id}"
                )));
            }
        };

        let supervisor = Supervisor::new(
            interface.to_string(),
            container.to_string(),
            ports,
            primary_port,
            self.manager.clone(),
            self.table.clone(),
            guard,
            cancel,
            lock,
            server,
        );
        tokio::spawn(supervisor.run());

        Ok(DispatchOutcome::Started { kind, ports })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use tempfile::TempDir;

    fn test_config(lock_dir: &std::path::Path) -> Arc<HubConfig> {
        let yaml = format!(
            r#"
server:
  lock_dir: {}
containers:
  debug-box-arm:
    name: debug-box-arm
    image_name: debug-box-arm
probes:
  - id: 1
    name: "J-Link Plus"
    interface: jlink
    vendor_id: "1366"
    product_id: "0105"
    serial: "S1"
targets:
  nrf52840:
    container: debug-box-arm
    compatible_probes:
      debug: [jlink]
      flash: [jlink]
    transports:
      jlink: {{ default: swd, allowed: [swd, jtag] }}
    commands:
      jlink:
        debug: "JLinkGDBServer -select usb={{serial}} -port {{gdb_port}} -if {{transport}}"
        flash: "JLinkExe -usb {{serial}} -if {{transport}} {{firmware_path}}"
"#,
            lock_dir.display()
        );
        let config: HubConfig = serde_yaml::from_str(&yaml).unwrap();
        config.validate().unwrap();
        Arc::new(config)
    }

    fn dispatcher(config: Arc<HubConfig>) -> Dispatcher {
        let manager = ContainerManager::new(config.server.compose_file.clone());
        Dispatcher::new(config, manager, SessionTable::new())
    }

    fn connected_jlink() -> Vec<UsbDevice> {
        vec![UsbDevice {
            vendor_id: 0x1366,
            product_id: 0x0105,
            serial: Some("S1".to_string()),
        }]
    }

    fn request(mode: Mode) -> DispatchRequest {
        DispatchRequest {
            target: "nrf52840".to_string(),
            probe_id: 1,
            mode,
            transport: None,
            firmware: None,
        }
    }

    #[tokio::test]
    async fn unknown_target_rejected_first() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(test_config(dir.path()));
        let mut req = request(Mode::Debug);
        req.target = "stm32f4".to_string();
        let err = d.dispatch(req, &connected_jlink()).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownTarget(_)));
    }

    #[tokio::test]
    async fn unknown_probe_rejected() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(test_config(dir.path()));
        let mut req = request(Mode::Debug);
        req.probe_id = 9;
        let err = d.dispatch(req, &connected_jlink()).await.unwrap_err();
        assert!(matches!(err, DispatchError::UnknownProbe(9)));
    }

    #[tokio::test]
    async fn disconnected_probe_rejected() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(test_config(dir.path()));
        let err = d.dispatch(request(Mode::Debug), &[]).await.unwrap_err();
        assert!(matches!(err, DispatchError::ProbeNotConnected(1)));
    }

    #[tokio::test]
    async fn incompatible_mode_rejected() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(test_config(dir.path()));
        // jlink is not in the (empty) print compatibility list
        let err = d
            .dispatch(request(Mode::Print), &connected_jlink())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::IncompatibleProbe { .. }));
    }

    #[tokio::test]
    async fn disallowed_transport_rejected() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(test_config(dir.path()));
        let mut req = request(Mode::Debug);
        req.transport = Some("sdi".to_string());
        let err = d.dispatch(req, &connected_jlink()).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTransport(_)));
    }

    #[tokio::test]
    async fn flash_without_firmware_rejected() {
        let dir = TempDir::new().unwrap();
        let d = dispatcher(test_config(dir.path()));
        let err = d
            .dispatch(request(Mode::Flash), &connected_jlink())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn busy_probe_refused_not_queued() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let d = dispatcher(config.clone());

        let held = ProbeLock::try_acquire(&config.server.lock_dir, 1).unwrap();
        let err = d
            .dispatch(request(Mode::Debug), &connected_jlink())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ProbeBusy(1)));
        drop(held);
    }
}
