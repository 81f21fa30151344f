//! Child process management
//!
//! Launches and owns the per-session display stack: Xvfb first, then
//! x11vnc bound to it. The browser process is built here too but its
//! lifecycle is driven by the handle manager.

use crate::config::{DisplayConfig, VncConfig};
use browsercast_common::{Error, Resolution, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One supervised child process, exclusively owned by a session
pub struct SupervisedProcess {
    name: &'static str,
    child: Child,
}

impl SupervisedProcess {
    /// Spawn a child with detached stdio
    pub fn spawn(name: &'static str, mut command: Command) -> Result<Self> {
        debug!("spawning {}: {:?}", name, command);

        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ProcessFailure(format!("failed to spawn {name}: {e}")))?;

        info!("{} started with PID {}", name, child.id());
        Ok(Self { name, child })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Liveness probe via signal 0
    pub fn is_running(&self) -> bool {
        kill(Pid::from_raw(self.child.id() as i32), None).is_ok()
    }

    /// Reap an exited child without blocking; true if it is gone
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Graceful-then-forceful termination: SIGTERM, poll for up to
    /// `grace`, then SIGKILL. Returns whether the process is confirmed
    /// dead; failure is logged, never retried past the one escalation.
    pub async fn terminate(&mut self, grace: Duration) -> bool {
        if self.has_exited() {
            debug!("{} already exited", self.name);
            return true;
        }

        let pid = Pid::from_raw(self.child.id() as i32);
        info!("stopping {} (PID {})", self.name, pid);

        if let Err(e) = kill(pid, Signal::SIGTERM) {
            warn!("SIGTERM to {} failed: {}", self.name, e);
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.has_exited() {
                debug!("{} exited after SIGTERM", self.name);
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        warn!(
            "{} did not exit within {:?}, sending SIGKILL",
            self.name, grace
        );
        if let Err(e) = kill(pid, Signal::SIGKILL) {
            warn!("SIGKILL to {} failed: {}", self.name, e);
        }

        for _ in 0..10 {
            if self.has_exited() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        warn!("{} (PID {}) survived SIGKILL", self.name, pid);
        false
    }
}

/// Launcher for the per-session display stack
pub struct Supervisor {
    display: DisplayConfig,
    vnc: VncConfig,
}

impl Supervisor {
    pub fn new(display: DisplayConfig, vnc: VncConfig) -> Self {
        Self { display, vnc }
    }

    /// Build the Xvfb argument list
    pub fn xvfb_args(&self, slot: u32, resolution: Resolution) -> Vec<String> {
        vec![
            format!(":{slot}"),
            "-screen".to_string(),
            "0".to_string(),
            format!(
                "{}x{}x{}",
                resolution.width, resolution.height, self.display.color_depth
            ),
            "-ac".to_string(),
            "+extension".to_string(),
            "GLX".to_string(),
            "+render".to_string(),
            "-noreset".to_string(),
        ]
    }

    /// Build the x11vnc argument list
    pub fn x11vnc_args(&self, slot: u32, port: u16, password: &str) -> Vec<String> {
        vec![
            "-display".to_string(),
            format!(":{slot}"),
            "-rfbport".to_string(),
            port.to_string(),
            "-passwd".to_string(),
            password.to_string(),
            "-forever".to_string(),
            "-shared".to_string(),
            "-quiet".to_string(),
            "-noxdamage".to_string(),
        ]
    }

    /// Start the virtual display server for a session
    pub async fn start_display(
        &self,
        slot: u32,
        resolution: Resolution,
    ) -> Result<SupervisedProcess> {
        let mut command = Command::new(&self.display.xvfb_binary);
        command.args(self.xvfb_args(slot, resolution));

        let process = SupervisedProcess::spawn("Xvfb", command)?;
        self.settle(process, self.display.settle_ms).await
    }

    /// Start the remote-display server bound to an already-running display
    pub async fn start_vnc(
        &self,
        slot: u32,
        port: u16,
        password: &str,
    ) -> Result<SupervisedProcess> {
        let mut command = Command::new(&self.vnc.x11vnc_binary);
        command.args(self.x11vnc_args(slot, port, password));

        let process = SupervisedProcess::spawn("x11vnc", command)?;
        self.settle(process, self.vnc.settle_ms).await
    }

    /// Neither Xvfb nor x11vnc emits a readiness signal; wait a fixed
    /// settle delay, then treat an early exit as a launch failure.
    async fn settle(
        &self,
        mut process: SupervisedProcess,
        settle_ms: u64,
    ) -> Result<SupervisedProcess> {
        tokio::time::sleep(Duration::from_millis(settle_ms)).await;
        if process.has_exited() {
            return Err(Error::ProcessFailure(format!(
                "{} exited during startup",
                process.name()
            )));
        }
        Ok(process)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DisplayConfig, VncConfig};

    fn supervisor() -> Supervisor {
        Supervisor::new(DisplayConfig::default(), VncConfig::default())
    }

    #[test]
    fn xvfb_args_encode_display_and_geometry() {
        let args = supervisor().xvfb_args(
            104,
            Resolution {
                width: 1280,
                height: 720,
            },
        );
        assert_eq!(args[0], ":104");
        assert!(args.contains(&"1280x720x24".to_string()));
        assert!(args.contains(&"-noreset".to_string()));
    }

    #[test]
    fn x11vnc_args_bind_display_port_and_password() {
        let args = supervisor().x11vnc_args(104, 5901, "s3cret");
        let display_pos = args.iter().position(|a| a == "-display").unwrap();
        assert_eq!(args[display_pos + 1], ":104");
        let port_pos = args.iter().position(|a| a == "-rfbport").unwrap();
        assert_eq!(args[port_pos + 1], "5901");
        let pw_pos = args.iter().position(|a| a == "-passwd").unwrap();
        assert_eq!(args[pw_pos + 1], "s3cret");
        assert!(args.contains(&"-shared".to_string()));
    }

    #[tokio::test]
    async fn terminate_reaps_a_short_lived_child() {
        let mut command = Command::new("sleep");
        command.arg("30");
        let mut process = SupervisedProcess::spawn("sleep", command).unwrap();
        assert!(process.is_running());

        let dead = process.terminate(Duration::from_secs(2)).await;
        assert!(dead);
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn terminate_is_safe_on_exited_child() {
        let command = Command::new("true");
        let mut process = SupervisedProcess::spawn("true", command).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(process.terminate(Duration::from_millis(100)).await);
    }
}
