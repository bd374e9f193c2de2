use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, bail};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info};

use peerproxy_core::channel::VpnDevice;
use peerproxy_core::error::{ProxyError, Result};

/// The single VPN device of this instance together with the id of the
/// session currently routing through it.
pub struct VpnSlot<V> {
    device: V,
    owner: Mutex<Option<u64>>,
}

impl<V: VpnDevice> VpnSlot<V> {
    pub fn new(device: V) -> Self {
        Self {
            device,
            owner: Mutex::new(None),
        }
    }

    pub fn device(&self) -> &V {
        &self.device
    }

    pub fn owner(&self) -> Option<u64> {
        *self.owner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves the device for `session_id`. Claiming twice from the same
    /// session is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::DeviceBusy`] if another session holds it.
    pub fn claim(&self, session_id: u64) -> Result<()> {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        match *owner {
            Some(current) if current != session_id => {
                Err(ProxyError::DeviceBusy { session_id: current })
            }
            _ => {
                *owner = Some(session_id);
                Ok(())
            }
        }
    }

    /// Releases the device if `session_id` holds it.
    pub fn release(&self, session_id: u64) {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if *owner == Some(session_id) {
            debug!(session_id, "VPN device released");
            *owner = None;
        }
    }
}

/// Drives a platform VPN through an external helper program.
///
/// The helper is invoked as `<program> start <proxy_port>` and
/// `<program> stop`; its trimmed stdout becomes the status message and a
/// non-zero exit status is an error.
pub struct ExternalVpnDevice {
    program: Option<PathBuf>,
    on_disconnect: Mutex<Option<oneshot::Sender<String>>>,
}

impl ExternalVpnDevice {
    pub fn new(program: Option<PathBuf>) -> Self {
        Self {
            program,
            on_disconnect: Mutex::new(None),
        }
    }

    async fn run(&self, args: &[String]) -> anyhow::Result<String> {
        let Some(program) = &self.program else {
            bail!("no VPN helper configured (use --vpn-command)");
        };
        debug!(program = %program.display(), ?args, "Running VPN helper");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("failed to run {}", program.display()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                program.display(),
                output.status,
                stderr.trim()
            );
        }
        Ok(stdout)
    }
}

impl VpnDevice for ExternalVpnDevice {
    fn start(
        &self,
        proxy_port: u16,
        on_disconnect: oneshot::Sender<String>,
    ) -> impl Future<Output = anyhow::Result<String>> + Send + '_ {
        async move {
            let message = self
                .run(&["start".to_string(), proxy_port.to_string()])
                .await?;
            info!(proxy_port, "VPN helper started");
            // The helper cannot report a drop on its own; holding the sender
            // keeps the session's disconnect watch open until stop().
            *self
                .on_disconnect
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(on_disconnect);
            Ok(message)
        }
    }

    fn stop(&self) -> impl Future<Output = anyhow::Result<String>> + Send + '_ {
        async move {
            self.on_disconnect
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let message = self.run(&["stop".to_string()]).await?;
            info!("VPN helper stopped");
            Ok(message)
        }
    }
}
