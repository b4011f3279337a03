//! D-Bus gateway
//!
//! Two independent instances, one per bus kind, each supervising a
//! `dbus-proxy` filtering subprocess that exposes a UNIX socket inside the
//! container. Only method calls matching the configured rules are
//! forwarded. The gateway is dynamic: later configuration rounds are
//! pushed to the already-running proxy.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, info, warn};

use crate::runtime::ContainerRuntime;

use super::{GatewayError, GatewayResult};

/// How long to wait for the proxy to create its socket
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Session,
    System,
}

impl ProxyKind {
    fn config_key(self) -> &'static str {
        match self {
            ProxyKind::Session => "dbus-gateway-config-session",
            ProxyKind::System => "dbus-gateway-config-system",
        }
    }

    fn bus_argument(self) -> &'static str {
        match self {
            ProxyKind::Session => "session",
            ProxyKind::System => "system",
        }
    }

    fn env_variable(self) -> &'static str {
        match self {
            ProxyKind::Session => "DBUS_SESSION_BUS_ADDRESS",
            ProxyKind::System => "DBUS_SYSTEM_BUS_ADDRESS",
        }
    }

    fn socket_prefix(self) -> &'static str {
        match self {
            ProxyKind::Session => "sess_",
            ProxyKind::System => "sys_",
        }
    }
}

struct ProxyProcess {
    child: Child,
    stdin: ChildStdin,
}

struct DbusGatewayInstance {
    kind: ProxyKind,
    socket_path: PathBuf,
    rules: Vec<Value>,
    proxy: Option<ProxyProcess>,
}

impl DbusGatewayInstance {
    fn new(kind: ProxyKind, gateway_dir: &PathBuf, container_name: &str) -> Self {
        let socket_name = format!("{}{}.sock", kind.socket_prefix(), container_name);
        Self {
            kind,
            socket_path: gateway_dir.join(socket_name),
            rules: Vec::new(),
            proxy: None,
        }
    }

    fn socket_name(&self) -> String {
        self.socket_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    fn add_rules(&mut self, rules: &[Value]) {
        self.rules.extend(rules.iter().cloned());
    }

    fn has_rules(&self) -> bool {
        !self.rules.is_empty()
    }

    /// The full proxy configuration: this instance's rules under its own
    /// key, an empty array under the other kind's key.
    fn render_config(&self) -> String {
        let (own_key, other_key) = match self.kind {
            ProxyKind::Session => (
                ProxyKind::Session.config_key(),
                ProxyKind::System.config_key(),
            ),
            ProxyKind::System => (
                ProxyKind::System.config_key(),
                ProxyKind::Session.config_key(),
            ),
        };

        json!({
            own_key: self.rules,
            other_key: [],
        })
        .to_string()
    }

    async fn activate(&mut self, runtime: &Arc<dyn ContainerRuntime>) -> GatewayResult<()> {
        // Spawning and the container environment are first-activation-only;
        // later rounds just push the updated config to the proxy.
        if self.proxy.is_none() {
            let variable = self.kind.env_variable();
            let host_address = match std::env::var(variable) {
                Ok(address) => Some(address),
                Err(_) if self.kind == ProxyKind::Session => {
                    return Err(GatewayError::Activation(format!(
                        "session bus requested but {} is not set on the host",
                        variable
                    )));
                }
                Err(_) => {
                    warn!(
                        "{} not set on the host, the system bus proxy may not connect",
                        variable
                    );
                    None
                }
            };

            self.spawn_proxy(host_address.as_deref())?;
            self.wait_for_socket().await?;

            let container_address =
                format!("unix:path=/gateways/{}", self.socket_name());
            runtime
                .set_environment_variable(variable, &container_address)
                .await
                .map_err(|e| GatewayError::Activation(e.to_string()))?;
        }

        self.send_config().await
    }

    fn spawn_proxy(&mut self, host_address: Option<&str>) -> GatewayResult<()> {
        let mut command = Command::new("dbus-proxy");
        command
            .arg(&self.socket_path)
            .arg(self.kind.bus_argument())
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        if let Some(address) = host_address {
            command.env(self.kind.env_variable(), address);
        }

        let mut child = command.spawn().map_err(|e| {
            GatewayError::Activation(format!("failed to launch dbus-proxy: {}", e))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            GatewayError::Activation("dbus-proxy spawned without stdin".into())
        })?;

        info!(
            "Started dbus-proxy for {} bus, pid {:?}",
            self.kind.bus_argument(),
            child.id()
        );
        self.proxy = Some(ProxyProcess { child, stdin });
        Ok(())
    }

    async fn wait_for_socket(&self) -> GatewayResult<()> {
        let deadline = tokio::time::Instant::now() + SOCKET_TIMEOUT;

        while !self.socket_path.exists() {
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::Activation(format!(
                    "dbus-proxy did not create socket {}",
                    self.socket_path.display()
                )));
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }

        debug!("Found D-Bus socket {}", self.socket_path.display());
        Ok(())
    }

    async fn send_config(&mut self) -> GatewayResult<()> {
        // The proxy reads a single-line JSON document terminated by a
        // newline
        let config = format!("{}\n", self.render_config());
        let bytes = config.as_bytes();

        let proxy = self
            .proxy
            .as_mut()
            .ok_or_else(|| GatewayError::Activation("dbus-proxy is not running".into()))?;

        debug!("Writing {} config bytes to dbus-proxy", bytes.len());
        proxy.stdin.write_all(bytes).await.map_err(|e| {
            GatewayError::Activation(format!("failed to write dbus-proxy config: {}", e))
        })?;
        proxy.stdin.flush().await.map_err(|e| {
            GatewayError::Activation(format!("failed to flush dbus-proxy config: {}", e))
        })?;

        Ok(())
    }

    async fn teardown(&mut self) -> GatewayResult<()> {
        let mut success = true;

        if let Some(mut proxy) = self.proxy.take() {
            debug!("Killing dbus-proxy {:?}", proxy.child.id());

            // SIGTERM has been seen to hang some proxy configurations
            if let Err(e) = proxy.child.kill().await {
                warn!("Could not kill dbus-proxy: {}", e);
                success = false;
            }
            let _ = proxy.child.wait().await;

            // Stdin is dropped with the proxy handle; no more configs will
            // be sent
        }

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    "Could not remove {}: {}",
                    self.socket_path.display(),
                    e
                );
                success = false;
            }
        }

        if success {
            Ok(())
        } else {
            Err(GatewayError::Teardown(format!(
                "{} bus proxy did not shut down cleanly",
                self.kind.bus_argument()
            )))
        }
    }
}

/// The compound gateway: a session and a system bus instance.
pub struct DbusGateway {
    session: DbusGatewayInstance,
    system: DbusGatewayInstance,
}

impl DbusGateway {
    pub const ID: &'static str = "dbus";

    pub fn new(gateway_dir: PathBuf, container_name: &str) -> Self {
        Self {
            session: DbusGatewayInstance::new(ProxyKind::Session, &gateway_dir, container_name),
            system: DbusGatewayInstance::new(ProxyKind::System, &gateway_dir, container_name),
        }
    }

    pub fn read_config_element(&mut self, element: &Map<String, Value>) -> GatewayResult<()> {
        let mut matched = false;

        for instance in [&mut self.session, &mut self.system] {
            if let Some(value) = element.get(instance.kind.config_key()) {
                let rules = value.as_array().ok_or_else(|| {
                    GatewayError::Config(format!(
                        "'{}' is not an array",
                        instance.kind.config_key()
                    ))
                })?;
                instance.add_rules(rules);
                matched = true;
            }
        }

        if !matched {
            return Err(GatewayError::Config(
                "element carries neither session nor system bus configuration".into(),
            ));
        }

        Ok(())
    }

    pub async fn activate(&mut self, runtime: &Arc<dyn ContainerRuntime>) -> GatewayResult<()> {
        for instance in [&mut self.session, &mut self.system] {
            if instance.has_rules() {
                instance.activate(runtime).await?;
            }
        }
        Ok(())
    }

    pub async fn teardown(&mut self, _runtime: &Arc<dyn ContainerRuntime>) -> GatewayResult<()> {
        let mut first_error = None;

        for instance in [&mut self.session, &mut self.system] {
            if let Err(e) = instance.teardown().await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}
