//! Capability enforcement gateways
//!
//! A gateway applies one dimension of sandbox policy to a container:
//! network filtering, file exposure, device nodes, cgroup limits, D-Bus
//! access, display and audio sockets, environment variables.
//!
//! All gateways share the same skeleton: configuration entries are
//! accumulated through `set_config`, then applied in one step by
//! `activate`. Gateways are either one-shot or dynamic; dynamic gateways
//! accept further `set_config`/`activate` rounds after activation.

mod cgroups;
mod config;
mod dbus;
mod device;
mod env;
mod file;
mod network;
mod pulse;
mod wayland;

pub use cgroups::CgroupsGateway;
pub use config::GatewayConfiguration;
pub use dbus::{DbusGateway, ProxyKind};
pub use device::DeviceNodeGateway;
pub use env::EnvironmentGateway;
pub use file::FileGateway;
pub use network::{NetworkGateway, NetworkGatewaySettings};
pub use pulse::PulseGateway;
pub use wayland::WaylandGateway;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::debug;

use crate::runtime::ContainerRuntime;

/// Error taxonomy shared by all gateways
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("configuration rejected: {0}")]
    Config(String),

    #[error("activation failed: {0}")]
    Activation(String),

    #[error("teardown failed: {0}")]
    Teardown(String),

    #[error("gateway has no attached container")]
    NotAttached,
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GatewayState {
    Created,
    Configured,
    Activated,
}

/// The built-in gateway kinds
pub enum GatewayKind {
    Network(NetworkGateway),
    File(FileGateway),
    Device(DeviceNodeGateway),
    Cgroups(CgroupsGateway),
    Dbus(DbusGateway),
    Wayland(WaylandGateway),
    Pulse(PulseGateway),
    Environment(EnvironmentGateway),
}

impl GatewayKind {
    fn id(&self) -> &'static str {
        match self {
            GatewayKind::Network(_) => NetworkGateway::ID,
            GatewayKind::File(_) => FileGateway::ID,
            GatewayKind::Device(_) => DeviceNodeGateway::ID,
            GatewayKind::Cgroups(_) => CgroupsGateway::ID,
            GatewayKind::Dbus(_) => DbusGateway::ID,
            GatewayKind::Wayland(_) => WaylandGateway::ID,
            GatewayKind::Pulse(_) => PulseGateway::ID,
            GatewayKind::Environment(_) => EnvironmentGateway::ID,
        }
    }

    fn is_dynamic(&self) -> bool {
        matches!(
            self,
            GatewayKind::Device(_)
                | GatewayKind::Dbus(_)
                | GatewayKind::Wayland(_)
        )
    }

    fn read_config_element(&mut self, element: &Map<String, Value>) -> GatewayResult<()> {
        match self {
            GatewayKind::Network(g) => g.read_config_element(element),
            GatewayKind::File(g) => g.read_config_element(element),
            GatewayKind::Device(g) => g.read_config_element(element),
            GatewayKind::Cgroups(g) => g.read_config_element(element),
            GatewayKind::Dbus(g) => g.read_config_element(element),
            GatewayKind::Wayland(g) => g.read_config_element(element),
            GatewayKind::Pulse(g) => g.read_config_element(element),
            GatewayKind::Environment(g) => g.read_config_element(element),
        }
    }

    async fn activate(&mut self, runtime: &Arc<dyn ContainerRuntime>) -> GatewayResult<()> {
        match self {
            GatewayKind::Network(g) => g.activate(runtime).await,
            GatewayKind::File(g) => g.activate(runtime).await,
            GatewayKind::Device(g) => g.activate(runtime).await,
            GatewayKind::Cgroups(g) => g.activate(runtime).await,
            GatewayKind::Dbus(g) => g.activate(runtime).await,
            GatewayKind::Wayland(g) => g.activate(runtime).await,
            GatewayKind::Pulse(g) => g.activate(runtime).await,
            GatewayKind::Environment(g) => g.activate(runtime).await,
        }
    }

    async fn teardown(&mut self, runtime: &Arc<dyn ContainerRuntime>) -> GatewayResult<()> {
        match self {
            GatewayKind::Dbus(g) => g.teardown(runtime).await,
            _ => Ok(()),
        }
    }
}

/// A gateway instance attached to one container
pub struct Gateway {
    state: GatewayState,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    kind: GatewayKind,
}

impl Gateway {
    pub fn new(kind: GatewayKind, runtime: Option<Arc<dyn ContainerRuntime>>) -> Self {
        Self {
            state: GatewayState::Created,
            runtime,
            kind,
        }
    }

    /// The full gateway set for a container, in activation order.
    ///
    /// The network gateway is only part of the set when bridge settings are
    /// configured.
    pub fn standard_set(
        runtime: Arc<dyn ContainerRuntime>,
        gateway_dir: PathBuf,
        network: Option<NetworkGatewaySettings>,
    ) -> Vec<Gateway> {
        let mut set = Vec::new();

        if let Some(settings) = network {
            set.push(Gateway::new(
                GatewayKind::Network(NetworkGateway::new(settings)),
                Some(runtime.clone()),
            ));
        }

        let container_name = runtime.name().to_string();
        set.extend([
            Gateway::new(
                GatewayKind::Pulse(PulseGateway::new()),
                Some(runtime.clone()),
            ),
            Gateway::new(
                GatewayKind::Device(DeviceNodeGateway::new()),
                Some(runtime.clone()),
            ),
            Gateway::new(
                GatewayKind::Dbus(DbusGateway::new(gateway_dir, &container_name)),
                Some(runtime.clone()),
            ),
            Gateway::new(
                GatewayKind::Cgroups(CgroupsGateway::new()),
                Some(runtime.clone()),
            ),
            Gateway::new(
                GatewayKind::Wayland(WaylandGateway::new()),
                Some(runtime.clone()),
            ),
            Gateway::new(
                GatewayKind::Environment(EnvironmentGateway::new()),
                Some(runtime.clone()),
            ),
            Gateway::new(GatewayKind::File(FileGateway::new()), Some(runtime)),
        ]);

        set
    }

    /// The stable id used to match configuration bundles
    pub fn id(&self) -> &'static str {
        self.kind.id()
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    pub fn is_dynamic(&self) -> bool {
        self.kind.is_dynamic()
    }

    pub fn is_configured(&self) -> bool {
        self.state >= GatewayState::Configured
    }

    pub fn is_activated(&self) -> bool {
        self.state >= GatewayState::Activated
    }

    /// Accumulate configuration entries from a JSON array.
    ///
    /// Fails on a non-array or empty input, on any non-object element, and
    /// on the first element the gateway itself rejects. Dynamic gateways may
    /// be reconfigured after activation; others may not.
    pub fn set_config(&mut self, config: &Value) -> GatewayResult<()> {
        if self.state == GatewayState::Activated && !self.is_dynamic() {
            return Err(GatewayError::Config(format!(
                "gateway {} is already activated",
                self.id()
            )));
        }

        let entries = config
            .as_array()
            .ok_or_else(|| GatewayError::Config("root element is not an array".into()))?;

        if entries.is_empty() {
            return Err(GatewayError::Config("configuration array is empty".into()));
        }

        for entry in entries {
            let element = entry
                .as_object()
                .ok_or_else(|| GatewayError::Config("configuration entry is not an object".into()))?;
            self.kind.read_config_element(element)?;
        }

        self.state = GatewayState::Configured;
        Ok(())
    }

    /// Apply the accumulated configuration.
    pub async fn activate(&mut self) -> GatewayResult<()> {
        if self.state != GatewayState::Configured {
            return Err(GatewayError::Activation(format!(
                "gateway {} is not configured",
                self.id()
            )));
        }

        let runtime = self.runtime.clone().ok_or(GatewayError::NotAttached)?;

        debug!("Activating gateway {}", self.id());
        self.kind.activate(&runtime).await?;

        self.state = GatewayState::Activated;
        Ok(())
    }

    /// Reverse the gateway's effect on the system where possible.
    pub async fn teardown(&mut self) -> GatewayResult<()> {
        if self.state != GatewayState::Activated {
            return Err(GatewayError::Teardown(format!(
                "gateway {} is not activated",
                self.id()
            )));
        }

        let runtime = self.runtime.clone().ok_or(GatewayError::NotAttached)?;

        debug!("Tearing down gateway {}", self.id());
        self.kind.teardown(&runtime).await?;

        self.state = GatewayState::Created;
        Ok(())
    }
}
