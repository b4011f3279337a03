//! Network gateway
//!
//! Configures the container's primary interface and installs per-container
//! firewall rules inside the container's network namespace. The container
//! address is allocated from the bridge subnet using a host-local counter.

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::runtime::{ContainerRuntime, ExecParams};

use super::{GatewayError, GatewayResult};

/// Container-side addresses are allocated .2 through .254
static HOST_SUFFIX: AtomicU32 = AtomicU32::new(2);

/// Host bridge parameters the gateway verifies and allocates from
#[derive(Debug, Clone)]
pub struct NetworkGatewaySettings {
    pub bridge_device: String,
    pub bridge_ip: Ipv4Addr,
    pub netmask_bit_length: u8,
}

impl NetworkGatewaySettings {
    pub fn new(
        bridge_device: impl Into<String>,
        bridge_ip: Ipv4Addr,
        netmask_bit_length: u8,
    ) -> GatewayResult<Self> {
        if !(1..=31).contains(&netmask_bit_length) {
            return Err(GatewayError::Config(format!(
                "netmask bit length {} is not in 1..=31",
                netmask_bit_length
            )));
        }

        Ok(Self {
            bridge_device: bridge_device.into(),
            bridge_ip,
            netmask_bit_length,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    fn chain(self) -> &'static str {
        match self {
            Direction::Incoming => "INPUT",
            Direction::Outgoing => "OUTPUT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Accept,
    Drop,
    Reject,
}

impl Target {
    fn as_str(self) -> &'static str {
        match self {
            Target::Accept => "ACCEPT",
            Target::Drop => "DROP",
            Target::Reject => "REJECT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }

    fn parse(value: &str) -> GatewayResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            "icmp" => Ok(Protocol::Icmp),
            other => Err(GatewayError::Config(format!("unknown protocol '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PortFilter {
    Single(u16),
    Range(u16, u16),
    Multi(Vec<u16>),
}

#[derive(Debug, Clone)]
struct Rule {
    /// CIDR, hostname or `*` for any peer
    host: String,
    ports: Option<PortFilter>,
    protocols: Vec<Protocol>,
}

#[derive(Debug, Clone)]
struct FilterEntry {
    direction: Direction,
    rules: Vec<Rule>,
    default_target: Target,
}

pub struct NetworkGateway {
    settings: NetworkGatewaySettings,
    entries: Vec<FilterEntry>,
    interface_initialized: bool,
}

impl NetworkGateway {
    pub const ID: &'static str = "network";

    pub fn new(settings: NetworkGatewaySettings) -> Self {
        Self {
            settings,
            entries: Vec::new(),
            interface_initialized: false,
        }
    }

    pub fn read_config_element(&mut self, element: &Map<String, Value>) -> GatewayResult<()> {
        let direction = match element.get("direction").and_then(Value::as_str) {
            Some("INCOMING") => Direction::Incoming,
            Some("OUTGOING") => Direction::Outgoing,
            Some(other) => {
                return Err(GatewayError::Config(format!(
                    "unknown direction '{}'",
                    other
                )))
            }
            None => {
                return Err(GatewayError::Config(
                    "'direction' is missing or not a string".into(),
                ))
            }
        };

        let allow = element
            .get("allow")
            .and_then(Value::as_array)
            .ok_or_else(|| GatewayError::Config("'allow' is missing or not an array".into()))?;

        let mut rules = Vec::new();
        for rule in allow {
            let rule = rule
                .as_object()
                .ok_or_else(|| GatewayError::Config("rule entry is not an object".into()))?;
            rules.push(parse_rule(rule)?);
        }

        let default_target = match element.get("default").and_then(Value::as_str) {
            None => Target::Drop,
            Some("ACCEPT") => Target::Accept,
            Some("DROP") => Target::Drop,
            Some("REJECT") => Target::Reject,
            Some(other) => {
                return Err(GatewayError::Config(format!("unknown target '{}'", other)))
            }
        };

        self.entries.push(FilterEntry {
            direction,
            rules,
            default_target,
        });

        Ok(())
    }

    pub async fn activate(&mut self, runtime: &Arc<dyn ContainerRuntime>) -> GatewayResult<()> {
        if !self.bridge_available() {
            return Err(GatewayError::Activation(format!(
                "bridge device {} not present on the host",
                self.settings.bridge_device
            )));
        }

        // Traffic is only routed when some entry explicitly accepts by
        // default; otherwise the interface is taken down.
        let internet_access = self
            .entries
            .iter()
            .any(|e| e.default_target == Target::Accept);

        if !internet_access {
            debug!("No accepting entry, disabling network access");
            return self.run_in_container(runtime, "ip link set eth0 down").await;
        }

        if !self.interface_initialized {
            let ip = allocate_address(self.settings.bridge_ip);
            info!(
                "Assigning {}/{} to {}",
                ip,
                self.settings.netmask_bit_length,
                runtime.name()
            );

            self.run_in_container(runtime, "ip link set eth0 up").await?;
            self.run_in_container(
                runtime,
                &format!(
                    "ip addr add {}/{} dev eth0",
                    ip, self.settings.netmask_bit_length
                ),
            )
            .await?;
            self.run_in_container(
                runtime,
                &format!("ip route add default via {}", self.settings.bridge_ip),
            )
            .await?;

            self.interface_initialized = true;
        }

        for entry in &self.entries {
            for command in render_filter_commands(entry) {
                self.run_in_container(runtime, &command).await?;
            }
        }

        Ok(())
    }

    fn bridge_available(&self) -> bool {
        Path::new("/sys/class/net")
            .join(&self.settings.bridge_device)
            .exists()
    }

    async fn run_in_container(
        &self,
        runtime: &Arc<dyn ContainerRuntime>,
        command: &str,
    ) -> GatewayResult<()> {
        runtime
            .attach(command, ExecParams::default())
            .await
            .map(|_| ())
            .map_err(|e| GatewayError::Activation(format!("'{}' failed: {}", command, e)))
    }
}

fn parse_rule(rule: &Map<String, Value>) -> GatewayResult<Rule> {
    let host = rule
        .get("host")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::Config("rule is missing 'host'".into()))?
        .to_string();

    let ports = rule.get("ports").map(parse_ports).transpose()?;

    let protocols = match rule.get("protocols") {
        None => Vec::new(),
        Some(Value::String(s)) => vec![Protocol::parse(s)?],
        Some(Value::Array(list)) => {
            let mut protocols = Vec::new();
            for value in list {
                let s = value.as_str().ok_or_else(|| {
                    GatewayError::Config("protocol entry is not a string".into())
                })?;
                protocols.push(Protocol::parse(s)?);
            }
            protocols
        }
        Some(_) => {
            return Err(GatewayError::Config(
                "'protocols' is not a string or array".into(),
            ))
        }
    };

    Ok(Rule {
        host,
        ports,
        protocols,
    })
}

fn parse_ports(value: &Value) -> GatewayResult<PortFilter> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .filter(|p| *p <= u16::MAX as u64)
            .map(|p| PortFilter::Single(p as u16))
            .ok_or_else(|| GatewayError::Config("port number out of range".into())),
        Value::String(s) => {
            let (low, high) = s
                .split_once(':')
                .ok_or_else(|| GatewayError::Config(format!("bad port range '{}'", s)))?;
            let low = low
                .parse::<u16>()
                .map_err(|_| GatewayError::Config(format!("bad port range '{}'", s)))?;
            let high = high
                .parse::<u16>()
                .map_err(|_| GatewayError::Config(format!("bad port range '{}'", s)))?;
            Ok(PortFilter::Range(low, high))
        }
        Value::Array(list) => {
            let mut ports = Vec::new();
            for entry in list {
                let port = entry
                    .as_u64()
                    .filter(|p| *p <= u16::MAX as u64)
                    .ok_or_else(|| GatewayError::Config("port list entry invalid".into()))?;
                ports.push(port as u16);
            }
            Ok(PortFilter::Multi(ports))
        }
        _ => Err(GatewayError::Config(
            "'ports' is not a number, string or array".into(),
        )),
    }
}

/// Allocate the next container address in the bridge subnet.
///
/// The last octet runs from 2 to 254 and wraps; uniqueness across live
/// containers is best-effort, matching the address generator of the
/// bridge setup.
fn allocate_address(bridge_ip: Ipv4Addr) -> Ipv4Addr {
    let suffix = HOST_SUFFIX
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            Some(if current >= 254 { 2 } else { current + 1 })
        })
        .unwrap_or(2);

    let octets = bridge_ip.octets();
    Ipv4Addr::new(octets[0], octets[1], octets[2], suffix as u8)
}

/// Render one filter entry into iptables invocations, whitelist rules
/// first, the default target last.
fn render_filter_commands(entry: &FilterEntry) -> Vec<String> {
    let chain = entry.direction.chain();
    let host_flag = match entry.direction {
        Direction::Incoming => "-s",
        Direction::Outgoing => "-d",
    };

    let mut commands = Vec::new();

    for rule in &entry.rules {
        // Port matches need a protocol; default to tcp like the original
        // bridge scripts
        let protocols: Vec<Protocol> = if rule.protocols.is_empty() {
            if rule.ports.is_some() {
                vec![Protocol::Tcp]
            } else {
                Vec::new()
            }
        } else {
            rule.protocols.clone()
        };

        let host_part = if rule.host == "*" {
            String::new()
        } else {
            format!(" {} {}", host_flag, rule.host)
        };

        let port_part = match &rule.ports {
            None => String::new(),
            Some(PortFilter::Single(port)) => format!(" --dport {}", port),
            Some(PortFilter::Range(low, high)) => format!(" --dport {}:{}", low, high),
            Some(PortFilter::Multi(ports)) => {
                let list = ports
                    .iter()
                    .map(u16::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                format!(" -m multiport --dports {}", list)
            }
        };

        if protocols.is_empty() {
            commands.push(format!("iptables -A {}{} -j ACCEPT", chain, host_part));
        } else {
            for protocol in protocols {
                commands.push(format!(
                    "iptables -A {}{} -p {}{} -j ACCEPT",
                    chain,
                    host_part,
                    protocol.as_str(),
                    port_part
                ));
            }
        }
    }

    if entry.default_target != Target::Accept {
        commands.push(format!(
            "iptables -A {} -j {}",
            chain,
            entry.default_target.as_str()
        ));
    }

    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn element(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn settings() -> NetworkGatewaySettings {
        NetworkGatewaySettings::new("sc-bridge", Ipv4Addr::new(10, 0, 3, 1), 24).unwrap()
    }

    #[test]
    fn test_settings_validate_netmask() {
        assert!(NetworkGatewaySettings::new("br0", Ipv4Addr::new(10, 0, 3, 1), 0).is_err());
        assert!(NetworkGatewaySettings::new("br0", Ipv4Addr::new(10, 0, 3, 1), 32).is_err());
        assert!(NetworkGatewaySettings::new("br0", Ipv4Addr::new(10, 0, 3, 1), 24).is_ok());
    }

    #[test]
    fn test_parse_entry() {
        let mut gw = NetworkGateway::new(settings());
        gw.read_config_element(&element(json!({
            "direction": "OUTGOING",
            "allow": [
                {"host": "*", "protocols": "icmp"},
                {"host": "10.0.3.0/24", "ports": 80},
            ],
            "default": "ACCEPT",
        })))
        .unwrap();

        assert_eq!(gw.entries.len(), 1);
        assert_eq!(gw.entries[0].rules.len(), 2);
        assert_eq!(gw.entries[0].default_target, Target::Accept);
    }

    #[test]
    fn test_parse_rejects_malformed_entries() {
        let mut gw = NetworkGateway::new(settings());

        assert!(gw
            .read_config_element(&element(json!({"allow": []})))
            .is_err());
        assert!(gw
            .read_config_element(&element(json!({"direction": "SIDEWAYS", "allow": []})))
            .is_err());
        assert!(gw
            .read_config_element(&element(json!({
                "direction": "INCOMING",
                "allow": [{"ports": 80}],
            })))
            .is_err());
        assert!(gw
            .read_config_element(&element(json!({
                "direction": "INCOMING",
                "allow": [{"host": "*", "protocols": "smtp"}],
            })))
            .is_err());
    }

    #[test]
    fn test_port_grammar() {
        assert_eq!(
            parse_ports(&json!(8080)).unwrap(),
            PortFilter::Single(8080)
        );
        assert_eq!(
            parse_ports(&json!("6000:6010")).unwrap(),
            PortFilter::Range(6000, 6010)
        );
        assert_eq!(
            parse_ports(&json!([80, 443])).unwrap(),
            PortFilter::Multi(vec![80, 443])
        );
        assert!(parse_ports(&json!(70000)).is_err());
        assert!(parse_ports(&json!("80-90")).is_err());
    }

    #[test]
    fn test_render_rules_with_default_drop() {
        let entry = FilterEntry {
            direction: Direction::Outgoing,
            rules: vec![Rule {
                host: "192.168.0.0/16".into(),
                ports: Some(PortFilter::Single(443)),
                protocols: vec![Protocol::Tcp],
            }],
            default_target: Target::Drop,
        };

        assert_eq!(
            render_filter_commands(&entry),
            vec![
                "iptables -A OUTPUT -d 192.168.0.0/16 -p tcp --dport 443 -j ACCEPT".to_string(),
                "iptables -A OUTPUT -j DROP".to_string(),
            ]
        );
    }

    #[test]
    fn test_render_multiport_and_protocol_fanout() {
        let entry = FilterEntry {
            direction: Direction::Incoming,
            rules: vec![Rule {
                host: "*".into(),
                ports: Some(PortFilter::Multi(vec![80, 443])),
                protocols: vec![Protocol::Tcp, Protocol::Udp],
            }],
            default_target: Target::Reject,
        };

        assert_eq!(
            render_filter_commands(&entry),
            vec![
                "iptables -A INPUT -p tcp -m multiport --dports 80,443 -j ACCEPT".to_string(),
                "iptables -A INPUT -p udp -m multiport --dports 80,443 -j ACCEPT".to_string(),
                "iptables -A INPUT -j REJECT".to_string(),
            ]
        );
    }

    #[test]
    fn test_accept_default_renders_no_terminal_rule() {
        let entry = FilterEntry {
            direction: Direction::Outgoing,
            rules: vec![],
            default_target: Target::Accept,
        };
        assert!(render_filter_commands(&entry).is_empty());
    }

    #[test]
    fn test_address_allocation_stays_in_subnet() {
        let ip = allocate_address(Ipv4Addr::new(10, 0, 3, 1));
        let octets = ip.octets();
        assert_eq!((octets[0], octets[1], octets[2]), (10, 0, 3));
        assert!(octets[3] >= 2);
    }

    #[tokio::test]
    async fn test_activation_fails_without_bridge() {
        use crate::runtime::mock::MockRuntime;

        let settings =
            NetworkGatewaySettings::new("definitely-no-such-bridge", Ipv4Addr::new(10, 0, 3, 1), 24)
                .unwrap();
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(MockRuntime::new("SC-0"));

        let mut gw = NetworkGateway::new(settings);
        gw.read_config_element(&element(json!({
            "direction": "OUTGOING",
            "allow": [{"host": "*"}],
            "default": "ACCEPT",
        })))
        .unwrap();

        let err = gw.activate(&runtime).await.unwrap_err();
        assert!(matches!(err, GatewayError::Activation(_)));
    }
}
