//! The load-balancer configuration object: a flat key/value schema
//! carried in a `ConfigMap`'s `data`. Each object declares one logical
//! load-balancer.
use snafu::{OptionExt, Snafu};
use std::collections::BTreeMap;
use std::fmt;

pub const KEY_TARGET_SERVICE_NAME: &str = "target-service-name";
pub const KEY_TARGET_PORT_NAME: &str = "target-port-name";
pub const KEY_HOST: &str = "host";
pub const KEY_BIND_PORT: &str = "bind-port";
pub const KEY_BIND_IP: &str = "bind-ip";
pub const KEY_SSL: &str = "SSL";
pub const KEY_SSL_PORT: &str = "ssl-port";
pub const KEY_PATH: &str = "path";
pub const KEY_TLS_CERT: &str = "TlsCert";
pub const KEY_TLS_KEY: &str = "TlsKey";
pub const KEY_STATUS: &str = "status";
const BIND_PORT_ENUM_PREFIX: &str = "port";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("configuration object is missing required key {key:?}"))]
    MissingKey { key: &'static str },
    #[snafu(display("key {key:?} has a non-numeric value {value:?}"))]
    InvalidNumber { key: &'static str, value: String },
    #[snafu(display("configuration declares no bind ports (neither {KEY_BIND_PORT:?} nor port0..N)"))]
    NoBindPorts,
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// `namespace/name`, the dedup queue's key and the object's identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LbConfig {
    pub key: ConfigKey,
    pub target_service_name: String,
    pub target_port_name: Option<String>,
    pub host: String,
    pub bind_ports: Vec<u16>,
    /// Empty until (E) assigns one, or set by the administrator to
    /// request a specific address.
    pub bind_ip: Option<String>,
    pub ssl_port: Option<u16>,
    pub tls: Option<TlsConfig>,
    /// Non-empty selects HTTP semantics (a path); empty selects TCP.
    pub path: String,
    pub status: Option<String>,
}

impl LbConfig {
    /// Parses a `ConfigMap`'s flat `data` map into a validated
    /// configuration object. `namespace`/`name` come from the object's
    /// own metadata, not from `data`.
    pub fn from_data(namespace: &str, name: &str, data: &BTreeMap<String, String>) -> Result<Self> {
        let target_service_name = data
            .get(KEY_TARGET_SERVICE_NAME)
            .context(MissingKeySnafu {
                key: KEY_TARGET_SERVICE_NAME,
            })?
            .clone();
        let host = data.get(KEY_HOST).cloned().unwrap_or_default();
        let target_port_name = data.get(KEY_TARGET_PORT_NAME).cloned();
        let bind_ip = data.get(KEY_BIND_IP).filter(|s| !s.is_empty()).cloned();
        let path = data.get(KEY_PATH).cloned().unwrap_or_default();
        let status = data.get(KEY_STATUS).cloned();

        let ssl = data
            .get(KEY_SSL)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let ssl_port = if ssl {
            Some(parse_u16(data, KEY_SSL_PORT)?)
        } else {
            None
        };
        let tls = match (data.get(KEY_TLS_CERT), data.get(KEY_TLS_KEY)) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert: cert.clone(),
                key: key.clone(),
            }),
            _ => None,
        };

        let bind_ports = parse_bind_ports(data)?;

        Ok(Self {
            key: ConfigKey {
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            target_service_name,
            target_port_name,
            host,
            bind_ports,
            bind_ip,
            ssl_port,
            tls,
            path,
            status,
        })
    }

    pub fn is_http(&self) -> bool {
        !self.path.is_empty()
    }
}

fn parse_u16(data: &BTreeMap<String, String>, key: &'static str) -> Result<u16> {
    let raw = data.get(key).context(MissingKeySnafu { key })?;
    raw.parse().ok().context(InvalidNumberSnafu {
        key,
        value: raw.clone(),
    })
}

/// A single `bind-port`, or the enumerated `port0..portN` form; either
/// is accepted.
fn parse_bind_ports(data: &BTreeMap<String, String>) -> Result<Vec<u16>> {
    if let Some(raw) = data.get(KEY_BIND_PORT) {
        return Ok(vec![raw.parse().ok().context(InvalidNumberSnafu {
            key: KEY_BIND_PORT,
            value: raw.clone(),
        })?]);
    }
    let mut ports = Vec::new();
    let mut index = 0usize;
    loop {
        let key = format!("{BIND_PORT_ENUM_PREFIX}{index}");
        match data.get(&key) {
            Some(raw) => {
                let port: u16 = raw.parse().ok().with_context(|| InvalidNumberSnafu {
                    key: "portN",
                    value: raw.clone(),
                })?;
                ports.push(port);
                index += 1;
            }
            None => break,
        }
    }
    if ports.is_empty() {
        return NoBindPortsSnafu.fail();
    }
    Ok(ports)
}

/// The write-back patch applied after a sync attempt: `status` always,
/// `bind-ip` only on success (cleared on failure).
pub fn status_patch(status: &str, bind_ip: Option<&str>) -> BTreeMap<String, String> {
    let mut patch = BTreeMap::new();
    patch.insert(KEY_STATUS.to_string(), status.to_string());
    patch.insert(KEY_BIND_IP.to_string(), bind_ip.unwrap_or_default().to_string());
    patch
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_single_bind_port() {
        let config = LbConfig::from_data(
            "default",
            "my-lb",
            &data(&[
                (KEY_TARGET_SERVICE_NAME, "svc-a"),
                (KEY_HOST, "example.com"),
                (KEY_BIND_PORT, "443"),
            ]),
        )
        .unwrap();
        assert_eq!(config.bind_ports, vec![443]);
        assert!(!config.is_http());
    }

    #[test]
    fn parses_enumerated_bind_ports() {
        let config = LbConfig::from_data(
            "default",
            "my-lb",
            &data(&[
                (KEY_TARGET_SERVICE_NAME, "svc-a"),
                ("port0", "80"),
                ("port1", "8080"),
                (KEY_PATH, "/api"),
            ]),
        )
        .unwrap();
        assert_eq!(config.bind_ports, vec![80, 8080]);
        assert!(config.is_http());
    }

    #[test]
    fn missing_target_service_is_an_error() {
        let err = LbConfig::from_data("default", "my-lb", &data(&[(KEY_BIND_PORT, "80")])).unwrap_err();
        assert!(matches!(err, Error::MissingKey { .. }));
    }

    #[test]
    fn missing_bind_ports_is_an_error() {
        let err =
            LbConfig::from_data("default", "my-lb", &data(&[(KEY_TARGET_SERVICE_NAME, "svc-a")])).unwrap_err();
        assert!(matches!(err, Error::NoBindPorts));
    }
}
