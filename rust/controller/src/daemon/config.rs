//! The backend-daemon configuration map: a flat key/value schema laid
//! out as `<group>.<field> = value`, published by [`super::publish`]'s
//! `ConfigMapBackend` and consumed here by the daemon process.
use snafu::{OptionExt, Snafu};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

const FIELD_HOST: &str = "host";
const FIELD_PROTOCOL: &str = "protocol";
const FIELD_BIND_IP: &str = "bind-ip";
const FIELD_BIND_PORT: &str = "bind-port";
const FIELD_MEMBERS: &str = "members";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("group {group:?} is missing field {field:?}"))]
    MissingField { group: String, field: &'static str },
    #[snafu(display("group {group:?} field {field:?} has a malformed value {value:?}"))]
    MalformedField {
        group: String,
        field: &'static str,
        value: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub address: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupConfig {
    pub name: String,
    pub host: String,
    pub protocol: String,
    pub bind_ip: Ipv4Addr,
    pub bind_port: u16,
    pub members: Vec<Member>,
}

/// Every group the daemon should be programming, parsed from the flat
/// map. Ordered by name so rendering the front-end config is
/// deterministic run to run.
pub fn parse_groups(data: &BTreeMap<String, String>) -> Result<Vec<GroupConfig>> {
    let mut names: Vec<&str> = data
        .keys()
        .filter_map(|key| key.split_once('.').map(|(group, _)| group))
        .collect();
    names.sort_unstable();
    names.dedup();

    names.into_iter().map(|name| parse_group(name, data)).collect()
}

fn field<'a>(data: &'a BTreeMap<String, String>, group: &str, field: &'static str) -> Result<&'a str> {
    data.get(&format!("{group}.{field}"))
        .map(String::as_str)
        .context(MissingFieldSnafu {
            group: group.to_string(),
            field,
        })
}

fn parse_numeric_field<T: std::str::FromStr>(data: &BTreeMap<String, String>, group: &str, field_name: &'static str) -> Result<T> {
    let raw = field(data, group, field_name)?;
    raw.parse().ok().with_context(|| MalformedFieldSnafu {
        group: group.to_string(),
        field: field_name,
        value: raw.to_string(),
    })
}

fn parse_group(name: &str, data: &BTreeMap<String, String>) -> Result<GroupConfig> {
    let host = field(data, name, FIELD_HOST)?.to_string();
    let protocol = field(data, name, FIELD_PROTOCOL)?.to_string();
    let bind_ip = parse_numeric_field(data, name, FIELD_BIND_IP)?;
    let bind_port = parse_numeric_field(data, name, FIELD_BIND_PORT)?;
    let members_raw = data.get(&format!("{name}.{FIELD_MEMBERS}")).cloned().unwrap_or_default();
    let members = parse_members(name, &members_raw)?;

    Ok(GroupConfig {
        name: name.to_string(),
        host,
        protocol,
        bind_ip,
        bind_port,
        members,
    })
}

fn parse_members(group: &str, raw: &str) -> Result<Vec<Member>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (address, port) = entry.split_once(':').with_context(|| MalformedFieldSnafu {
                group: group.to_string(),
                field: FIELD_MEMBERS,
                value: entry.to_string(),
            })?;
            let address = address.parse().ok().with_context(|| MalformedFieldSnafu {
                group: group.to_string(),
                field: FIELD_MEMBERS,
                value: entry.to_string(),
            })?;
            let port = port.parse().ok().with_context(|| MalformedFieldSnafu {
                group: group.to_string(),
                field: FIELD_MEMBERS,
                value: entry.to_string(),
            })?;
            Ok(Member { address, port })
        })
        .collect()
}

/// The flat-map encoding a `GroupConfig`, as [`super::publish`]'s
/// `ConfigMapBackend` writes it for one group.
pub fn encode_group(group: &GroupConfig) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let prefix = &group.name;
    out.insert(format!("{prefix}.{FIELD_HOST}"), group.host.clone());
    out.insert(format!("{prefix}.{FIELD_PROTOCOL}"), group.protocol.clone());
    out.insert(format!("{prefix}.{FIELD_BIND_IP}"), group.bind_ip.to_string());
    out.insert(format!("{prefix}.{FIELD_BIND_PORT}"), group.bind_port.to_string());
    out.insert(
        format!("{prefix}.{FIELD_MEMBERS}"),
        group
            .members
            .iter()
            .map(|m| format!("{}:{}", m.address, m.port))
            .collect::<Vec<_>>()
            .join(","),
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> GroupConfig {
        GroupConfig {
            name: "web".to_string(),
            host: "example.com".to_string(),
            protocol: "tcp".to_string(),
            bind_ip: "10.0.0.5".parse().unwrap(),
            bind_port: 443,
            members: vec![
                Member {
                    address: "10.1.0.1".parse().unwrap(),
                    port: 31000,
                },
                Member {
                    address: "10.1.0.2".parse().unwrap(),
                    port: 31000,
                },
            ],
        }
    }

    #[test]
    fn encode_then_parse_round_trips_a_group() {
        let encoded = encode_group(&group());
        let parsed = parse_groups(&encoded).unwrap();
        assert_eq!(parsed, vec![group()]);
    }

    #[test]
    fn multiple_groups_share_one_flat_map() {
        let mut data = encode_group(&group());
        let mut other = group();
        other.name = "api".to_string();
        data.extend(encode_group(&other));
        let parsed = parse_groups(&data).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "api");
        assert_eq!(parsed[1].name, "web");
    }

    #[test]
    fn missing_field_is_an_error() {
        let mut data = encode_group(&group());
        data.remove("web.bind-port");
        let err = parse_groups(&data).unwrap_err();
        assert!(matches!(err, Error::MissingField { field: "bind-port", .. }));
    }
}
