//! Reads the environment variables that configure the virtual-IP
//! allocation range. Absence or a malformed address is fatal: callers
//! are expected to fail the process rather than fall back to a guess.
use snafu::{OptionExt, ResultExt, Snafu};
use std::net::Ipv4Addr;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("environment variable {name} is not set"))]
    Missing { name: &'static str },
    #[snafu(display("environment variable {name}={value:?} is not a valid IPv4 address"))]
    Invalid {
        name: &'static str,
        value: String,
        source: std::net::AddrParseError,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub struct VipRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

pub fn vip_range_from_env() -> Result<VipRange> {
    Ok(VipRange {
        start: read_ipv4("VIP_ALLOCATION_START")?,
        end: read_ipv4("VIP_ALLOCATION_END")?,
    })
}

fn read_ipv4(name: &'static str) -> Result<Ipv4Addr> {
    let value = std::env::var(name).ok().context(MissingSnafu { name })?;
    value.parse().with_context(|_| InvalidSnafu {
        name,
        value: value.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variable_is_an_error() {
        std::env::remove_var("VIP_ALLOCATION_START_TEST_MISSING");
        let err = read_ipv4("VIP_ALLOCATION_START_TEST_MISSING").unwrap_err();
        assert!(matches!(err, Error::Missing { .. }));
    }

    #[test]
    fn malformed_address_is_an_error() {
        std::env::set_var("VIP_ALLOCATION_START_TEST_BAD", "not-an-ip");
        let err = read_ipv4("VIP_ALLOCATION_START_TEST_BAD").unwrap_err();
        assert!(matches!(err, Error::Invalid { .. }));
        std::env::remove_var("VIP_ALLOCATION_START_TEST_BAD");
    }
}
