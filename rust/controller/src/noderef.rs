//! Parsing and formatting of provider-qualified instance identifiers.
//!
//! The grammar is fixed by the cluster API's node `providerID` field:
//! `<provider>:///<zone>/<name>`, where `zone` and `name` each match
//! `[-0-9a-z]*`. Parsing is strict: anything else is rejected.
use snafu::{OptionExt, Snafu};
use std::fmt;

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum Error {
    #[snafu(display("provider id {raw:?} is missing the \"://\" separator"))]
    MissingSeparator { raw: String },
    #[snafu(display("provider id {raw:?} has an empty provider"))]
    EmptyProvider { raw: String },
    #[snafu(display("provider id {raw:?} does not have exactly one zone/name path"))]
    MalformedPath { raw: String },
    #[snafu(display("provider id {raw:?} has an invalid zone {zone:?}"))]
    InvalidZone { raw: String, zone: String },
    #[snafu(display("provider id {raw:?} has an invalid name {name:?}"))]
    InvalidName { raw: String, name: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// A provider-qualified node identity: `<provider>:///<zone>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef {
    pub provider: String,
    pub zone: String,
    pub name: String,
}

fn is_valid_segment(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c == '-' || c.is_ascii_digit() || c.is_ascii_lowercase())
}

impl NodeRef {
    pub fn new(provider: impl Into<String>, zone: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            zone: zone.into(),
            name: name.into(),
        }
    }

    /// Parses `<provider>:///<zone>/<name>`. Strict: trailing slashes, extra
    /// path segments, or an empty provider/zone/name all fail.
    pub fn parse(raw: &str) -> Result<Self> {
        let (provider, rest) = raw.split_once(":///").context(MissingSeparatorSnafu { raw })?;
        if provider.is_empty() {
            return EmptyProviderSnafu { raw }.fail();
        }
        let mut segments = rest.split('/');
        let zone = segments.next().unwrap_or_default();
        let name = segments.next().unwrap_or_default();
        if segments.next().is_some() || zone.is_empty() || name.is_empty() {
            return MalformedPathSnafu { raw }.fail();
        }
        if !is_valid_segment(zone) {
            return InvalidZoneSnafu {
                raw,
                zone: zone.to_string(),
            }
            .fail();
        }
        if !is_valid_segment(name) {
            return InvalidNameSnafu {
                raw,
                name: name.to_string(),
            }
            .fail();
        }
        Ok(Self {
            provider: provider.to_string(),
            zone: zone.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:///{}/{}", self.provider, self.zone, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("aws:///us-east-1a/i-260942b3", "aws", "us-east-1a", "i-260942b3")]
    #[case("gce:///us-central1-a/node-1", "gce", "us-central1-a", "node-1")]
    fn parses_valid_refs(#[case] raw: &str, #[case] provider: &str, #[case] zone: &str, #[case] name: &str) {
        let parsed = NodeRef::parse(raw).unwrap();
        assert_eq!(parsed, NodeRef::new(provider, zone, name));
    }

    #[rstest]
    #[case("aws123")]
    #[case("aws://test-az/test-instance-id")]
    #[case("aws:///only-zone")]
    #[case(":///zone/name")]
    #[case("aws:///Zone/name")]
    #[case("aws:///zone/name/extra")]
    fn rejects_invalid_refs(#[case] raw: &str) {
        assert!(NodeRef::parse(raw).is_err());
    }

    #[test]
    fn format_parse_roundtrip() {
        let r = NodeRef::new("aws", "us-east-1a", "i-deadbeef");
        assert_eq!(NodeRef::parse(&r.to_string()).unwrap(), r);
    }
}
