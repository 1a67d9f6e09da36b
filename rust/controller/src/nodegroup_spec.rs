//! Parses the `--nodes=<spec>` CLI argument: a colon-delimited tuple
//! describing one statically configured node group.
use snafu::{ensure, OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu, PartialEq)]
pub enum Error {
    #[snafu(display("spec {raw:?} must have the form min:max:name or min:max:name:cost"))]
    WrongFieldCount { raw: String },
    #[snafu(display("spec {raw:?} has a non-numeric min size"))]
    InvalidMin { raw: String },
    #[snafu(display("spec {raw:?} has a non-numeric max size"))]
    InvalidMax { raw: String },
    #[snafu(display("spec {raw:?} has a non-numeric cost"))]
    InvalidCost { raw: String },
    #[snafu(display("spec {raw:?} has an empty identifier"))]
    EmptyIdentifier { raw: String },
    #[snafu(display("spec {raw:?} has min size {min} < 1"))]
    MinBelowOne { raw: String, min: i64 },
    #[snafu(display("spec {raw:?} has max size {max} < min size {min}"))]
    MaxBelowMin { raw: String, min: i64, max: i64 },
    #[snafu(display("spec {raw:?} has a negative cost {cost}"))]
    NegativeCost { raw: String, cost: f64 },
    #[snafu(display("identifier {identifier:?} is not a valid instance-group URL"))]
    NotAGroupUrl { identifier: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// A validated `min:max:name[:cost]` tuple.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeGroupSpec {
    pub min_size: i64,
    pub max_size: i64,
    pub identifier: String,
    pub cost: Option<f64>,
}

/// The (project, zone, group) triple decomposed out of a GCE-style
/// instance-group URL identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupUrlParts {
    pub project: String,
    pub zone: String,
    pub group: String,
}

impl NodeGroupSpec {
    /// Parses `min:max:name` or `min:max:name:cost`.
    pub fn parse(raw: &str) -> Result<Self> {
        let fields: Vec<&str> = raw.splitn(4, ':').collect();
        ensure!(
            fields.len() == 3 || fields.len() == 4,
            WrongFieldCountSnafu { raw }
        );

        let min_size: i64 = fields[0].parse().ok().context(InvalidMinSnafu { raw })?;
        let max_size: i64 = fields[1].parse().ok().context(InvalidMaxSnafu { raw })?;
        let identifier = fields[2].to_string();
        ensure!(!identifier.is_empty(), EmptyIdentifierSnafu { raw });

        let cost = match fields.get(3) {
            Some(raw_cost) => {
                let cost: f64 = raw_cost.parse().ok().context(InvalidCostSnafu { raw })?;
                ensure!(cost >= 0.0, NegativeCostSnafu { raw, cost });
                Some(cost)
            }
            None => None,
        };

        ensure!(min_size >= 1, MinBelowOneSnafu { raw, min: min_size });
        ensure!(
            max_size >= min_size,
            MaxBelowMinSnafu {
                raw,
                min: min_size,
                max: max_size
            }
        );

        Ok(Self {
            min_size,
            max_size,
            identifier,
            cost,
        })
    }

    /// Decomposes `identifier` as a GCE-style instance-group URL:
    /// `https://<host>/compute/v1/projects/<project>/zones/<zone>/instanceGroups/<name>`.
    pub fn group_url_parts(&self) -> Result<GroupUrlParts> {
        parse_group_url(&self.identifier)
    }
}

fn parse_group_url(identifier: &str) -> Result<GroupUrlParts> {
    let segments: Vec<&str> = identifier.split('/').collect();
    let project = find_after(&segments, "projects");
    let zone = find_after(&segments, "zones");
    let group = find_after(&segments, "instanceGroups");
    match (project, zone, group) {
        (Some(project), Some(zone), Some(group)) => Ok(GroupUrlParts {
            project: project.to_string(),
            zone: zone.to_string(),
            group: group.to_string(),
        }),
        _ => NotAGroupUrlSnafu {
            identifier: identifier.to_string(),
        }
        .fail(),
    }
}

fn find_after<'a>(segments: &[&'a str], marker: &str) -> Option<&'a str> {
    segments
        .iter()
        .position(|s| *s == marker)
        .and_then(|idx| segments.get(idx + 1))
        .filter(|s| !s.is_empty())
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_minimal_spec() {
        let spec = NodeGroupSpec::parse("1:5:test-asg").unwrap();
        assert_eq!(spec.min_size, 1);
        assert_eq!(spec.max_size, 5);
        assert_eq!(spec.identifier, "test-asg");
        assert_eq!(spec.cost, None);
    }

    #[test]
    fn parses_spec_with_url_and_cost() {
        let raw = "111:222:https://www.googleapis.com/compute/v1/projects/p/zones/z/instanceGroups/test-name:1.5";
        let spec = NodeGroupSpec::parse(raw).unwrap();
        assert_eq!(spec.min_size, 111);
        assert_eq!(spec.max_size, 222);
        assert_eq!(spec.cost, Some(1.5));
        let parts = spec.group_url_parts().unwrap();
        assert_eq!(parts.project, "p");
        assert_eq!(parts.zone, "z");
        assert_eq!(parts.group, "test-name");
    }

    #[rstest]
    #[case("a")]
    #[case("a:b:c")]
    #[case("1:")]
    #[case("1:2:")]
    #[case("-1:2:x")]
    #[case("5:3:x")]
    fn rejects_invalid_specs(#[case] raw: &str) {
        assert!(NodeGroupSpec::parse(raw).is_err());
    }

    #[rstest]
    #[case(1, 1, "x")]
    #[case(1, 100, "a-valid-name")]
    fn roundtrips_min_max_name(#[case] min: i64, #[case] max: i64, #[case] name: &str) {
        let raw = format!("{min}:{max}:{name}");
        let spec = NodeGroupSpec::parse(&raw).unwrap();
        assert_eq!((spec.min_size, spec.max_size, spec.identifier.as_str()), (min, max, name));
    }
}
