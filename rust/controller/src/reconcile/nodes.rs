//! Node-readiness and primary-address helpers shared by the reconcile
//! engine's node-event handling.
use k8s_openapi::api::core::v1::Node;

/// A node is Ready when the first condition of type "Ready" in its
/// status is `True`.
pub fn is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status == "True")
        .unwrap_or(false)
}

/// The address a pool member is reached at: the node's name if it has
/// one usable as a DNS label, otherwise its primary IP. Callers that
/// need a specific address type should use [`primary_ip`] directly.
pub fn primary_ip(node: &Node) -> Option<String> {
    node.status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .and_then(|addrs| {
            addrs
                .iter()
                .find(|a| a.type_ == "InternalIP")
                .or_else(|| addrs.iter().find(|a| a.type_ == "ExternalIP"))
        })
        .map(|a| a.address.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, NodeStatus};

    fn node_with(conditions: Vec<NodeCondition>, addresses: Vec<NodeAddress>) -> Node {
        Node {
            status: Some(NodeStatus {
                conditions: Some(conditions),
                addresses: Some(addresses),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn condition(type_: &str, status: &str) -> NodeCondition {
        NodeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_heartbeat_time: None,
            last_transition_time: None,
            message: None,
            reason: None,
        }
    }

    #[test]
    fn ready_uses_the_first_ready_typed_condition() {
        let node = node_with(
            vec![condition("MemoryPressure", "False"), condition("Ready", "True")],
            vec![],
        );
        assert!(is_ready(&node));
    }

    #[test]
    fn not_ready_when_condition_is_false() {
        let node = node_with(vec![condition("Ready", "False")], vec![]);
        assert!(!is_ready(&node));
    }

    #[test]
    fn missing_status_is_not_ready() {
        assert!(!is_ready(&Node::default()));
    }

    #[test]
    fn prefers_internal_ip() {
        let node = node_with(
            vec![],
            vec![
                NodeAddress {
                    type_: "ExternalIP".to_string(),
                    address: "203.0.113.9".to_string(),
                },
                NodeAddress {
                    type_: "InternalIP".to_string(),
                    address: "10.0.0.9".to_string(),
                },
            ],
        );
        assert_eq!(primary_ip(&node).as_deref(), Some("10.0.0.9"));
    }
}
