/// Routing policies: ordered condition lists with a single action
use serde::{Deserialize, Serialize};

use crate::utils::generate_id;

/// What part of the request a condition inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
    Header,
    Path,
    Query,
    Geo,
    Percentage,
    Time,
}

/// Comparison applied to the inspected value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyOperator {
    Equals,
    Contains,
    Regex,
    In,
    NotIn,
    Gt,
    Lt,
    Between,
}

/// One condition inside a policy; all conditions must match (AND)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyCondition {
    pub condition_type: ConditionType,
    /// Header or query parameter name; unused for the other types
    pub key: Option<String>,
    pub operator: PolicyOperator,
    /// Operand; lists are comma-separated, BETWEEN takes "low,high"
    pub value: String,
}

impl PolicyCondition {
    pub fn new(condition_type: ConditionType, operator: PolicyOperator, value: &str) -> Self {
        Self {
            condition_type,
            key: None,
            operator,
            value: value.to_string(),
        }
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = Some(key.to_string());
        self
    }
}

/// What a matching policy does with the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyAction {
    /// Dispatch against a different cluster
    RouteToCluster { cluster_id: String },
    /// Redirect the client elsewhere without touching any backend
    Redirect { location: String },
    /// Refuse the request with the given status
    Reject { status: u16 },
}

/// A prioritized routing rule; lower priority value wins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub id: String,
    pub org_id: String,
    pub name: String,
    pub priority: i32,
    pub conditions: Vec<PolicyCondition>,
    pub action: PolicyAction,
    pub is_active: bool,
}

impl RoutingPolicy {
    pub fn new(org_id: &str, name: &str, priority: i32, action: PolicyAction) -> Result<Self, String> {
        if name.is_empty() {
            return Err("Policy name cannot be empty".to_string());
        }

        Ok(Self {
            id: generate_id("pol"),
            org_id: org_id.to_string(),
            name: name.to_string(),
            priority,
            conditions: Vec::new(),
            action,
            is_active: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_creation() {
        let policy = RoutingPolicy::new(
            "org-1",
            "canary",
            10,
            PolicyAction::RouteToCluster {
                cluster_id: "cl-canary".to_string(),
            },
        )
        .unwrap();
        assert_eq!(policy.priority, 10);
        assert!(policy.conditions.is_empty());
        assert!(RoutingPolicy::new("org-1", "", 0, PolicyAction::Reject { status: 403 }).is_err());
    }

    #[test]
    fn test_condition_builder() {
        let cond = PolicyCondition::new(ConditionType::Header, PolicyOperator::Equals, "beta")
            .with_key("x-user-tier");
        assert_eq!(cond.key.as_deref(), Some("x-user-tier"));
        assert_eq!(cond.operator, PolicyOperator::Equals);
    }

    #[test]
    fn test_action_wire_format() {
        let action = PolicyAction::RouteToCluster {
            cluster_id: "cl-1".to_string(),
        };
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"ROUTE_TO_CLUSTER\""));

        let parsed: PolicyAction =
            serde_json::from_str("{\"type\":\"REJECT\",\"status\":451}").unwrap();
        assert_eq!(parsed, PolicyAction::Reject { status: 451 });
    }

    #[test]
    fn test_operator_wire_names() {
        let json = serde_json::to_string(&PolicyOperator::NotIn).unwrap();
        assert_eq!(json, "\"NOT_IN\"");
    }
}
