use crate::graph::{GraphState, Node};
use crate::kv::{BaseValueStatus, ValueState, ValueStatus};

/// Status of `key` bundled with the statuses of its derived values.
pub(crate) fn value_status(graph: &GraphState, key: &str) -> BaseValueStatus {
    let Some(node) = graph.node(key) else {
        return BaseValueStatus {
            value: ValueStatus::nonexistent(key),
            derived_values: Vec::new(),
        };
    };
    let value = node_status(graph, node, key);
    if value.state == ValueState::Nonexistent || node.is_derived() {
        return BaseValueStatus {
            value,
            derived_values: Vec::new(),
        };
    }
    let derived_values = graph
        .derived_nodes(key)
        .into_iter()
        .map(|derived| node_status(graph, derived, derived.key()))
        .collect();
    BaseValueStatus {
        value,
        derived_values,
    }
}

fn node_status(graph: &GraphState, node: &Node, key: &str) -> ValueStatus {
    let state = node.state();
    if state == ValueState::Nonexistent {
        return ValueStatus::nonexistent(key);
    }
    ValueStatus {
        key: key.to_string(),
        state,
        error: node.error_string(),
        last_operation: node.last_operation(),
        details: value_details(graph, node),
    }
}

/// Invalid fields for INVALID values, labels of unsatisfied dependencies
/// for PENDING values.
pub(crate) fn value_details(graph: &GraphState, node: &Node) -> Vec<String> {
    match node.state() {
        ValueState::Invalid => node
            .error()
            .map(|e| e.error.invalid_fields().to_vec())
            .unwrap_or_default(),
        ValueState::Pending => graph.unsatisfied_dependencies(node.key()),
        _ => Vec::new(),
    }
}

/// Order-insensitive comparison of status details.
pub(crate) fn equal_details(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().all(|d| b.contains(d))
}
