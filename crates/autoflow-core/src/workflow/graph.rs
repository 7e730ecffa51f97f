//! Structural validation of workflow step graphs.
//!
//! Models every edge a traversal can follow (`next_steps`, `parallel_steps`
//! and the branch lists of conditional-logic steps) as a `petgraph` digraph.
//! Registration rejects duplicate ids, dangling references and cycles;
//! steps unreachable from `start_step` are reported but allowed.

use std::collections::{HashMap, HashSet};

use autoflow_types::workflow::{
    MAX_DURATION_SECS, MAX_EXPONENTIAL_BASE, StepType, WorkflowDefinition, WorkflowStep,
};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde_json::Value;

use super::definition::WorkflowError;

/// Parameter keys holding the branch targets of a conditional-logic step.
pub const TRUE_STEPS_PARAM: &str = "true_steps";
pub const FALSE_STEPS_PARAM: &str = "false_steps";

/// Outcome of a successful validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphReport {
    /// Steps no traversal from `start_step` can reach, in authoring order.
    pub unreachable: Vec<String>,
}

/// Read a list of step ids from a parameter. Accepts an array of strings or
/// a single string.
pub fn step_list_param(parameters: &HashMap<String, Value>, key: &str) -> Vec<String> {
    match parameters.get(key) {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => Vec::new(),
    }
}

/// Every step id this step can hand control to.
pub fn outgoing_edges(step: &WorkflowStep) -> Vec<String> {
    let mut edges: Vec<String> = step
        .parallel_steps
        .iter()
        .chain(step.next_steps.iter())
        .cloned()
        .collect();
    if step.step_type == StepType::ConditionalLogic {
        edges.extend(step_list_param(&step.parameters, TRUE_STEPS_PARAM));
        edges.extend(step_list_param(&step.parameters, FALSE_STEPS_PARAM));
    }
    edges
}

/// Validate a definition for registration.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<GraphReport, WorkflowError> {
    if def.id.trim().is_empty() {
        return Err(WorkflowError::Validation(
            "workflow id must not be empty".to_string(),
        ));
    }
    if def.steps.is_empty() {
        return Err(WorkflowError::Validation(format!(
            "workflow '{}' must have at least one step",
            def.id
        )));
    }

    let mut seen = HashSet::new();
    for step in &def.steps {
        if step.step_id.trim().is_empty() {
            return Err(WorkflowError::Validation(
                "step id must not be empty".to_string(),
            ));
        }
        if !seen.insert(step.step_id.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "duplicate step id '{}'",
                step.step_id
            )));
        }
        if !(0.0..=1.0).contains(&step.confidence_threshold) {
            return Err(WorkflowError::Validation(format!(
                "step '{}' confidence_threshold must be within [0, 1]",
                step.step_id
            )));
        }
        check_timing(step)?;
    }

    if !seen.contains(def.start_step.as_str()) {
        return Err(WorkflowError::Validation(format!(
            "start_step '{}' is not a step of workflow '{}'",
            def.start_step, def.id
        )));
    }

    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: HashMap<&str, NodeIndex> = def
        .steps
        .iter()
        .map(|s| (s.step_id.as_str(), graph.add_node(s.step_id.as_str())))
        .collect();

    for step in &def.steps {
        let from = nodes[step.step_id.as_str()];
        for target in outgoing_edges(step) {
            let to = nodes.get(target.as_str()).ok_or_else(|| WorkflowError::UnknownStep {
                step: step.step_id.clone(),
                reference: target.clone(),
            })?;
            graph.update_edge(from, *to, ());
        }
    }

    toposort(&graph, None)
        .map_err(|cycle| WorkflowError::CycleDetected(graph[cycle.node_id()].to_string()))?;

    let mut reachable = HashSet::new();
    let mut bfs = Bfs::new(&graph, nodes[def.start_step.as_str()]);
    while let Some(node) = bfs.next(&graph) {
        reachable.insert(graph[node]);
    }

    let unreachable = def
        .steps
        .iter()
        .filter(|s| !reachable.contains(s.step_id.as_str()))
        .map(|s| s.step_id.clone())
        .collect();

    Ok(GraphReport { unreachable })
}

/// Reject timeouts and backoff settings that cannot become a sane `Duration`.
fn check_timing(step: &WorkflowStep) -> Result<(), WorkflowError> {
    let invalid = |field: &str, range: &str| -> Result<(), WorkflowError> {
        Err(WorkflowError::Validation(format!(
            "step '{}' {field} must be a finite number in {range}",
            step.step_id
        )))
    };
    let max = MAX_DURATION_SECS;
    let in_bounds = |v: f64| v.is_finite() && v >= 0.0 && v <= max;

    if let Some(timeout) = step.timeout_secs {
        if !in_bounds(timeout) || timeout == 0.0 {
            return invalid("timeout_secs", &format!("(0, {max}]"));
        }
    }
    let policy = &step.retry_policy;
    if !in_bounds(policy.initial_delay_secs) {
        return invalid("retry_policy.initial_delay_secs", &format!("[0, {max}]"));
    }
    if !in_bounds(policy.max_delay_secs) {
        return invalid("retry_policy.max_delay_secs", &format!("[0, {max}]"));
    }
    let base = policy.exponential_base;
    if !(base.is_finite() && base > 0.0 && base <= MAX_EXPONENTIAL_BASE) {
        return invalid(
            "retry_policy.exponential_base",
            &format!("(0, {MAX_EXPONENTIAL_BASE}]"),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(id: &str, next: &[&str]) -> WorkflowStep {
        let mut s = WorkflowStep::new(id, StepType::Slack);
        s.next_steps = next.iter().map(|n| n.to_string()).collect();
        s
    }

    fn workflow(start: &str, steps: Vec<WorkflowStep>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            name: "wf".to_string(),
            description: None,
            version: "1.0.0".to_string(),
            start_step: start.to_string(),
            steps,
            triggers: vec![],
        }
    }

    #[test]
    fn valid_chain_has_no_unreachable_steps() {
        let def = workflow("a", vec![step("a", &["b"]), step("b", &[])]);
        assert_eq!(validate_definition(&def).unwrap(), GraphReport::default());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let def = workflow("a", vec![step("a", &[]), step("a", &[])]);
        assert!(matches!(
            validate_definition(&def),
            Err(WorkflowError::Validation(msg)) if msg.contains("duplicate")
        ));
    }

    #[test]
    fn missing_start_step_rejected() {
        let def = workflow("zzz", vec![step("a", &[])]);
        assert!(matches!(
            validate_definition(&def),
            Err(WorkflowError::Validation(_))
        ));
    }

    #[test]
    fn dangling_parallel_reference_rejected() {
        let mut fan = step("fan", &[]);
        fan.parallel_steps = vec!["a".into(), "ghost".into()];
        let def = workflow("fan", vec![fan, step("a", &[])]);
        match validate_definition(&def) {
            Err(WorkflowError::UnknownStep { step, reference }) => {
                assert_eq!(step, "fan");
                assert_eq!(reference, "ghost");
            }
            other => panic!("expected UnknownStep, got {other:?}"),
        }
    }

    #[test]
    fn conditional_branch_targets_are_checked() {
        let mut cond = WorkflowStep::new("check", StepType::ConditionalLogic);
        cond.parameters
            .insert(TRUE_STEPS_PARAM.into(), json!(["approve"]));
        cond.parameters.insert(FALSE_STEPS_PARAM.into(), json!("missing"));
        let def = workflow("check", vec![cond, step("approve", &[])]);
        assert!(matches!(
            validate_definition(&def),
            Err(WorkflowError::UnknownStep { reference, .. }) if reference == "missing"
        ));
    }

    #[test]
    fn cycles_rejected() {
        let def = workflow("a", vec![step("a", &["b"]), step("b", &["c"]), step("c", &["a"])]);
        assert!(matches!(
            validate_definition(&def),
            Err(WorkflowError::CycleDetected(_))
        ));

        let self_loop = workflow("a", vec![step("a", &["a"])]);
        assert!(matches!(
            validate_definition(&self_loop),
            Err(WorkflowError::CycleDetected(id)) if id == "a"
        ));
    }

    #[test]
    fn timeouts_outside_bounds_rejected() {
        for bad in [1e20, -1.0, 0.0, f64::NAN, f64::INFINITY] {
            let mut s = step("a", &[]);
            s.timeout_secs = Some(bad);
            assert!(
                matches!(
                    validate_definition(&workflow("a", vec![s])),
                    Err(WorkflowError::Validation(msg)) if msg.contains("timeout_secs")
                ),
                "timeout_secs = {bad} should be rejected"
            );
        }

        let mut ok = step("a", &[]);
        ok.timeout_secs = Some(MAX_DURATION_SECS);
        assert!(validate_definition(&workflow("a", vec![ok])).is_ok());
    }

    #[test]
    fn retry_backoff_outside_bounds_rejected() {
        let cases: [(&str, fn(&mut WorkflowStep)); 6] = [
            ("initial_delay_secs", |s| s.retry_policy.initial_delay_secs = 1e20),
            ("initial_delay_secs", |s| s.retry_policy.initial_delay_secs = -0.5),
            ("max_delay_secs", |s| s.retry_policy.max_delay_secs = 1e20),
            ("max_delay_secs", |s| s.retry_policy.max_delay_secs = f64::NAN),
            ("exponential_base", |s| s.retry_policy.exponential_base = f64::INFINITY),
            ("exponential_base", |s| s.retry_policy.exponential_base = -2.0),
        ];
        for (field, mutate) in cases {
            let mut s = step("a", &[]);
            mutate(&mut s);
            assert!(
                matches!(
                    validate_definition(&workflow("a", vec![s])),
                    Err(WorkflowError::Validation(msg)) if msg.contains(field)
                ),
                "expected {field} to be rejected"
            );
        }
    }

    #[test]
    fn unreachable_steps_reported() {
        let def = workflow("a", vec![step("a", &[]), step("orphan", &[])]);
        let report = validate_definition(&def).unwrap();
        assert_eq!(report.unreachable, vec!["orphan"]);
    }

    #[test]
    fn confidence_threshold_out_of_range_rejected() {
        let mut s = step("a", &[]);
        s.confidence_threshold = 1.5;
        assert!(validate_definition(&workflow("a", vec![s])).is_err());
    }

    #[test]
    fn step_list_param_accepts_string_or_array() {
        let mut params = HashMap::new();
        params.insert("one".to_string(), json!("x"));
        params.insert("many".to_string(), json!(["y", "z", 3]));
        assert_eq!(step_list_param(&params, "one"), vec!["x"]);
        assert_eq!(step_list_param(&params, "many"), vec!["y", "z"]);
        assert!(step_list_param(&params, "none").is_empty());
    }
}
