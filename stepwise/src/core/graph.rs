//! Dependency graph: scopes, effective edges, topological order.
//!
//! Every step lives in a scope: the top level, or the body of exactly one Loop.
//! Dependencies are rewritten into scope-local edges:
//!
//! - branch steps of a Decision depend on the Decision;
//! - a Decision depends on every step its condition inspects;
//! - a dependency on a step nested in a loop body becomes a dependency on the
//!   outermost loop that shares the dependent's scope;
//! - a body step's dependency on a step outside the body is carried by the Loop.
//!
//! Cycle detection runs over the scope-local edges plus loop-to-body containment.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::PlanError;
use crate::plan::{PlanStep, StepAction, TaskPlan};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionGraph {
    order: Vec<String>,
    scope_of: BTreeMap<String, Option<String>>,
    deps: BTreeMap<String, BTreeSet<String>>,
}

impl ExecutionGraph {
    pub fn build(plan: &TaskPlan) -> Result<Self, PlanError> {
        for step in plan.steps.values() {
            if let Some(missing) = step
                .depends_on
                .iter()
                .map(String::as_str)
                .chain(inspected_steps(step))
                .find(|dep| !plan.steps.contains_key(*dep))
            {
                return Err(PlanError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: missing.to_string(),
                });
            }
            if step.depends_on.contains(&step.id)
                || inspected_steps(step).contains(&step.id.as_str())
            {
                return Err(PlanError::Cycle {
                    cycle: vec![step.id.clone(), step.id.clone()],
                });
            }
        }

        let mut errors = Vec::new();
        let mut body_owner: BTreeMap<&str, &str> = BTreeMap::new();
        let mut branch_owner: BTreeMap<&str, &str> = BTreeMap::new();
        for step in plan.steps.values() {
            let (members, owners, role): (Vec<&String>, _, _) = match &step.action {
                StepAction::Loop(params) => {
                    (params.body.iter().collect(), &mut body_owner, "loop body")
                }
                StepAction::Decision(params) => (
                    params.if_true.iter().chain(&params.if_false).collect(),
                    &mut branch_owner,
                    "decision branches",
                ),
                _ => continue,
            };
            let mut seen = BTreeSet::new();
            for member in members {
                if !seen.insert(member.as_str()) {
                    errors.push(format!(
                        "step '{member}' is listed twice in the {role} of '{}'",
                        step.id
                    ));
                } else if member == &step.id {
                    errors.push(format!("step '{}' lists itself in its {role}", step.id));
                } else if !plan.steps.contains_key(member) {
                    errors.push(format!(
                        "step '{}' {role} references unknown step '{member}'",
                        step.id
                    ));
                } else if let Some(previous) = owners.insert(member.as_str(), step.id.as_str()) {
                    errors.push(format!(
                        "step '{member}' appears in the {role} of both '{previous}' and '{}'",
                        step.id
                    ));
                }
            }
        }
        if !errors.is_empty() {
            return Err(PlanError::Invalid { errors });
        }

        let scope_of: BTreeMap<&str, Option<&str>> = plan
            .steps
            .keys()
            .map(|id| (id.as_str(), body_owner.get(id.as_str()).copied()))
            .collect();
        for id in plan.steps.keys() {
            let mut chain = vec![id.as_str()];
            let mut current = id.as_str();
            while let Some(parent) = scope_of[current] {
                if chain.contains(&parent) {
                    chain.push(parent);
                    return Err(PlanError::Cycle {
                        cycle: chain.into_iter().map(str::to_string).collect(),
                    });
                }
                chain.push(parent);
                current = parent;
            }
        }
        for (member, decision) in &branch_owner {
            if scope_of[member] != scope_of[decision] {
                errors.push(format!(
                    "branch step '{member}' must share the scope of decision '{decision}'"
                ));
            }
        }

        let lift = |step: &str, target: Option<&str>| -> Option<String> {
            let mut current = step;
            loop {
                if scope_of[current] == target {
                    return Some(current.to_string());
                }
                current = scope_of[current]?;
            }
        };

        let mut deps: BTreeMap<String, BTreeSet<String>> = plan
            .steps
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for step in plan.steps.values() {
            let implicit = branch_owner
                .get(step.id.as_str())
                .copied()
                .into_iter()
                .chain(inspected_steps(step));
            for dep in step.depends_on.iter().map(String::as_str).chain(implicit) {
                let mut carrier = step.id.as_str();
                let mut level = scope_of[carrier];
                loop {
                    if let Some(anchor) = lift(dep, level) {
                        if anchor == carrier {
                            if carrier == step.id {
                                errors.push(format!(
                                    "loop '{}' cannot depend on its own body step '{dep}'",
                                    step.id
                                ));
                            }
                        } else if let Some(set) = deps.get_mut(carrier) {
                            set.insert(anchor);
                        }
                        break;
                    }
                    let Some(parent) = level else { break };
                    carrier = parent;
                    level = scope_of[parent];
                }
            }
        }
        if !errors.is_empty() {
            return Err(PlanError::Invalid { errors });
        }

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let nodes: HashMap<&str, NodeIndex> = plan
            .steps
            .keys()
            .map(|id| (id.as_str(), graph.add_node(id.as_str())))
            .collect();
        for (id, set) in &deps {
            for dep in set {
                graph.add_edge(nodes[dep.as_str()], nodes[id.as_str()], ());
            }
        }
        for (member, owner) in &body_owner {
            graph.add_edge(nodes[owner], nodes[member], ());
        }
        let order = match toposort(&graph, None) {
            Ok(order) => order
                .into_iter()
                .map(|index| graph[index].to_string())
                .collect(),
            Err(cycle) => {
                return Err(PlanError::Cycle {
                    cycle: cycle_path(&graph, cycle.node_id()),
                });
            }
        };

        Ok(Self {
            order,
            scope_of: scope_of
                .into_iter()
                .map(|(id, scope)| (id.to_string(), scope.map(str::to_string)))
                .collect(),
            deps,
        })
    }

    /// All steps, dependencies first.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Steps of one scope (`None` is the top level) in topological order.
    pub fn scope_steps(&self, scope: Option<&str>) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.scope_of(id) == scope)
            .map(String::as_str)
            .collect()
    }

    pub fn scope_of(&self, step: &str) -> Option<&str> {
        self.scope_of.get(step).and_then(|scope| scope.as_deref())
    }

    /// Scope-local effective dependencies of `step`.
    pub fn dependencies(&self, step: &str) -> impl Iterator<Item = &str> {
        self.deps
            .get(step)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Top-level steps with no effective dependencies.
    pub fn entry_points(&self) -> Vec<&str> {
        self.scope_steps(None)
            .into_iter()
            .filter(|id| self.dependencies(id).next().is_none())
            .collect()
    }
}

/// Steps whose recorded result a Decision condition reads.
fn inspected_steps(step: &PlanStep) -> Vec<&str> {
    match &step.action {
        StepAction::Decision(params) => params.condition.referenced_steps(),
        _ => Vec::new(),
    }
}

/// Walk strongly connected successors from `start` until a node repeats.
fn cycle_path(graph: &DiGraph<&str, ()>, start: NodeIndex) -> Vec<String> {
    let component: BTreeSet<NodeIndex> = tarjan_scc(graph)
        .into_iter()
        .find(|scc| scc.contains(&start))
        .unwrap_or_else(|| vec![start])
        .into_iter()
        .collect();
    let mut path = vec![start];
    let mut current = start;
    loop {
        let Some(next) = graph
            .neighbors(current)
            .filter(|n| component.contains(n))
            .min()
        else {
            break;
        };
        if let Some(pos) = path.iter().position(|n| *n == next) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|n| graph[*n].to_string()).collect();
            cycle.push(graph[next].to_string());
            return cycle;
        }
        path.push(next);
        current = next;
    }
    path.into_iter().map(|n| graph[n].to_string()).collect()
}
