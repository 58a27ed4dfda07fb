//! Dependency resolution and definition validation
//!
//! A dependency name resolves, in order of precedence, to a step, to every
//! member of a group, or to every step attached to a graft. Entries that
//! resolve to no steps (an empty group, a graft nothing attached to) are
//! satisfied immediately.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use cadence_domain::{WorkflowDef, WorkflowRun};

use super::error::{WorkflowError, WorkflowResult};

/// Resolved dependencies of one step; each entry lists the steps it stands for
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepDeps {
    pub all: Vec<Vec<String>>,
    pub any: Vec<Vec<String>>,
}

impl StepDeps {
    /// Whether the step may start given the run's current step states
    pub fn is_satisfied(&self, run: &WorkflowRun) -> bool {
        let entry_done = |members: &Vec<String>| {
            members
                .iter()
                .all(|m| run.step_status(m).is_some_and(|status| status.satisfies_dependents()))
        };
        self.all.iter().all(entry_done) && (self.any.is_empty() || self.any.iter().any(entry_done))
    }
}

/// Steps a dependency name stands for, or `None` if it names nothing
pub fn resolve<'a>(def: &'a WorkflowDef, name: &str) -> Option<Vec<&'a str>> {
    if let Some(step) = def.steps.iter().find(|s| s.name == name) {
        return Some(vec![step.name.as_str()]);
    }
    if let Some(members) = def.groups.get(name) {
        return Some(members.iter().map(String::as_str).collect());
    }
    def.grafts.get(name).map(|members| members.iter().map(String::as_str).collect())
}

/// Resolved dependencies for every step; unknown names resolve to nothing
pub fn dependency_map(def: &WorkflowDef) -> HashMap<String, StepDeps> {
    let resolve_all = |names: &[String]| -> Vec<Vec<String>> {
        names
            .iter()
            .map(|name| {
                resolve(def, name)
                    .unwrap_or_default()
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            })
            .collect()
    };

    def.steps
        .iter()
        .map(|step| {
            let deps = StepDeps {
                all: resolve_all(&step.depends_on),
                any: resolve_all(&step.depends_on_any),
            };
            (step.name.clone(), deps)
        })
        .collect()
}

/// Validate a definition and return its steps in a topological order
///
/// Ties are broken by declaration order, so the result is deterministic.
pub fn validate(def: &WorkflowDef) -> WorkflowResult<Vec<String>> {
    let invalid =
        |message: String| WorkflowError::InvalidDefinition { workflow: def.name.clone(), message };

    if def.steps.is_empty() {
        return Err(WorkflowError::EmptyWorkflow(def.name.clone()));
    }

    let mut index = HashMap::with_capacity(def.steps.len());
    for (i, step) in def.steps.iter().enumerate() {
        if index.insert(step.name.as_str(), i).is_some() {
            return Err(WorkflowError::DuplicateStep {
                workflow: def.name.clone(),
                step: step.name.clone(),
            });
        }
    }

    for (kind, joins) in [("group", &def.groups), ("graft", &def.grafts)] {
        for (name, members) in joins {
            if index.contains_key(name.as_str()) {
                return Err(invalid(format!("{kind} '{name}' has the same name as a step")));
            }
            if let Some(member) = members.iter().find(|m| !index.contains_key(m.as_str())) {
                return Err(invalid(format!("{kind} '{name}' references unknown step '{member}'")));
            }
        }
    }
    if let Some(name) = def.groups.keys().find(|name| def.grafts.contains_key(*name)) {
        return Err(invalid(format!("'{name}' is both a group and a graft")));
    }

    let ensure: HashSet<&str> =
        def.steps.iter().filter(|s| s.ensure).map(|s| s.name.as_str()).collect();

    let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); def.steps.len()];
    for (i, step) in def.steps.iter().enumerate() {
        for dep in step.depends_on.iter().chain(step.depends_on_any.iter()) {
            let members = resolve(def, dep).ok_or_else(|| WorkflowError::MissingDependency {
                workflow: def.name.clone(),
                step: step.name.clone(),
                dependency: dep.clone(),
            })?;
            for member in members {
                if !step.ensure && ensure.contains(member) {
                    return Err(invalid(format!(
                        "step '{}' depends on ensure step '{member}'",
                        step.name
                    )));
                }
                if let Some(&from) = index.get(member) {
                    edges[i].insert(from);
                }
            }
        }
    }

    // Kahn's algorithm over dependency -> dependent edges
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); def.steps.len()];
    let mut in_degree: Vec<usize> = vec![0; def.steps.len()];
    for (to, froms) in edges.iter().enumerate() {
        in_degree[to] = froms.len();
        for &from in froms {
            dependents[from].push(to);
        }
    }

    let mut queue: VecDeque<usize> = (0..def.steps.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(def.steps.len());
    while let Some(i) = queue.pop_front() {
        order.push(def.steps[i].name.clone());
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != def.steps.len() {
        let mut steps: Vec<String> = def
            .steps
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, s)| s.name.clone())
            .collect();
        steps.sort();
        return Err(WorkflowError::CycleDetected { workflow: def.name.clone(), steps });
    }

    Ok(order)
}
