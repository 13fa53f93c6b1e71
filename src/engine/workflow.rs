use std::collections::{HashMap, HashSet};

use crate::engine::error::ConfigError;
use crate::engine::task::TaskSpec;

/// A validated collection of tasks forming a DAG.
///
/// Construction checks name uniqueness, dependency resolvability, option
/// ranges, and acyclicity. A `Workflow` that exists is runnable.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    tasks: Vec<TaskSpec>,
}

impl Workflow {
    pub fn new(name: &str, tasks: Vec<TaskSpec>) -> Result<Self, ConfigError> {
        let wf = Self {
            name: name.to_string(),
            tasks,
        };
        wf.validate()?;
        Ok(wf)
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Unresolved upstream count per task.
    pub fn indegrees(&self) -> HashMap<String, usize> {
        self.tasks
            .iter()
            .map(|t| (t.name.clone(), t.deps.len()))
            .collect()
    }

    /// Reverse adjacency: upstream name → downstream names.
    pub fn dependents(&self) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for spec in &self.tasks {
            map.entry(spec.name.clone()).or_default();
            for dep in &spec.deps {
                map.entry(dep.clone()).or_default().push(spec.name.clone());
            }
        }
        map
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for spec in &self.tasks {
            if !seen.insert(spec.name.clone()) {
                return Err(ConfigError::DuplicateTask(spec.name.clone()));
            }
            if !spec.backoff_s.is_finite() || spec.backoff_s < 0.0 {
                return Err(ConfigError::InvalidOption {
                    task: spec.name.clone(),
                    message: format!("backoff_s must be non-negative, got {}", spec.backoff_s),
                });
            }
            if let Some(t) = spec.timeout_s
                && (!t.is_finite() || t <= 0.0)
            {
                return Err(ConfigError::InvalidOption {
                    task: spec.name.clone(),
                    message: format!("timeout_s must be positive, got {}", t),
                });
            }
        }

        for spec in &self.tasks {
            for dep in &spec.deps {
                if !seen.contains(dep) {
                    return Err(ConfigError::UnknownDependency {
                        task: spec.name.clone(),
                        dep: dep.clone(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    /// Kahn's algorithm: repeatedly remove indegree-zero nodes; anything left
    /// with unmet indegree sits on a cycle.
    fn check_acyclic(&self) -> Result<(), ConfigError> {
        let mut in_degree = self.indegrees();
        let dependents = self.dependents();

        let mut ready: Vec<String> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(name, _)| name.clone())
            .collect();
        let mut resolved = 0usize;

        while let Some(name) = ready.pop() {
            resolved += 1;
            if let Some(downs) = dependents.get(&name) {
                for down in downs {
                    if let Some(deg) = in_degree.get_mut(down) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.push(down.clone());
                        }
                    }
                }
            }
        }

        if resolved != self.tasks.len() {
            let mut involved: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(name, _)| name)
                .collect();
            involved.sort();
            return Err(ConfigError::Cycle { involved });
        }

        Ok(())
    }

    /// Plain-text rendering of the DAG, one task per line.
    pub fn describe(&self) -> String {
        let mut lines = vec![format!("Workflow: {}", self.name)];
        for spec in &self.tasks {
            if spec.deps.is_empty() {
                lines.push(format!("- {}", spec.name));
            } else {
                let mut deps: Vec<&str> = spec.deps.iter().map(String::as_str).collect();
                deps.sort();
                lines.push(format!("- {} (depends on: {})", spec.name, deps.join(", ")));
            }
        }
        lines.join("\n")
    }
}
