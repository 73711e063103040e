//! Validated stage dependency graph and execution ordering.
//!
//! An edge `A -> B` means "B depends on A": A must be `Done` before B may
//! start. Validation runs once at construction; a `StageGraph` that exists
//! is always a DAG with resolvable edges and well-formed templates.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

use pipeline_runner::invocation::mount_env_var;
use sha2::{Digest, Sha256};

use super::error::{DefinitionError, DefinitionResult};
use super::template::{placeholders, Placeholder};
use super::{Stage, StageInput};

#[derive(Debug, Clone)]
pub struct StageGraph {
    name: Option<String>,
    base_dir: PathBuf,
    /// Declaration order
    stages: Vec<Stage>,
    index: HashMap<String, usize>,
    /// `dependency -> dependents`, in declaration order
    downstream: HashMap<String, Vec<String>>,
}

fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn valid_relative(path: &str) -> bool {
    let p = Path::new(path);
    !path.is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

impl StageGraph {
    /// Validate `stages` and build the graph.
    pub fn new(
        name: Option<String>,
        stages: Vec<Stage>,
        base_dir: PathBuf,
    ) -> DefinitionResult<Self> {
        if stages.is_empty() {
            return Err(DefinitionError::Empty);
        }

        let mut index = HashMap::with_capacity(stages.len());
        let mut mount_vars: HashMap<String, &str> = HashMap::new();
        for (i, stage) in stages.iter().enumerate() {
            if !valid_id(&stage.id) {
                return Err(DefinitionError::InvalidStageId {
                    id: stage.id.clone(),
                });
            }
            if index.insert(stage.id.clone(), i).is_some() {
                return Err(DefinitionError::DuplicateStage {
                    id: stage.id.clone(),
                });
            }
            if let Some(first) = mount_vars.insert(mount_env_var(&stage.id), &stage.id) {
                return Err(DefinitionError::MountCollision {
                    first: first.to_string(),
                    second: stage.id.clone(),
                });
            }
        }

        let mut downstream: HashMap<String, Vec<String>> = HashMap::new();
        for stage in &stages {
            validate_stage(stage, &index)?;
            for dep in &stage.depends_on {
                downstream
                    .entry(dep.clone())
                    .or_default()
                    .push(stage.id.clone());
            }
        }

        let graph = Self {
            name,
            base_dir,
            stages,
            index,
            downstream,
        };
        if let Some(path) = graph.find_cycle() {
            return Err(DefinitionError::Cycle { path });
        }
        Ok(graph)
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Directory that relative inputs and work directories resolve against.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.index.get(id).map(|&i| &self.stages[i])
    }

    /// All stages in declaration order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    fn require(&self, id: &str) -> DefinitionResult<&Stage> {
        self.stage(id).ok_or_else(|| DefinitionError::UnknownStage { id: id.to_string() })
    }

    /// Stages that list `id` directly in `depends_on`, in declaration order.
    pub fn dependents(&self, id: &str) -> DefinitionResult<Vec<&Stage>> {
        self.require(id)?;
        Ok(self
            .downstream
            .get(id)
            .map(|ids| ids.iter().filter_map(|d| self.stage(d)).collect())
            .unwrap_or_default())
    }

    /// Every stage `id` depends on, directly or not, in execution order.
    pub fn transitive_dependencies(&self, id: &str) -> DefinitionResult<Vec<&Stage>> {
        let mut order = self.resolve_order(id)?;
        order.pop();
        Ok(order)
    }

    /// `target` and its transitive dependencies in topological order.
    ///
    /// Kahn's algorithm over the target's closure; when several stages are
    /// ready at once the one declared first goes first.
    pub fn resolve_order(&self, target: &str) -> DefinitionResult<Vec<&Stage>> {
        self.require(target)?;

        let closure = self.closure(target);
        let mut in_degree: HashMap<&str, usize> = closure
            .iter()
            .map(|&i| (self.stages[i].id.as_str(), self.stages[i].depends_on.len()))
            .collect();

        let mut ready: BTreeSet<usize> = closure
            .iter()
            .copied()
            .filter(|&i| self.stages[i].depends_on.is_empty())
            .collect();

        let mut sorted = Vec::with_capacity(closure.len());
        while let Some(i) = ready.pop_first() {
            let stage = &self.stages[i];
            sorted.push(stage);
            for dependent in self.downstream.get(&stage.id).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(self.index[dependent]);
                    }
                }
            }
        }
        Ok(sorted)
    }

    /// Declaration indices of `target` and everything it depends on.
    fn closure(&self, target: &str) -> HashSet<usize> {
        let mut seen = HashSet::new();
        let mut stack = vec![self.index[target]];
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                for dep in &self.stages[i].depends_on {
                    stack.push(self.index[dep]);
                }
            }
        }
        seen
    }

    /// Depth-first search with white/grey/black colouring. Returns the
    /// cycle as a path that starts and ends on the same stage.
    fn find_cycle(&self) -> Option<Vec<String>> {
        fn visit<'a>(
            graph: &'a StageGraph,
            i: usize,
            colour: &mut [Colour],
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            colour[i] = Colour::Grey;
            path.push(&graph.stages[i].id);
            for dep in &graph.stages[i].depends_on {
                let j = graph.index[dep];
                match colour[j] {
                    Colour::Grey => {
                        let start = path.iter().position(|id| *id == dep.as_str()).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Colour::White => {
                        if let Some(cycle) = visit(graph, j, colour, path) {
                            return Some(cycle);
                        }
                    }
                    Colour::Black => {}
                }
            }
            path.pop();
            colour[i] = Colour::Black;
            None
        }

        let mut colour = vec![Colour::White; self.stages.len()];
        let mut path = Vec::new();
        for i in 0..self.stages.len() {
            if colour[i] == Colour::White {
                if let Some(cycle) = visit(self, i, &mut colour, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// SHA-256 over the canonical JSON of every stage in declaration order.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(&self.stages).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}

fn validate_stage(stage: &Stage, index: &HashMap<String, usize>) -> DefinitionResult<()> {
    if stage.command.trim().is_empty() {
        return Err(DefinitionError::EmptyCommand {
            stage: stage.id.clone(),
        });
    }

    for dep in &stage.depends_on {
        if dep == &stage.id {
            return Err(DefinitionError::SelfDependency {
                stage: stage.id.clone(),
            });
        }
        if !index.contains_key(dep) {
            return Err(DefinitionError::UnresolvedDependency {
                stage: stage.id.clone(),
                dependency: dep.clone(),
            });
        }
    }

    let found = placeholders(&stage.command).map_err(|placeholder| {
        DefinitionError::UnknownPlaceholder {
            stage: stage.id.clone(),
            placeholder,
        }
    })?;
    for placeholder in found {
        if let Placeholder::Upstream(upstream) = placeholder {
            if !stage.depends_on.contains(&upstream) {
                return Err(DefinitionError::UpstreamNotDependency {
                    stage: stage.id.clone(),
                    upstream,
                });
            }
        }
    }

    for output in &stage.outputs {
        if !valid_relative(output) {
            return Err(DefinitionError::InvalidOutput {
                stage: stage.id.clone(),
                output: output.clone(),
            });
        }
    }

    for input in stage.parsed_inputs() {
        let ok = match input {
            StageInput::Env(key) => !key.is_empty(),
            StageInput::Path(path) => !path.is_empty(),
        };
        if !ok {
            return Err(DefinitionError::InvalidInput {
                stage: stage.id.clone(),
                input: match input {
                    StageInput::Env(key) => format!("env:{key}"),
                    StageInput::Path(path) => path.to_string(),
                },
            });
        }
    }

    Ok(())
}
