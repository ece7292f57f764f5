//! Memoized transitive closures over module edges
//!
//! Closures are computed lazily on first access and cached for the life of
//! the table. Each key carries an in-progress marker while it is being
//! computed; running into a marker again means the walk came back to a
//! module it has not finished, which is reported as a dependency cycle
//! instead of recursing forever.
//!
//! A whole closure request runs under the table lock, so concurrent first
//! accesses wait for the computing thread and then read its result.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::graph::GraphError;
use crate::model::{ModuleRef, TestModule};

/// Ordered set of modules reachable from some module
pub type ModuleSet = Arc<Vec<Arc<TestModule>>>;

/// Which edges a closure follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Dependencies,
    Friends,
    /// Dependencies and friends together
    All,
}

#[derive(Debug)]
enum Slot {
    InProgress,
    Ready(ModuleSet),
    Failed(GraphError),
}

/// Memoization table for the transitive closures of one test case
#[derive(Debug)]
pub struct ClosureTable {
    test_case: String,
    slots: Mutex<HashMap<(String, EdgeKind), Slot>>,
}

impl ClosureTable {
    pub fn new(test_case: impl Into<String>) -> Self {
        Self {
            test_case: test_case.into(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Modules transitively reachable from `module` over `kind` edges.
    ///
    /// The result excludes `module` itself and lists each module once, in
    /// depth-first pre-order.
    pub fn closure(
        &self,
        modules: &BTreeMap<String, Arc<TestModule>>,
        module: &str,
        kind: EdgeKind,
    ) -> Result<ModuleSet, GraphError> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut path = Vec::new();
        self.compute(&mut slots, modules, module, kind, &mut path)
    }

    /// Number of memoized entries, including failed ones
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn compute(
        &self,
        slots: &mut HashMap<(String, EdgeKind), Slot>,
        modules: &BTreeMap<String, Arc<TestModule>>,
        module: &str,
        kind: EdgeKind,
        path: &mut Vec<String>,
    ) -> Result<ModuleSet, GraphError> {
        let key = (module.to_string(), kind);
        match slots.get(&key) {
            Some(Slot::Ready(set)) => return Ok(set.clone()),
            Some(Slot::Failed(err)) => return Err(err.clone()),
            Some(Slot::InProgress) => {
                let start = path.iter().position(|m| m == module).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].to_vec();
                cycle.push(module.to_string());
                return Err(GraphError::DependencyCycle {
                    test_case: self.test_case.clone(),
                    cycle,
                });
            }
            None => {}
        }

        slots.insert(key.clone(), Slot::InProgress);
        path.push(module.to_string());
        let result = self.walk(slots, modules, module, kind, path);
        path.pop();

        trace!(module, ?kind, ok = result.is_ok(), "closure computed");
        let slot = match &result {
            Ok(set) => Slot::Ready(set.clone()),
            Err(err) => Slot::Failed(err.clone()),
        };
        slots.insert(key, slot);
        result
    }

    fn walk(
        &self,
        slots: &mut HashMap<(String, EdgeKind), Slot>,
        modules: &BTreeMap<String, Arc<TestModule>>,
        module: &str,
        kind: EdgeKind,
        path: &mut Vec<String>,
    ) -> Result<ModuleSet, GraphError> {
        let current = modules
            .get(module)
            .ok_or_else(|| GraphError::UnresolvedReference {
                test_case: self.test_case.clone(),
                module: path.first().cloned().unwrap_or_else(|| module.to_string()),
                kind: "module".to_string(),
                name: module.to_string(),
            })?;

        let mut seen: HashSet<String> = HashSet::new();
        let mut result: Vec<Arc<TestModule>> = Vec::new();
        let mut push = |m: &Arc<TestModule>, seen: &mut HashSet<String>| {
            if seen.insert(m.key().to_string()) {
                result.push(m.clone());
            }
        };

        for edge in current.edges(kind) {
            match edge {
                ModuleRef::Shared(shared) => push(shared, &mut seen),
                ModuleRef::Local(name) => {
                    let target = modules.get(name).ok_or_else(|| {
                        GraphError::UnresolvedReference {
                            test_case: self.test_case.clone(),
                            module: module.to_string(),
                            kind: "module".to_string(),
                            name: name.clone(),
                        }
                    })?;
                    push(target, &mut seen);
                    let nested = self.compute(slots, modules, name, kind, path)?;
                    for m in nested.iter() {
                        push(m, &mut seen);
                    }
                }
            }
        }

        Ok(Arc::new(result))
    }
}
