//! Topological ordering of the exclusive modules of a test case
//!
//! Only local edges count: shared modules sit outside the test case and
//! never appear in the order.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use tracing::debug;

use crate::closure::{ClosureTable, EdgeKind};
use crate::graph::GraphError;
use crate::model::{ModuleRef, TestModule};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Order modules so that every module precedes the modules it depends on.
///
/// The first module of the result is the root: the module no other local
/// module depends on or befriends. When several candidates exist the
/// alphabetically first is chosen and every other module must be reachable
/// from it.
pub fn sort_topologically(
    test_case: &str,
    modules: &BTreeMap<String, Arc<TestModule>>,
    closures: &ClosureTable,
) -> Result<Vec<String>, GraphError> {
    let mut incoming: BTreeSet<&str> = BTreeSet::new();
    for module in modules.values() {
        for edge in module.edges(EdgeKind::All) {
            if let ModuleRef::Local(name) = edge {
                incoming.insert(name.as_str());
            }
        }
    }

    let roots: Vec<&str> = modules
        .keys()
        .map(String::as_str)
        .filter(|name| !incoming.contains(name))
        .collect();

    let Some(&root) = roots.first() else {
        // Every module has a predecessor, so the graph must contain a cycle.
        let first = modules
            .keys()
            .next()
            .ok_or_else(|| GraphError::EmptyTestCase(test_case.to_string()))?;
        closures.closure(modules, first, EdgeKind::All)?;
        return Err(GraphError::DependencyCycle {
            test_case: test_case.to_string(),
            cycle: vec![first.clone(), first.clone()],
        });
    };

    let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
    let mut postorder: Vec<String> = Vec::with_capacity(modules.len());
    let mut path: Vec<String> = Vec::new();
    for &start in &roots {
        visit(test_case, modules, start, &mut marks, &mut path, &mut postorder)?;
    }
    // Modules only reachable through a cycle are never started from a root.
    for name in modules.keys() {
        visit(test_case, modules, name, &mut marks, &mut path, &mut postorder)?;
    }

    let reachable: HashSet<String> = closures
        .closure(modules, root, EdgeKind::All)?
        .iter()
        .filter(|m| !m.is_shared())
        .map(|m| m.name().to_string())
        .collect();
    let orphans: Vec<String> = modules
        .keys()
        .filter(|name| name.as_str() != root && !reachable.contains(name.as_str()))
        .cloned()
        .collect();
    if !orphans.is_empty() {
        return Err(GraphError::OrphanedModules {
            test_case: test_case.to_string(),
            root: root.to_string(),
            orphans,
        });
    }

    postorder.reverse();
    // With a single reachable root the reversed post-order already starts with it.
    debug_assert_eq!(postorder.first().map(String::as_str), Some(root));
    debug!(test_case, root, order = ?postorder, "modules sorted");
    Ok(postorder)
}

fn visit<'a>(
    test_case: &str,
    modules: &'a BTreeMap<String, Arc<TestModule>>,
    name: &'a str,
    marks: &mut BTreeMap<&'a str, Mark>,
    path: &mut Vec<String>,
    postorder: &mut Vec<String>,
) -> Result<(), GraphError> {
    match marks.get(name) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = path.iter().position(|m| m == name).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(name.to_string());
            return Err(GraphError::DependencyCycle {
                test_case: test_case.to_string(),
                cycle,
            });
        }
        None => {}
    }

    let Some((key, module)) = modules.get_key_value(name) else {
        return Err(GraphError::UnresolvedReference {
            test_case: test_case.to_string(),
            module: path.last().cloned().unwrap_or_default(),
            kind: "module".to_string(),
            name: name.to_string(),
        });
    };

    marks.insert(key.as_str(), Mark::Visiting);
    path.push(key.clone());
    for edge in module.edges(EdgeKind::All) {
        if let ModuleRef::Local(next) = edge {
            visit(test_case, modules, next.as_str(), marks, path, postorder)?;
        }
    }
    path.pop();
    marks.insert(key.as_str(), Mark::Done);
    postorder.push(key.clone());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExclusiveModule, PackageName};

    fn graph(edges: &[(&str, &[&str], &[&str])]) -> BTreeMap<String, Arc<TestModule>> {
        let mut modules = BTreeMap::new();
        for (name, deps, friends) in edges {
            let module = ExclusiveModule::new(
                name.to_string(),
                Vec::new(),
                "case".to_string(),
                PackageName::default(),
                deps.iter().map(|d| d.to_string()).collect(),
                friends.iter().map(|f| f.to_string()).collect(),
            );
            module
                .bind(
                    deps.iter().map(|d| ModuleRef::Local(d.to_string())).collect(),
                    friends.iter().map(|f| ModuleRef::Local(f.to_string())).collect(),
                )
                .unwrap();
            modules.insert(name.to_string(), Arc::new(TestModule::Exclusive(module)));
        }
        modules
    }

    fn sort(modules: &BTreeMap<String, Arc<TestModule>>) -> Result<Vec<String>, GraphError> {
        sort_topologically("case", modules, &ClosureTable::new("case"))
    }

    #[test]
    fn test_diamond_order() {
        let modules = graph(&[
            ("main", &["left", "right"], &[]),
            ("left", &["base"], &[]),
            ("right", &["base"], &[]),
            ("base", &[], &[]),
        ]);
        let order = sort(&modules).unwrap();
        assert_eq!(order[0], "main");
        assert_eq!(order.last().unwrap(), "base");
        let pos = |n: &str| order.iter().position(|m| m == n).unwrap();
        assert!(pos("left") < pos("base"));
        assert!(pos("right") < pos("base"));
    }

    #[test]
    fn test_friend_edges_count() {
        let modules = graph(&[("test", &[], &["lib"]), ("lib", &[], &[])]);
        assert_eq!(sort(&modules).unwrap(), vec!["test", "lib"]);
    }

    #[test]
    fn test_single_module() {
        let modules = graph(&[("main", &[], &[])]);
        assert_eq!(sort(&modules).unwrap(), vec!["main"]);
    }

    #[test]
    fn test_cycle_without_root() {
        let modules = graph(&[("a", &["b"], &[]), ("b", &["a"], &[])]);
        let err = sort(&modules).unwrap_err();
        assert!(matches!(err, GraphError::DependencyCycle { .. }));
    }

    #[test]
    fn test_cycle_below_root() {
        let modules = graph(&[
            ("main", &["a"], &[]),
            ("a", &["b"], &[]),
            ("b", &["a"], &[]),
        ]);
        match sort(&modules).unwrap_err() {
            GraphError::DependencyCycle { cycle, .. } => {
                assert_eq!(cycle, vec!["a", "b", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_orphaned_module() {
        let modules = graph(&[("main", &["lib"], &[]), ("lib", &[], &[]), ("stray", &[], &[])]);
        match sort(&modules).unwrap_err() {
            GraphError::OrphanedModules { root, orphans, .. } => {
                assert_eq!(root, "main");
                assert_eq!(orphans, vec!["stray".to_string()]);
            }
            other => panic!("expected orphans, got {other:?}"),
        }
    }
}
