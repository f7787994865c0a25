// ABOUTME: Read-only connectivity maps derived from the task table at setup
// ABOUTME: Computes link descendants for cascade-skip and the gating inputs of every scope

use petgraph::graph::NodeIndex;
use petgraph::visit::Dfs;
use petgraph::{Direction, Graph};
use std::collections::HashMap;

use super::task::TaskTable;

#[derive(Debug, Clone)]
pub struct Connectivity {
    graph: Graph<String, ()>,
    task_indices: HashMap<String, NodeIndex>,
    descendants: HashMap<String, Vec<String>>,
    scope_inputs: HashMap<String, Vec<String>>,
}

impl Connectivity {
    pub fn build(tasks: &TaskTable) -> Self {
        let mut graph = Graph::new();
        let mut task_indices = HashMap::new();

        for name in tasks.names() {
            let node = graph.add_node(name.clone());
            task_indices.insert(name, node);
        }

        for link in tasks.links() {
            if let (Some(&from), Some(&to)) = (
                task_indices.get(&link.from_task),
                task_indices.get(&link.to_task),
            ) {
                if graph.find_edge(from, to).is_none() {
                    graph.add_edge(from, to, ());
                }
            }
        }

        let mut connectivity = Self {
            graph,
            task_indices,
            descendants: HashMap::new(),
            scope_inputs: HashMap::new(),
        };

        for name in tasks.names() {
            let descendants = connectivity.walk_descendants(&name);
            connectivity.descendants.insert(name.clone(), descendants);
            let inputs = scope_inputs_of(tasks, &name);
            connectivity.scope_inputs.insert(name, inputs);
        }

        connectivity
    }

    /// Every task reachable downstream of `name` through links.
    pub fn descendants(&self, name: &str) -> &[String] {
        self.descendants.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tasks that must be terminal before `name` may start.
    pub fn scope_inputs(&self, name: &str) -> &[String] {
        self.scope_inputs.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct link sources of `name`.
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Direct link targets of `name`.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<String> {
        match self.task_indices.get(name) {
            Some(&node) => self
                .graph
                .neighbors_directed(node, direction)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }

    fn walk_descendants(&self, name: &str) -> Vec<String> {
        let Some(&start) = self.task_indices.get(name) else {
            return Vec::new();
        };

        let mut found = Vec::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                found.push(self.graph[node].clone());
            }
        }
        found
    }
}

/// Members of `name`, recursively.
fn members(tasks: &TaskTable, name: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut stack = match tasks.get(name) {
        Ok(task) => task.children.clone(),
        Err(_) => return found,
    };
    while let Some(child) = stack.pop() {
        if let Ok(task) = tasks.get(&child) {
            stack.extend(task.children.iter().cloned());
        }
        found.push(child);
    }
    found
}

/// Link sources of `name` and of its nested members that sit outside of it,
/// lifted to the ancestor that shares `name`'s enclosing scope.
fn scope_inputs_of(tasks: &TaskTable, name: &str) -> Vec<String> {
    let inside = members(tasks, name);
    let scope = tasks.get(name).ok().and_then(|t| t.parent.clone());

    let mut sources = Vec::new();
    let targets = std::iter::once(name.to_string()).chain(inside.iter().cloned());
    for target in targets {
        for link in tasks.incoming(&target, None) {
            let source = &link.from_task;
            if source == name || inside.contains(source) {
                continue;
            }
            let gate = lift_to_scope(tasks, source, scope.as_deref());
            if gate != name && !sources.contains(&gate) {
                sources.push(gate);
            }
        }
    }
    sources
}

/// Walk up from `source` until reaching a task whose parent is `scope`;
/// sources outside that scope gate directly.
fn lift_to_scope(tasks: &TaskTable, source: &str, scope: Option<&str>) -> String {
    let mut current = source.to_string();
    loop {
        let Ok(task) = tasks.get(&current) else {
            return source.to_string();
        };
        if task.parent.as_deref() == scope {
            return current;
        }
        match &task.parent {
            Some(parent) => current = parent.clone(),
            None => return source.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{GraphDefinition, TaskDefinition};

    fn chain() -> TaskTable {
        let graph = GraphDefinition::new("chain")
            .with_task("a", TaskDefinition::new("data"))
            .with_task("b", TaskDefinition::new("data").with_link("value", "a.result"))
            .with_task("c", TaskDefinition::new("data").with_link("value", "b.result"))
            .with_task("d", TaskDefinition::new("data"));
        TaskTable::from_definition(&graph).unwrap()
    }

    #[test]
    fn test_descendants() {
        let connectivity = Connectivity::build(&chain());
        let mut descendants = connectivity.descendants("a").to_vec();
        descendants.sort();
        assert_eq!(descendants, vec!["b", "c"]);
        assert!(connectivity.descendants("c").is_empty());
        assert!(connectivity.descendants("d").is_empty());
        assert_eq!(connectivity.dependencies("b"), vec!["a"]);
        assert_eq!(connectivity.dependents("b"), vec!["c"]);
    }

    #[test]
    fn test_scope_inputs_include_member_links() {
        // zone's member reads `a`; `b` reads a member of zone
        let graph = GraphDefinition::new("zones")
            .with_task("a", TaskDefinition::new("data"))
            .with_task("zone", TaskDefinition::new("scope"))
            .with_task(
                "inner",
                TaskDefinition::new("data")
                    .with_parent("zone")
                    .with_link("value", "a.result"),
            )
            .with_task(
                "sibling",
                TaskDefinition::new("data")
                    .with_parent("zone")
                    .with_link("value", "inner.result"),
            )
            .with_task("b", TaskDefinition::new("data").with_link("value", "inner.result"));
        let tasks = TaskTable::from_definition(&graph).unwrap();
        let connectivity = Connectivity::build(&tasks);

        assert_eq!(connectivity.scope_inputs("zone"), &["a".to_string()]);
        assert_eq!(connectivity.scope_inputs("sibling"), &["inner".to_string()]);
        // inner's own outer source was already gated by the zone
        assert_eq!(connectivity.scope_inputs("inner"), &["a".to_string()]);
        // readers outside wait for the whole zone
        assert_eq!(connectivity.scope_inputs("b"), &["zone".to_string()]);
    }
}
