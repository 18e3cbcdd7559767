//! Hierarchical projection of task results.
//!
//! Paths split on `/` into nodes; siblings keep insertion order. Flattening
//! collapses single-child chains into slash-joined names for display while
//! keeping each merged node's original path.

use serde::Serialize;
use serde_json::Value;

use crate::tasks::ResultRow;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Node {
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub children: Vec<Node>,
}

impl Node {
    fn new(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_string(),
            value: None,
            children: Vec::new(),
        }
    }

    /// Build the tree for `rows`, which must already be in insertion order.
    pub fn from_rows(rows: &[ResultRow]) -> Node {
        let mut root = Node::new("", "/");
        for row in rows {
            root.insert(&row.path, row.payload.clone());
        }
        root
    }

    fn insert(&mut self, path: &str, payload: Value) {
        let mut node = self;
        let mut walked = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            walked.push('/');
            walked.push_str(segment);
            let position = node.children.iter().position(|c| c.name == segment);
            let index = match position {
                Some(index) => index,
                None => {
                    node.children.push(Node::new(segment, &walked));
                    node.children.len() - 1
                }
            };
            node = &mut node.children[index];
        }
        node.value = Some(payload);
    }

    /// Collapse every valueless node that has exactly one child into that
    /// child, producing slash-joined names. Deterministic and idempotent.
    pub fn flatten(mut self) -> Node {
        while self.value.is_none() && self.children.len() == 1 && !self.name.is_empty() {
            let child = self.children.pop().expect("one child");
            self.name = format!("{}/{}", self.name, child.name);
            self.path = child.path;
            self.value = child.value;
            self.children = child.children;
        }
        self.children = self.children.into_iter().map(Node::flatten).collect();
        self
    }
}

/// Convenience: tree + flatten over a result set.
pub fn as_tree(rows: &[ResultRow]) -> Node {
    Node::from_rows(rows).flatten()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: i64, path: &str, payload: Value) -> ResultRow {
        ResultRow {
            id,
            path: path.to_string(),
            payload,
        }
    }

    #[test]
    fn builds_hierarchy_in_insertion_order() {
        let rows = vec![
            row(1, "/pipeline/r/tasks/1-b", json!({"status": "ok"})),
            row(2, "/pipeline/r/tasks/0-a", json!({"status": "ok"})),
        ];
        let tree = Node::from_rows(&rows);
        let tasks = &tree.children[0].children[0].children[0];
        assert_eq!(tasks.name, "tasks");
        let names: Vec<_> = tasks.children.iter().map(|c| c.name.as_str()).collect();
        // Insertion order, not lexical order.
        assert_eq!(names, vec!["1-b", "0-a"]);
    }

    #[test]
    fn single_child_chains_collapse_to_slash_joined_names() {
        let rows = vec![row(1, "/pipeline/r/tasks/0-a", json!({"x": 1}))];
        let tree = as_tree(&rows);
        assert_eq!(tree.children.len(), 1);
        let merged = &tree.children[0];
        assert_eq!(merged.name, "pipeline/r/tasks/0-a");
        assert_eq!(merged.path, "/pipeline/r/tasks/0-a");
        assert_eq!(merged.value, Some(json!({"x": 1})));
    }

    #[test]
    fn nodes_with_values_do_not_collapse() {
        let rows = vec![
            row(1, "/a", json!({"v": 1})),
            row(2, "/a/b", json!({"v": 2})),
        ];
        let tree = as_tree(&rows);
        let a = &tree.children[0];
        assert_eq!(a.name, "a");
        assert_eq!(a.value, Some(json!({"v": 1})));
        assert_eq!(a.children[0].name, "b");
    }

    #[test]
    fn flatten_is_idempotent() {
        let rows = vec![
            row(1, "/pipeline/r/tasks/0-a/logs", json!({"l": 1})),
            row(2, "/pipeline/r/tasks/1-b", json!({"s": 2})),
        ];
        let once = as_tree(&rows);
        let twice = once.clone().flatten();
        assert_eq!(once, twice);
    }

    #[test]
    fn branching_point_stays_unmerged() {
        let rows = vec![
            row(1, "/pipeline/r/tasks/0-a", json!({})),
            row(2, "/pipeline/r/jobs/j1", json!({})),
        ];
        let tree = as_tree(&rows);
        let shared = &tree.children[0];
        assert_eq!(shared.name, "pipeline/r");
        let names: Vec<_> = shared.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["tasks/0-a", "jobs/j1"]);
    }
}
