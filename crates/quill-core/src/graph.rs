//! Dependency graph checks over `depends_on` edges.

use std::collections::HashMap;

use crate::types::Task;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Return one dependency cycle (as a path of ids, first id repeated at the end)
/// if the edge set contains any. Edges to unknown ids are ignored.
pub fn find_cycle<'a, I>(edges: I) -> Option<Vec<String>>
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
{
    let graph: HashMap<&str, &[String]> = edges.into_iter().collect();
    let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(graph.len());

    // Sorted roots make the reported cycle deterministic.
    let mut roots: Vec<&str> = graph.keys().copied().collect();
    roots.sort_unstable();

    for root in roots {
        if marks.contains_key(root) {
            continue;
        }
        let mut path: Vec<&str> = Vec::new();
        // Iterative DFS over (node, next edge index).
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];
        marks.insert(root, Mark::Visiting);
        path.push(root);

        while let Some((node, idx)) = stack.pop() {
            let deps = graph.get(node).copied().unwrap_or(&[]);
            if idx < deps.len() {
                stack.push((node, idx + 1));
                let next = deps[idx].as_str();
                if !graph.contains_key(next) {
                    continue;
                }
                match marks.get(next) {
                    Some(Mark::Visiting) => {
                        let start = path.iter().position(|n| *n == next).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(next.to_string());
                        return Some(cycle);
                    }
                    Some(Mark::Done) => {}
                    None => {
                        marks.insert(next, Mark::Visiting);
                        path.push(next);
                        stack.push((next, 0));
                    }
                }
            } else {
                marks.insert(node, Mark::Done);
                path.pop();
            }
        }
    }
    None
}

/// Cycle check over a full task list.
pub fn find_task_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    find_cycle(tasks.iter().map(|t| (t.id.as_str(), t.depends_on.as_slice())))
}

/// Would replacing `task_id`'s dependencies with `new_deps` close a cycle?
pub fn cycle_with_deps(tasks: &[Task], task_id: &str, new_deps: &[String]) -> Option<Vec<String>> {
    find_cycle(tasks.iter().map(|t| {
        if t.id == task_id {
            (t.id.as_str(), new_deps)
        } else {
            (t.id.as_str(), t.depends_on.as_slice())
        }
    }))
}
