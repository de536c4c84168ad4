use std::collections::HashMap;

/// An ordered trie of path patterns.
///
/// Patterns are made of `/`-separated segments of three kinds: literals,
/// `:name` (binds a single segment), and `*name` (binds the rest of the
/// path, slashes included, and must be the final segment). At any node a
/// literal match is preferred over `:`, and `:` over `*`; lookup backtracks
/// so a literal branch that dead-ends cannot shadow a matching `:` branch.
///
/// Adding the same pattern twice overwrites the earlier value.
#[derive(Debug)]
pub struct RouteTrie<V> {
    root: Node<V>,
}

#[derive(Debug)]
struct Node<V> {
    children: HashMap<String, Node<V>>,
    var: Option<Box<VarChild<V>>>,
    wild: Option<(String, V)>,
    value: Option<V>,
}

#[derive(Debug)]
struct VarChild<V> {
    name: String,
    node: Node<V>,
}

impl<V> Default for Node<V> {
    fn default() -> Self {
        Node {
            children: HashMap::new(),
            var: None,
            wild: None,
            value: None,
        }
    }
}

impl<V: Clone> Default for RouteTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> RouteTrie<V> {
    pub fn new() -> Self {
        RouteTrie {
            root: Node::default(),
        }
    }

    pub fn add(&mut self, pattern: &str, value: V) {
        let mut node = &mut self.root;
        for segment in split_path(pattern) {
            if let Some(name) = segment.strip_prefix('*') {
                node.wild = Some((name.to_string(), value));
                return;
            }
            if let Some(name) = segment.strip_prefix(':') {
                let var = node.var.get_or_insert_with(|| {
                    Box::new(VarChild {
                        name: name.to_string(),
                        node: Node::default(),
                    })
                });
                // Re-adding with a different placeholder name rebinds it.
                var.name = name.to_string();
                node = &mut var.node;
            } else {
                node = node.children.entry(segment.to_string()).or_default();
            }
        }
        node.value = Some(value);
    }

    /// Looks up a path, returning the stored value and any captured params.
    pub fn get(&self, path: &str) -> Option<(V, HashMap<String, String>)> {
        let segments: Vec<&str> = split_path(path).collect();
        let mut params = HashMap::new();
        let value = lookup(&self.root, &segments, &mut params)?;
        Some((value.clone(), params))
    }
}

fn lookup<'a, V>(
    node: &'a Node<V>,
    segments: &[&str],
    params: &mut HashMap<String, String>,
) -> Option<&'a V> {
    if segments.is_empty() {
        return node.value.as_ref();
    }

    if let Some(child) = node.children.get(segments[0]) {
        if let Some(value) = lookup(child, &segments[1..], params) {
            return Some(value);
        }
    }

    if let Some(var) = &node.var {
        params.insert(var.name.clone(), segments[0].to_string());
        if let Some(value) = lookup(&var.node, &segments[1..], params) {
            return Some(value);
        }
        params.remove(&var.name);
    }

    if let Some((name, value)) = &node.wild {
        params.insert(name.clone(), segments.join("/"));
        return Some(value);
    }

    None
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.strip_prefix('/').unwrap_or(path).split('/')
}
