//! Directed weighted multigraph over 44-character node keys (public-key
//! base64 or padded synthetic keys), with in-place PageRank and an ancestry
//! check used during consideration admission.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::consideration::PublicKey;

/// Pads the input string to the base64 length of an ed25519 public key.
pub fn pad_to_44_characters(input: &str) -> String {
    const BASE64_LENGTH: usize = 44;
    if input.len() >= BASE64_LENGTH {
        return input.to_owned();
    }
    let pad_length = BASE64_LENGTH - input.len() - 1;
    let mut padded = String::with_capacity(BASE64_LENGTH);
    padded.push_str(input);
    for _ in 0..pad_length {
        padded.push('0');
    }
    padded.push('=');
    padded
}

/// The graph key for an optional public key. Viewpoints (no sender) map to
/// the distinguished root node.
pub fn graph_key(pub_key: Option<&PublicKey>) -> String {
    match pub_key {
        None => pad_to_44_characters("0"),
        Some(pk) => pk.to_string(),
    }
}

struct Node {
    pubkey: String,
    ranking: f64,
    outbound: f64,
}

/// Graph holds node and edge data.
pub struct Graph {
    index: HashMap<String, u32>,
    nodes: HashMap<u32, Node>,
    edges: HashMap<u32, HashMap<u32, f64>>,
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            index: HashMap::new(),
            nodes: HashMap::new(),
            edges: HashMap::new(),
        }
    }

    fn node_index(&mut self, key: String) -> u32 {
        if let Some(index) = self.index.get(&key) {
            return *index;
        }
        let index = self.index.len() as u32;
        self.index.insert(key.clone(), index);
        self.nodes.insert(
            index,
            Node {
                pubkey: key,
                ranking: 0.0,
                outbound: 0.0,
            },
        );
        index
    }

    /// Creates a weighted edge between a source-target node pair, creating
    /// nodes on demand. If the edge already exists the weight accumulates;
    /// negative weights reverse earlier links.
    pub fn link(&mut self, src: &str, target: &str, weight: f64) -> f64 {
        let source = pad_to_44_characters(src);
        let target = pad_to_44_characters(target);

        let s_index = self.node_index(source);
        let t_index = self.node_index(target);

        self.nodes.get_mut(&s_index).expect("source node").outbound += weight;
        *self
            .edges
            .entry(s_index)
            .or_default()
            .entry(t_index)
            .or_insert(0.0) += weight;

        weight
    }

    /// True if the key has a node in the graph.
    pub fn has_node(&self, key: &str) -> bool {
        self.index.contains_key(&pad_to_44_characters(key))
    }

    /// Current cumulative weight of the edge, if present.
    pub fn edge_weight(&self, src: &str, target: &str) -> Option<f64> {
        let s_index = self.index.get(&pad_to_44_characters(src))?;
        let t_index = self.index.get(&pad_to_44_characters(target))?;
        self.edges.get(s_index)?.get(t_index).copied()
    }

    /// Current ranking of the node, if present.
    pub fn ranking(&self, key: &str) -> Option<f64> {
        let index = self.index.get(&pad_to_44_characters(key))?;
        self.nodes.get(index).map(|n| n.ranking)
    }

    /// Checks whether `descendant` is reachable from `parent`. Used to
    /// prevent cycles: a consideration is rejected when its recipient is an
    /// ancestor of its sender. The root node is never traversed through to
    /// avoid path explosion through the universal sink.
    pub fn is_parent_descendant(&self, parent: &str, descendant: &str) -> bool {
        let parent_index = match self.index.get(parent) {
            Some(i) => *i,
            None => return false,
        };
        let descendant_index = match self.index.get(descendant) {
            Some(i) => *i,
            None => return false,
        };

        if parent_index == 0 || descendant_index == 0 {
            return false;
        }

        let mut visited: HashMap<u32, bool> = HashMap::new();
        let mut stack = vec![parent_index];
        while let Some(current) = stack.pop() {
            if current == descendant_index {
                return true;
            }
            visited.insert(current, true);

            if let Some(edges) = self.edges.get(&current) {
                for edge in edges.keys() {
                    // skip the root node
                    if *edge == 0 {
                        continue;
                    }
                    if !visited.contains_key(edge) {
                        stack.push(*edge);
                    }
                }
            }
        }
        false
    }

    /// Computes the rank of every node in the graph in place.
    /// `alpha` is the damping factor; `epsilon` the convergence criteria.
    /// Runs as many iterations as needed until the L1 delta falls below
    /// `epsilon`. Dangling mass is redistributed uniformly.
    pub fn rank(&mut self, alpha: f64, epsilon: f64) {
        let mut normalized_weights: HashMap<u32, HashMap<u32, f64>> = HashMap::new();

        let mut delta = 1.0_f64;
        if self.nodes.is_empty() {
            return;
        }
        let inverse = 1.0 / self.nodes.len() as f64;

        // normalize all the edge weights so that their sum amounts to 1
        for (source, targets) in &self.edges {
            let outbound = self.nodes[source].outbound;
            if outbound > 0.0 {
                let normalized = normalized_weights.entry(*source).or_default();
                for (target, weight) in targets {
                    normalized.insert(*target, weight / outbound);
                }
            }
        }

        for node in self.nodes.values_mut() {
            node.ranking = inverse;
        }

        while delta > epsilon {
            let mut leak = 0.0_f64;
            let mut previous: HashMap<u32, f64> = HashMap::with_capacity(self.nodes.len());

            for (key, node) in self.nodes.iter_mut() {
                previous.insert(*key, node.ranking);
                if node.outbound == 0.0 {
                    leak += node.ranking;
                }
                node.ranking = 0.0;
            }

            leak *= alpha;

            let keys: Vec<u32> = self.nodes.keys().copied().collect();
            for source in &keys {
                if let Some(targets) = normalized_weights.get(source) {
                    for (target, weight) in targets {
                        self.nodes.get_mut(target).expect("target node").ranking +=
                            alpha * previous[source] * weight;
                    }
                }
                self.nodes.get_mut(source).expect("source node").ranking +=
                    (1.0 - alpha) * inverse + leak * inverse;
            }

            delta = 0.0;
            for (key, node) in &self.nodes {
                delta += (node.ranking - previous[key]).abs();
            }
        }
    }

    /// Emits a GraphViz subgraph restricted to edges incident on the given
    /// key's node, annotating labels via the synonym table and the
    /// positional locale index.
    pub fn to_dot(
        &self,
        pub_key: &str,
        indices: &[String],
        synonyms: &HashMap<String, String>,
    ) -> String {
        // defaults to zero, the root
        let pk_index = self.index.get(pub_key).copied().unwrap_or(0);

        let mut out = String::new();
        out.push_str("digraph G {\n");

        let mut included_nodes: Vec<u32> = Vec::new();

        for (from, edges) in &self.edges {
            for (to, weight) in edges {
                if (*from == pk_index || *to == pk_index) && *weight > 0.0 {
                    let _ = writeln!(out, "  \"{}\" -> \"{}\" [weight=\"{:.6}\"];", from, to, weight);
                    if !included_nodes.contains(from) {
                        included_nodes.push(*from);
                    }
                    if !included_nodes.contains(to) {
                        included_nodes.push(*to);
                    }
                }
            }
        }

        for id in included_nodes {
            let node = &self.nodes[&id];
            let trimmed: &str = node
                .pubkey
                .trim_end_matches(|c| c == '/' || c == '0' || c == '=');
            let mut label: String = trimmed.chars().take(15).collect();
            let mut locale = String::new();
            let mut l_index: i32 = -1;

            if node.pubkey == pad_to_44_characters("0") {
                l_index = 0;
            }

            if let Some(synonym) = synonyms.get(&node.pubkey) {
                label = synonym.clone();
            }

            if let Some((locl, _)) = crate::indexer::locale_from_pub_key(&node.pubkey, indices) {
                l_index = crate::indexer::locale_index(&locl, indices);
                locale = locl;

                if let Some(synonym) = synonyms.get(&pad_to_44_characters(&locale)) {
                    label = synonym.clone();
                }

                if crate::indexer::inflate_nodes(&node.pubkey).0 {
                    l_index = -1;
                    if let Some(synonym) = synonyms.get(&node.pubkey) {
                        label = synonym.clone();
                    }
                }
            }

            let _ = writeln!(
                out,
                "  \"{}\" [label=\"{}\", pubkey=\"{}\", locale=\"{}\", localeIndex=\"{}\", ranking=\"{:.6}\"];",
                id, label, node.pubkey, locale, l_index, node.ranking,
            );
        }

        out.push_str("}\n");
        out
    }

    /// Clears all graph data.
    pub fn reset(&mut self) {
        self.index.clear();
        self.nodes.clear();
        self.edges.clear();
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> String {
        pad_to_44_characters("0")
    }

    #[test]
    fn padding_produces_44_character_keys() {
        assert_eq!(pad_to_44_characters("0").len(), 44);
        assert_eq!(pad_to_44_characters("0"), format!("0{}=", "0".repeat(42)));
        let long = "x".repeat(44);
        assert_eq!(pad_to_44_characters(&long), long);
    }

    #[test]
    fn link_accumulates_weights_and_outbound() {
        let mut g = Graph::new();
        g.link("a", "b", 1.0);
        g.link("a", "b", 0.5);
        g.link("a", "c", 2.0);
        assert_eq!(g.edge_weight("a", "b"), Some(1.5));
        assert_eq!(g.edge_weight("a", "c"), Some(2.0));
        assert_eq!(g.node_count(), 3);
    }

    #[test]
    fn negative_links_reverse_earlier_ones() {
        let mut g = Graph::new();
        g.link("a", "b", 1.0);
        g.link("b", "c", 0.25);
        g.link("a", "b", -1.0);
        g.link("b", "c", -0.25);
        assert!(g.edge_weight("a", "b").unwrap().abs() < 1e-9);
        assert!(g.edge_weight("b", "c").unwrap().abs() < 1e-9);
    }

    #[test]
    fn ancestry_follows_edges() {
        let mut g = Graph::new();
        // node 0 is the root; create it first like the genesis viewpoint does
        g.link(&root(), "a", 1.0);
        g.link("a", "b", 1.0);
        g.link("b", "c", 1.0);

        let (a, b, c) = (
            pad_to_44_characters("a"),
            pad_to_44_characters("b"),
            pad_to_44_characters("c"),
        );
        assert!(g.is_parent_descendant(&a, &c));
        assert!(g.is_parent_descendant(&b, &c));
        assert!(!g.is_parent_descendant(&c, &a));
        assert!(!g.is_parent_descendant(&a, &pad_to_44_characters("unknown")));
    }

    #[test]
    fn ancestry_never_traverses_the_root() {
        let mut g = Graph::new();
        g.link(&root(), "a", 1.0);
        // a -> root -> b: the path through the universal sink must not count
        g.link("a", &root(), 1.0);
        g.link(&root(), "b", 1.0);

        let (a, b) = (pad_to_44_characters("a"), pad_to_44_characters("b"));
        assert!(!g.is_parent_descendant(&a, &b));
        // and the root itself is never a parent or descendant
        assert!(!g.is_parent_descendant(&root(), &a));
        assert!(!g.is_parent_descendant(&a, &root()));
    }

    #[test]
    fn rank_converges_and_sums_to_one() {
        let mut g = Graph::new();
        g.link(&root(), "a", 1.0);
        g.link("a", "b", 1.0);
        g.link("b", "a", 1.0);
        g.link("a", "c", 1.0);
        g.rank(0.85, 1e-9);

        let total: f64 = [root().as_str(), "a", "b", "c"]
            .iter()
            .filter_map(|k| g.ranking(k))
            .sum();
        assert!((total - 1.0).abs() < 1e-6, "rank sum {} != 1", total);

        // "a" has two inbound edges, "c" one; "a" should rank higher
        assert!(g.ranking("a").unwrap() > g.ranking("c").unwrap());
    }

    #[test]
    fn dot_export_restricts_to_incident_edges() {
        let mut g = Graph::new();
        g.link(&root(), "a", 1.0);
        g.link("a", "b", 1.0);
        g.link("b", "c", 1.0);

        let a = pad_to_44_characters("a");
        let dot = g.to_dot(&a, &[], &HashMap::new());
        assert!(dot.starts_with("digraph G {"));
        // contains the root->a and a->b edges but not b->c
        let a_index = 1; // insertion order: root, a, b, c
        assert!(dot.contains(&format!("-> \"{}\"", a_index)));
        assert!(!dot.contains("\"2\" -> \"3\""));
    }
}
