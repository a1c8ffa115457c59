//! Streams connected views into the consideration graph and recomputes
//! rankings when a tip burst finishes.
//!
//! Recipient public keys are decoded as `/`-delimited paths: the leading
//! token is an Open Location Code or a numeric index into the enumerated
//! focal points, intermediate tokens are nested path nodes, and the final
//! token holds memo-linked notes. Edges constructed on connect use weight
//! +1 scaling and are added again with weight -1 on disconnect, so replaying
//! a branch forwards and backwards leaves the graph where it started.
//!
//! The processor invokes `index_view` synchronously while committing each
//! (dis-)connection, which keeps graph state visible to the very next
//! ledger ancestry check.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::error::ProcessError;
use crate::graph::{graph_key, pad_to_44_characters, Graph};
use crate::ledger::{BranchType, Ledger};
use crate::olc;
use crate::view::{View, ViewID};
use crate::view_storage::ViewStorage;

/// A deduplicated collection of strings with preserved insertion order.
#[derive(Default)]
pub struct OrderedHashSet {
    set: std::collections::HashSet<String>,
    values: Vec<String>,
}

impl OrderedHashSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: String) {
        if self.set.insert(value.clone()) {
            self.values.push(value);
        }
    }

    pub fn remove(&mut self, value: &str) {
        if self.set.remove(value) {
            self.values.retain(|v| v != value);
        }
    }

    pub fn contains(&self, value: &str) -> bool {
        self.set.contains(value)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// All elements in insertion order.
    pub fn values(&self) -> &[String] {
        &self.values
    }
}

struct IndexerInner {
    latest_view_id: ViewID,
    latest_height: i64,
    /// Enumerated focal points, referenced by position from numeric locale
    /// tokens.
    indices: OrderedHashSet,
    /// Human-readable labels for graph keys, used in DOT export.
    synonyms: HashMap<String, String>,
}

pub struct Indexer {
    view_store: Arc<dyn ViewStorage>,
    ledger: Arc<dyn Ledger>,
    con_graph: Arc<RwLock<Graph>>,
    inner: Mutex<IndexerInner>,
}

impl Indexer {
    pub fn new(
        con_graph: Arc<RwLock<Graph>>,
        view_store: Arc<dyn ViewStorage>,
        ledger: Arc<dyn Ledger>,
        genesis_view_id: ViewID,
    ) -> Self {
        let mut indices = OrderedHashSet::new();
        indices.add(pad_to_44_characters("0"));
        Indexer {
            view_store,
            ledger,
            con_graph,
            inner: Mutex::new(IndexerInner {
                latest_view_id: genesis_view_id,
                latest_height: 0,
                indices,
                synonyms: HashMap::new(),
            }),
        }
    }

    /// Rebuilds the graph from the main branch, starting at the last indexed
    /// view. Must complete before the processor starts connecting new views:
    /// the graph participates in consensus through the ancestry check.
    pub fn catch_up(&self) -> Result<(), ProcessError> {
        let latest_id = self.inner.lock().latest_view_id;

        let header = match self.view_store.get_view_header(&latest_id)? {
            Some((header, _)) => header,
            // nothing stored yet
            None => return Ok(()),
        };
        if self.ledger.get_branch_type(&latest_id)? != BranchType::Main {
            return Err(ProcessError::MissingView(latest_id));
        }

        let mut height = header.height;
        loop {
            let next_id = match self.ledger.get_view_id_for_height(height)? {
                Some(id) => id,
                None => break,
            };
            let view = self
                .view_store
                .get_view(&next_id)?
                .ok_or(ProcessError::MissingView(next_id))?;
            self.index_view(&view, &next_id, true);
            height += 1;
        }

        {
            let inner = self.inner.lock();
            info!(
                height = inner.latest_height,
                view_id = %inner.latest_view_id,
                "finished indexing"
            );
        }

        self.rank();
        Ok(())
    }

    /// Recomputes rankings in place.
    pub fn rank(&self) {
        let height = self.inner.lock().latest_height;
        info!(height, "ranking considerations");
        self.con_graph.write().rank(1.0, 1e-6);
    }

    /// DOT rendering of the subgraph around the given graph key.
    pub fn graph_dot(&self, pub_key: &str) -> String {
        let inner = self.inner.lock();
        self.con_graph
            .read()
            .to_dot(pub_key, inner.indices.values(), &inner.synonyms)
    }

    /// The enumerated focal points in insertion order.
    pub fn focal_points(&self) -> Vec<String> {
        self.inner.lock().indices.values().to_vec()
    }

    /// Folds one view's considerations into the graph. `connect` selects the
    /// edge sign: disconnection reverses every edge the connection added.
    pub fn index_view(&self, view: &View, id: &ViewID, connect: bool) {
        let inner = &mut *self.inner.lock();
        inner.latest_view_id = *id;
        inner.latest_height = view.header.height;
        let increment_by: f64 = if connect { 1.0 } else { -1.0 };

        let IndexerInner {
            indices, synonyms, ..
        } = inner;

        let mut graph = self.con_graph.write();
        let root = pad_to_44_characters("0");

        for cn in &view.considerations {
            let con_for = graph_key(Some(&cn.for_));
            let con_by = graph_key(cn.by.as_ref());

            let (nodes_ok, locale, nodes, notes) = inflate_nodes(&con_for);

            // viewpoint recipients that decode as a full location code
            // enumerate a focal point, e.g.
            // 6FG22222+222/201/window00000000000000000000=
            if cn.by.is_none() && nodes_ok {
                let trimmed_for = trim_key(&con_for).to_owned();
                if olc::is_full(&locale) {
                    if connect {
                        indices.add(trimmed_for);
                    } else if graph.has_node(&con_for) {
                        // drop the focal point once its inbound weight from
                        // the root falls away
                        let weight = graph.edge_weight(&root, &con_for).unwrap_or(0.0);
                        if weight < 2.0 {
                            indices.remove(&trimmed_for);
                        }
                    }
                }
            }

            // capture synonyms from the memo when the notes token is all
            // '+': one marker character captures one memo label for the
            // sender (no locale) or for the locale itself
            if notes.trim_end_matches('+').is_empty() && nodes.len() == 1 {
                let subject = if locale.is_empty() {
                    con_by.clone()
                } else {
                    pad_to_44_characters(&locale)
                };
                let raw = utf8_prefix(&cn.memo, 15);
                synonyms.insert(subject, raw.to_lowercase().trim().replace(' ', "-"));
            }

            graph.link(&con_by, &con_for, increment_by);

            let view_height_key = format!("{}+", view.header.height);

            let located = locale_from_pub_key(&con_for, indices.values());
            if let Some((locale, catchments)) = located {
                if nodes_ok {
                    graph.link(&con_for, &view_height_key, increment_by / 2.0);

                    // date buckets chain each located recipient up to the root
                    let timestamp =
                        DateTime::from_timestamp(cn.time, 0).unwrap_or(DateTime::UNIX_EPOCH);
                    synonyms.insert(
                        con_for.clone(),
                        timestamp.format("%Y/%m/%d %H:%M:%S").to_string(),
                    );
                    let year = timestamp.format("%Y+").to_string();
                    let month = timestamp.format("%Y/%m+").to_string();
                    let day = timestamp.format("%Y/%m/%d+").to_string();

                    graph.link(&con_for, &day, increment_by / 4.0);
                    graph.link(&day, &month, increment_by / 4.0);
                    graph.link(&month, &year, increment_by / 4.0);
                    graph.link(&year, "0", increment_by / 4.0);

                    let weight = (increment_by / 2.0) / (nodes.len() as f64 + 1.0);
                    let reversed: Vec<&String> = nodes.iter().rev().collect();

                    // notes chain to the innermost node
                    let trimmed_notes = notes.trim_matches('+');
                    let nts: Vec<&str> = trimmed_notes.split('+').collect();
                    for nt in &nts {
                        let nweight = weight / nts.len() as f64;
                        graph.link(&con_for, nt, nweight);
                        graph.link(nt, reversed[0], nweight);
                    }

                    // path nodes chain outward, the outermost standing in
                    // for the locale, which anchors into its catchments
                    for (i, node) in reversed.iter().enumerate() {
                        let trimmed_node = node.trim_matches('+');
                        let mut node_key = trimmed_node.to_owned();

                        graph.link(&con_for, &node_key, weight);

                        if i == reversed.len() - 1 {
                            node_key = locale.clone();
                            graph.link(&node_key, &catchments[0], weight);
                        }

                        if i + 1 < reversed.len() {
                            let trimmed_next = reversed[i + 1].trim_matches('+');
                            let next_key = if i + 1 == reversed.len() - 1 {
                                locale.clone()
                            } else {
                                trimmed_next.to_owned()
                            };
                            graph.link(&node_key, &next_key, weight);
                        }
                    }

                    // catchments chain coarser and coarser until the root
                    for i in 0..catchments.len() {
                        if i + 1 < catchments.len() {
                            graph.link(&catchments[i], &catchments[i + 1], weight);
                        }
                        if i == catchments.len() - 1 {
                            graph.link(&catchments[i], "0", weight);
                        }
                    }

                    // diminishing powers-of-ten height buckets chain upward
                    let orders = diminishing_orders(view.header.height);
                    for j in 1..orders.len() {
                        let source = format!("{}+", orders[j - 1]);
                        let mut target = orders[j].to_string();
                        if orders[j] != 0 {
                            target.push('+');
                        }
                        graph.link(&source, &target, increment_by / 2.0);
                    }
                }
            }
        }
    }
}

fn trim_key(s: &str) -> &str {
    s.trim_end_matches(|c| c == '/' || c == '0' || c == '=')
}

/// The longest prefix of `s` that is at most `max` bytes and still valid
/// UTF-8.
fn utf8_prefix(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// The position of a locale in the enumerated focal points.
pub(crate) fn locale_index(locale: &str, indices: &[String]) -> i32 {
    for (i, c) in indices.iter().enumerate() {
        if c == locale {
            return i as i32;
        }
    }
    -1
}

/// Each element is the previous one shortened by two characters, down to the
/// coarsest two-character area.
fn generate_strings_slice(s: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut cur = s;
    loop {
        result.push(cur.to_owned());
        if cur.len() <= 2 {
            break;
        }
        cur = &cur[..cur.len() - 2];
    }
    result
}

/// Resolves the locale of a structured key: either a literal full location
/// code or a numeric index into the enumerated focal points. Returns the
/// locale and its catchments, coarsest last.
pub(crate) fn locale_from_pub_key(
    pub_key: &str,
    focal_points: &[String],
) -> Option<(String, Vec<String>)> {
    let split_trimmed: Vec<&str> = trim_key(pub_key).split('/').collect();

    let locale_notation = split_trimmed[0].trim_matches('+');

    if olc::is_full(locale_notation) {
        let prefix = locale_notation.split('+').next().unwrap_or("");
        return Some((locale_notation.to_owned(), generate_strings_slice(prefix)));
    }

    let locale_index: usize = locale_notation.parse().ok()?;
    if focal_points.len() < locale_index + 1 {
        return None;
    }
    if split_trimmed.len() < 2 {
        return None;
    }

    let locale = focal_points[locale_index].clone();
    let prefix = locale.split('+').next().unwrap_or("").to_owned();
    Some((locale, generate_strings_slice(&prefix)))
}

/// Splits a structured key into its locale, path nodes and notes tokens.
/// Returns `(nodes_ok, locale, nodes, notes)`.
pub(crate) fn inflate_nodes(pub_key: &str) -> (bool, String, Vec<String>, String) {
    let trimmed = trim_key(pub_key);
    let split: Vec<&str> = trimmed.split('/').collect();

    if split.len() < 2 {
        return (
            false,
            String::new(),
            vec![pub_key.to_owned()],
            pub_key.to_owned(),
        );
    }

    let locale = split[0].to_owned();
    // all tokens except the last are nodes; the last is the notes
    let nodes: Vec<String> = split[..split.len() - 1]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();
    let notes = split[split.len() - 1].to_owned();

    let nodes_ok = !(nodes.len() == 1 && notes.trim_end_matches('+').is_empty());

    (nodes_ok, locale, nodes, notes)
}

/// `n` followed by `n` rounded down at each successive power of ten, ending
/// at the coarsest distinct bucket.
pub(crate) fn diminishing_orders(n: i64) -> Vec<i64> {
    if n == 0 {
        return vec![0];
    }
    let digits = (n as f64).log10() as u32 + 1;

    let mut results = vec![n];
    for i in 0..digits {
        let power = 10i64.pow(i + 1);
        let rounded = n - (n % power);
        if rounded != *results.last().expect("non-empty") {
            results.push(rounded);
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_hash_set_preserves_insertion_order() {
        let mut set = OrderedHashSet::new();
        set.add("b".to_owned());
        set.add("a".to_owned());
        set.add("b".to_owned());
        assert_eq!(set.values(), ["b".to_owned(), "a".to_owned()]);
        set.remove("b");
        assert_eq!(set.values(), ["a".to_owned()]);
        assert!(!set.contains("b"));
    }

    #[test]
    fn diminishing_orders_rounds_down_powers_of_ten() {
        assert_eq!(diminishing_orders(0), vec![0]);
        assert_eq!(diminishing_orders(7), vec![7, 0]);
        assert_eq!(diminishing_orders(1234), vec![1234, 1230, 1200, 1000, 0]);
        assert_eq!(diminishing_orders(1000), vec![1000, 0]);
        assert_eq!(diminishing_orders(105), vec![105, 100, 0]);
    }

    #[test]
    fn strings_slice_shortens_by_two() {
        assert_eq!(
            generate_strings_slice("6FG22222"),
            vec!["6FG22222", "6FG222", "6FG2", "6F"]
        );
        assert_eq!(generate_strings_slice("6F"), vec!["6F"]);
    }

    #[test]
    fn inflate_structured_keys() {
        let (ok, locale, nodes, notes) = inflate_nodes("6FG22222+222/201/window00000000000000000000=");
        assert!(ok);
        assert_eq!(locale, "6FG22222+222");
        assert_eq!(nodes, vec!["6FG22222+222", "201"]);
        assert_eq!(notes, "window");

        // a plain public key has no structure
        let (ok, _, nodes, _) = inflate_nodes("AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=");
        assert!(!ok);
        assert_eq!(nodes.len(), 1);

        // a lone locale with an all-marker notes token isn't a path
        let (ok, _, _, notes) = inflate_nodes("6FG22222+222/+0000000000000000000000000000=");
        assert!(!ok);
        assert_eq!(notes, "+");
    }

    #[test]
    fn locale_resolution() {
        // literal full code
        let (locale, catchments) =
            locale_from_pub_key("6FG22222+222/201/window0000000000000000000=", &[]).unwrap();
        assert_eq!(locale, "6FG22222+222");
        assert_eq!(catchments, vec!["6FG22222", "6FG222", "6FG2", "6F"]);

        // numeric index into the enumerated focal points
        let points = vec!["8FVC9G8F+6X".to_owned()];
        let (locale, catchments) =
            locale_from_pub_key("0/lobby/window000000000000000000000000000=", &points).unwrap();
        assert_eq!(locale, "8FVC9G8F+6X");
        assert_eq!(catchments[0], "8FVC9G8F");

        // out-of-range index
        assert!(locale_from_pub_key("7/lobby/window0000000000000000000000000=", &points).is_none());
        // bare numeric token with no path
        assert!(locale_from_pub_key("0000000000000000000000000000000000000000000=", &points).is_none());
        // not a locale at all
        assert!(locale_from_pub_key("AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=", &[]).is_none());
    }

    #[test]
    fn utf8_prefix_respects_char_boundaries() {
        assert_eq!(utf8_prefix("hello", 15), "hello");
        let s = "こんにちは!"; // 3-byte chars
        assert_eq!(utf8_prefix(s, 7), "こん");
        assert_eq!(utf8_prefix(s, 16), s);
    }

    mod revert {
        use super::super::*;
        use crate::consideration::{Consideration, ConsiderationID, PublicKey};
        use crate::error::LedgerError;
        use crate::view::View;
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine as _;
        use std::collections::HashMap;

        struct NullLedger;

        impl Ledger for NullLedger {
            fn get_point_tip(&self) -> Result<Option<(ViewID, i64)>, LedgerError> {
                Ok(None)
            }
            fn get_view_id_for_height(&self, _: i64) -> Result<Option<ViewID>, LedgerError> {
                Ok(None)
            }
            fn set_branch_type(
                &self,
                _: &ViewID,
                _: BranchType,
            ) -> Result<(), LedgerError> {
                Ok(())
            }
            fn get_branch_type(&self, _: &ViewID) -> Result<BranchType, LedgerError> {
                Ok(BranchType::Unknown)
            }
            fn connect_view(
                &self,
                _: &ViewID,
                _: &View,
            ) -> Result<Vec<ConsiderationID>, LedgerError> {
                unimplemented!()
            }
            fn disconnect_view(
                &self,
                _: &ViewID,
                _: &View,
            ) -> Result<Vec<ConsiderationID>, LedgerError> {
                unimplemented!()
            }
            fn get_public_key_imbalance(&self, _: &PublicKey) -> Result<i64, LedgerError> {
                Ok(0)
            }
            fn get_public_key_imbalances(
                &self,
                _: &[PublicKey],
            ) -> Result<(HashMap<PublicKey, i64>, Option<ViewID>, i64), LedgerError> {
                unimplemented!()
            }
            fn get_consideration_index(
                &self,
                _: &ConsiderationID,
            ) -> Result<Option<(ViewID, usize)>, LedgerError> {
                Ok(None)
            }
            fn get_public_key_consideration_indices_range(
                &self,
                _: &PublicKey,
                _: i64,
                _: i64,
                _: usize,
                _: usize,
            ) -> Result<(Vec<ViewID>, Vec<usize>, i64, usize), LedgerError> {
                unimplemented!()
            }
            fn imbalance(&self) -> Result<i64, LedgerError> {
                Ok(0)
            }
            fn get_public_key_imbalance_at(
                &self,
                _: &PublicKey,
                _: i64,
            ) -> Result<i64, LedgerError> {
                unimplemented!()
            }
        }

        fn structured_key(s: &str) -> PublicKey {
            let padded = pad_to_44_characters(s);
            let bytes = BASE64.decode(&padded).expect("structured key decodes");
            let mut pk = PublicKey::default();
            pk.0.copy_from_slice(&bytes);
            pk
        }

        fn make_view(height: i64, considerations: Vec<Consideration>) -> (ViewID, View) {
            let view = View::new(
                ViewID::default(),
                height,
                ViewID([0xff; 32]),
                ViewID::default(),
                considerations,
            )
            .unwrap();
            let id = view.id().unwrap();
            (id, view)
        }

        fn indexer() -> (Indexer, Arc<RwLock<Graph>>) {
            let graph = Arc::new(RwLock::new(Graph::new()));
            let store = Arc::new(crate::view_storage::ViewStorageMemory::new());
            let idx = Indexer::new(
                graph.clone(),
                store,
                Arc::new(NullLedger),
                ViewID::default(),
            );
            (idx, graph)
        }

        #[test]
        fn disconnect_reverses_connect_edges() {
            let (idx, graph) = indexer();

            // a located viewpoint recipient builds the full edge set
            let mut viewpoint =
                Consideration::new(None, structured_key("6FG22222+222/201/window"), 0, 0, 7, "hi");
            viewpoint.time = 1_700_000_000;
            viewpoint.nonce = 1;
            let (id, view) = make_view(7, vec![viewpoint]);

            idx.index_view(&view, &id, true);

            let con_for = pad_to_44_characters("6FG22222+222/201/window");
            {
                let g = graph.read();
                assert!(g.edge_weight(&pad_to_44_characters("0"), &con_for).is_some());
                assert_eq!(g.edge_weight(&con_for, "7+"), Some(0.5));
                assert!(g.edge_weight("6FG22222", "6FG222").is_some());
            }
            assert!(idx.focal_points().contains(&"6FG22222+222/201/window".to_owned()));

            idx.index_view(&view, &id, false);

            let g = graph.read();
            for (src, dst) in [
                (pad_to_44_characters("0"), con_for.clone()),
                (con_for.clone(), "7+".to_owned()),
                ("6FG22222".to_owned(), "6FG222".to_owned()),
                ("6FG222".to_owned(), "6FG2".to_owned()),
                ("6F".to_owned(), pad_to_44_characters("0")),
            ] {
                let weight = g.edge_weight(&src, &dst).unwrap_or(0.0);
                assert!(
                    weight.abs() < 1e-9,
                    "edge {} -> {} kept weight {}",
                    src,
                    dst,
                    weight
                );
            }
        }
    }
}
