//! Shared harness for end-to-end tests: a full node stack over temp-dir
//! stores, with a trivially easy target so views render on the first
//! attempt.

#![allow(dead_code)]

use std::sync::Arc;

use ed25519_dalek::SigningKey;
use parking_lot::RwLock;

use focalpoint::consideration::{Consideration, PublicKey};
use focalpoint::consideration_queue::ConsiderationQueueMemory;
use focalpoint::graph::Graph;
use focalpoint::indexer::Indexer;
use focalpoint::ledger::{Ledger, LedgerDisk};
use focalpoint::processor::Processor;
use focalpoint::retarget::compute_target;
use focalpoint::view::{View, ViewID};
use focalpoint::view_storage::{ViewStorage, ViewStorageDisk};

/// Every hash satisfies the all-ones target, and each view contributes
/// exactly one unit of point work.
pub fn easy_target() -> ViewID {
    ViewID([0xff; 32])
}

pub fn test_key(fill: u8) -> (SigningKey, PublicKey) {
    let sk = SigningKey::from_bytes(&[fill; 32]);
    let pk = PublicKey(sk.verifying_key().to_bytes());
    (sk, pk)
}

pub struct Node {
    _dir: tempfile::TempDir,
    pub view_store: Arc<dyn ViewStorage>,
    pub ledger: Arc<dyn Ledger>,
    pub cn_queue: Arc<ConsiderationQueueMemory>,
    pub graph: Arc<RwLock<Graph>>,
    pub processor: Processor,
    pub processor_handle: tokio::task::JoinHandle<()>,
    pub genesis_id: ViewID,
    pub genesis: View,
}

impl Node {
    pub async fn shutdown(self) {
        self.processor.shutdown();
        let _ = self.processor_handle.await;
    }

    pub fn tip(&self) -> (ViewID, i64) {
        self.ledger.get_point_tip().unwrap().expect("tip set")
    }

    pub fn imbalance(&self, pk: &PublicKey) -> i64 {
        self.ledger.get_public_key_imbalance(pk).unwrap()
    }

    /// Builds the next view on the given parent, prepending a viewpoint for
    /// `vp_recipient`. Times advance one second per height so the median
    /// timestamp rule always passes.
    pub fn build_next(
        &self,
        parent_id: &ViewID,
        cns: Vec<Consideration>,
        vp_recipient: PublicKey,
    ) -> (ViewID, View) {
        let (parent, _) = self
            .view_store
            .get_view_header(parent_id)
            .unwrap()
            .expect("parent header");
        let height = parent.height + 1;

        let mut viewpoint = Consideration::new(None, vp_recipient, 0, 0, height, "");
        viewpoint.time = parent.time;

        let mut list = vec![viewpoint];
        list.extend(cns);

        let target =
            compute_target(&parent, self.view_store.as_ref(), self.ledger.as_ref()).unwrap();
        let mut view =
            View::new(*parent_id, height, target, parent.point_work, list).unwrap();
        view.header.time = parent.time + 1;

        let id = view.id().unwrap();
        assert!(view.check_pow(&id), "easy target must always be met");
        (id, view)
    }

    /// Extends the current tip with `count` viewpoint-only views for
    /// `vp_recipient`.
    pub async fn extend(&self, count: usize, vp_recipient: PublicKey) {
        for _ in 0..count {
            let (tip_id, _) = self.tip();
            let (id, view) = self.build_next(&tip_id, Vec::new(), vp_recipient);
            self.processor
                .process_view(id, view, "localhost")
                .await
                .expect("view connects");
        }
    }
}

/// A genesis view crediting `recipient`, timestamped `base_time`.
pub fn genesis_view(recipient: PublicKey, base_time: i64) -> View {
    let mut viewpoint = Consideration::new(None, recipient, 0, 0, 0, "hi");
    viewpoint.time = base_time;
    viewpoint.nonce = 0;
    let mut view = View::new(
        ViewID::default(),
        0,
        easy_target(),
        ViewID::default(),
        vec![viewpoint],
    )
    .unwrap();
    view.header.time = base_time;
    view.header.nonce = 0;
    view
}

/// Starts a full node stack (storage, ledger, queue, indexer, processor)
/// without connecting the genesis view.
pub async fn start_node(genesis_recipient: PublicKey, base_time: i64) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let view_store: Arc<dyn ViewStorage> = Arc::new(
        ViewStorageDisk::new(
            dir.path().join("views"),
            dir.path().join("headers"),
            false,
            false,
        )
        .unwrap(),
    );
    let graph = Arc::new(RwLock::new(Graph::new()));
    let ledger: Arc<dyn Ledger> = Arc::new(
        LedgerDisk::new(
            dir.path().join("ledger"),
            view_store.clone(),
            graph.clone(),
            false,
        )
        .unwrap(),
    );
    let cn_queue = Arc::new(ConsiderationQueueMemory::new(ledger.clone(), graph.clone()));

    let genesis = genesis_view(genesis_recipient, base_time);
    let genesis_id = genesis.id().unwrap();

    let indexer = Arc::new(Indexer::new(
        graph.clone(),
        view_store.clone(),
        ledger.clone(),
        genesis_id,
    ));

    let (processor, processor_handle) = Processor::spawn(
        genesis_id,
        view_store.clone(),
        cn_queue.clone(),
        ledger.clone(),
        Some(indexer),
    );

    Node {
        _dir: dir,
        view_store,
        ledger,
        cn_queue,
        graph,
        processor,
        processor_handle,
        genesis_id,
        genesis,
    }
}
