//! The processor validates and connects candidate views and considerations.
//!
//! All ledger-mutating work is serialized through one actor task: callers
//! submit over bounded channels and receive the result on a oneshot. The
//! bounded consideration channel doubles as the admission-control signal.
//! Subscribers register for new-consideration and tip-change notifications,
//! which are delivered in the order the actor performed each step.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use sha3::Sha3_256;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::checkpoints::{checkpoint_check, LATEST_CHECKPOINT_HEIGHT};
use crate::consideration::{
    check_consideration_series, in_number_range, now_unix, Consideration, ConsiderationID,
};
use crate::consideration_queue::ConsiderationQueue;
use crate::constants::{
    INITIAL_MAX_CONSIDERATIONS_PER_VIEW, MAX_CONSIDERATIONS_PER_VIEW,
    MAX_CONSIDERATIONS_PER_VIEW_EXCEEDED_AT_HEIGHT, MAX_CONSIDERATION_QUEUE_LENGTH,
    MAX_FUTURE_SECONDS, MAX_MEMO_LENGTH, MAX_NUMBER, MAX_TIP_AGE,
    VIEWS_UNTIL_CONSIDERATIONS_PER_VIEW_DOUBLING,
};
use crate::error::{ProcessError, ValidationError};
use crate::indexer::Indexer;
use crate::ledger::{BranchType, Ledger};
use crate::retarget::{compute_median_timestamp, compute_target};
use crate::view::{compute_hash_list_root, compute_point_work, View, ViewHeader, ViewID};
use crate::view_storage::ViewStorage;

/// Sent to registered channels when a consideration is queued.
#[derive(Clone)]
pub struct NewTx {
    pub consideration_id: ConsiderationID,
    pub consideration: Consideration,
    /// Who sent it.
    pub source: String,
}

/// Sent to registered channels on each main point tip (dis-)connection.
#[derive(Clone)]
pub struct TipChange {
    pub view_id: ViewID,
    pub view: Arc<View>,
    /// Who sent the view that caused this change.
    pub source: String,
    /// True if the tip has been connected, false for disconnected.
    pub connect: bool,
    /// True if the tip has been connected and more connections are expected.
    pub more: bool,
}

enum Command {
    Consideration {
        id: ConsiderationID,
        cn: Consideration,
        source: String,
        result: oneshot::Sender<Result<(), ProcessError>>,
    },
    View {
        id: ViewID,
        view: View,
        source: String,
        result: oneshot::Sender<Result<(), ProcessError>>,
    },
    RegisterNewTx {
        result: oneshot::Sender<(u64, mpsc::UnboundedReceiver<NewTx>)>,
    },
    UnregisterNewTx(u64),
    RegisterTipChange {
        result: oneshot::Sender<(u64, mpsc::UnboundedReceiver<TipChange>)>,
    },
    UnregisterTipChange(u64),
    Shutdown,
}

/// Handle to the processor actor. Cheap to clone; all clones feed the same
/// single-writer task.
#[derive(Clone)]
pub struct Processor {
    cn_tx: mpsc::Sender<Command>,
    view_tx: mpsc::Sender<Command>,
    ctl_tx: mpsc::UnboundedSender<Command>,
}

struct ProcessorState {
    genesis_id: ViewID,
    view_store: Arc<dyn ViewStorage>,
    cn_queue: Arc<dyn ConsiderationQueue>,
    ledger: Arc<dyn Ledger>,
    indexer: Option<Arc<Indexer>>,
    new_tx_subs: HashMap<u64, mpsc::UnboundedSender<NewTx>>,
    tip_subs: HashMap<u64, mpsc::UnboundedSender<TipChange>>,
    next_sub: u64,
}

impl Processor {
    /// Spawns the processor actor. The indexer, when present, is driven
    /// synchronously from inside the commit path so graph updates are
    /// visible before the next view connects.
    pub fn spawn(
        genesis_id: ViewID,
        view_store: Arc<dyn ViewStorage>,
        cn_queue: Arc<dyn ConsiderationQueue>,
        ledger: Arc<dyn Ledger>,
        indexer: Option<Arc<Indexer>>,
    ) -> (Processor, JoinHandle<()>) {
        let (cn_tx, mut cn_rx) = mpsc::channel(100);
        let (view_tx, mut view_rx) = mpsc::channel(10);
        let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel();

        let mut state = ProcessorState {
            genesis_id,
            view_store,
            cn_queue,
            ledger,
            indexer,
            new_tx_subs: HashMap::new(),
            tip_subs: HashMap::new(),
            next_sub: 0,
        };

        let handle = tokio::spawn(async move {
            loop {
                let cmd = tokio::select! {
                    Some(cmd) = cn_rx.recv() => cmd,
                    Some(cmd) = view_rx.recv() => cmd,
                    Some(cmd) = ctl_rx.recv() => cmd,
                    else => break,
                };
                if state.handle(cmd) {
                    info!("processor shutting down");
                    break;
                }
            }
        });

        (
            Processor {
                cn_tx,
                view_tx,
                ctl_tx,
            },
            handle,
        )
    }

    /// Processes a new candidate consideration for the consideration queue.
    pub async fn process_consideration(
        &self,
        id: ConsiderationID,
        cn: Consideration,
        source: &str,
    ) -> Result<(), ProcessError> {
        let (result, rx) = oneshot::channel();
        self.cn_tx
            .send(Command::Consideration {
                id,
                cn,
                source: source.to_owned(),
                result,
            })
            .await
            .map_err(|_| ProcessError::Shutdown)?;
        rx.await.map_err(|_| ProcessError::Shutdown)?
    }

    /// Blocking flavor of [`Self::process_consideration`] for worker threads.
    pub fn process_consideration_blocking(
        &self,
        id: ConsiderationID,
        cn: Consideration,
        source: &str,
    ) -> Result<(), ProcessError> {
        let (result, rx) = oneshot::channel();
        self.cn_tx
            .blocking_send(Command::Consideration {
                id,
                cn,
                source: source.to_owned(),
                result,
            })
            .map_err(|_| ProcessError::Shutdown)?;
        rx.blocking_recv().map_err(|_| ProcessError::Shutdown)?
    }

    /// Processes a new candidate focal point tip.
    pub async fn process_view(
        &self,
        id: ViewID,
        view: View,
        source: &str,
    ) -> Result<(), ProcessError> {
        let (result, rx) = oneshot::channel();
        self.view_tx
            .send(Command::View {
                id,
                view,
                source: source.to_owned(),
                result,
            })
            .await
            .map_err(|_| ProcessError::Shutdown)?;
        rx.await.map_err(|_| ProcessError::Shutdown)?
    }

    /// Blocking flavor of [`Self::process_view`] for worker threads.
    pub fn process_view_blocking(
        &self,
        id: ViewID,
        view: View,
        source: &str,
    ) -> Result<(), ProcessError> {
        let (result, rx) = oneshot::channel();
        self.view_tx
            .blocking_send(Command::View {
                id,
                view,
                source: source.to_owned(),
                result,
            })
            .map_err(|_| ProcessError::Shutdown)?;
        rx.blocking_recv().map_err(|_| ProcessError::Shutdown)?
    }

    /// Registers to receive notifications of newly queued considerations.
    pub async fn register_for_new_considerations(
        &self,
    ) -> Result<(u64, mpsc::UnboundedReceiver<NewTx>), ProcessError> {
        let (result, rx) = oneshot::channel();
        self.ctl_tx
            .send(Command::RegisterNewTx { result })
            .map_err(|_| ProcessError::Shutdown)?;
        rx.await.map_err(|_| ProcessError::Shutdown)
    }

    /// Blocking flavor of [`Self::register_for_new_considerations`].
    pub fn register_for_new_considerations_blocking(
        &self,
    ) -> Result<(u64, mpsc::UnboundedReceiver<NewTx>), ProcessError> {
        let (result, rx) = oneshot::channel();
        self.ctl_tx
            .send(Command::RegisterNewTx { result })
            .map_err(|_| ProcessError::Shutdown)?;
        rx.blocking_recv().map_err(|_| ProcessError::Shutdown)
    }

    pub fn unregister_for_new_considerations(&self, sub: u64) {
        let _ = self.ctl_tx.send(Command::UnregisterNewTx(sub));
    }

    /// Registers to receive notifications of tip view changes.
    pub async fn register_for_tip_changes(
        &self,
    ) -> Result<(u64, mpsc::UnboundedReceiver<TipChange>), ProcessError> {
        let (result, rx) = oneshot::channel();
        self.ctl_tx
            .send(Command::RegisterTipChange { result })
            .map_err(|_| ProcessError::Shutdown)?;
        rx.await.map_err(|_| ProcessError::Shutdown)
    }

    /// Blocking flavor of [`Self::register_for_tip_changes`].
    pub fn register_for_tip_changes_blocking(
        &self,
    ) -> Result<(u64, mpsc::UnboundedReceiver<TipChange>), ProcessError> {
        let (result, rx) = oneshot::channel();
        self.ctl_tx
            .send(Command::RegisterTipChange { result })
            .map_err(|_| ProcessError::Shutdown)?;
        rx.blocking_recv().map_err(|_| ProcessError::Shutdown)
    }

    pub fn unregister_for_tip_changes(&self, sub: u64) {
        let _ = self.ctl_tx.send(Command::UnregisterTipChange(sub));
    }

    /// Stops the actor. Await the join handle returned by [`Self::spawn`]
    /// to synchronize with its exit.
    pub fn shutdown(&self) {
        let _ = self.ctl_tx.send(Command::Shutdown);
    }
}

impl ProcessorState {
    /// Returns true when the actor should exit.
    fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Consideration {
                id,
                cn,
                source,
                result,
            } => {
                let outcome = self.process_consideration(id, cn, source);
                if let Err(err) = &outcome {
                    info!(consideration_id = %id, error = %err, "rejected consideration");
                }
                let _ = result.send(outcome);
            }
            Command::View {
                id,
                view,
                source,
                result,
            } => {
                let before = Instant::now();
                let considerations = view.considerations.len();
                let outcome = self.process_view(id, view, source);
                if let Err(err) = &outcome {
                    info!(view_id = %id, error = %err, "rejected view");
                }
                debug!(
                    elapsed_ms = before.elapsed().as_millis() as u64,
                    considerations,
                    queue_length = self.cn_queue.len(),
                    "processed view"
                );
                let _ = result.send(outcome);
            }
            Command::RegisterNewTx { result } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let sub = self.next_sub;
                self.next_sub += 1;
                self.new_tx_subs.insert(sub, tx);
                let _ = result.send((sub, rx));
            }
            Command::UnregisterNewTx(sub) => {
                self.new_tx_subs.remove(&sub);
            }
            Command::RegisterTipChange { result } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let sub = self.next_sub;
                self.next_sub += 1;
                self.tip_subs.insert(sub, tx);
                let _ = result.send((sub, rx));
            }
            Command::UnregisterTipChange(sub) => {
                self.tip_subs.remove(&sub);
            }
            Command::Shutdown => return true,
        }
        false
    }

    fn notify_new_tx(&mut self, msg: NewTx) {
        self.new_tx_subs.retain(|_, tx| tx.send(msg.clone()).is_ok());
    }

    fn notify_tip_change(&mut self, msg: TipChange) {
        self.tip_subs.retain(|_, tx| tx.send(msg.clone()).is_ok());
    }

    /// Process a consideration.
    fn process_consideration(
        &mut self,
        id: ConsiderationID,
        cn: Consideration,
        source: String,
    ) -> Result<(), ProcessError> {
        debug!(consideration_id = %id, %source, "processing consideration");

        // context-free checks
        check_consideration(&id, &cn)?;

        // no loose viewpoints
        if cn.is_viewpoint() {
            return Err(ValidationError::ViewpointOutsideView(id).into());
        }

        // is the queue full?
        if self.cn_queue.len() >= MAX_CONSIDERATION_QUEUE_LENGTH {
            return Err(ValidationError::QueueFull(id).into());
        }

        // is it confirmed already?
        if self.ledger.get_consideration_index(&id)?.is_some() {
            return Err(ValidationError::AlreadyConfirmed(id).into());
        }

        // check series, maturity and expiration against the next height
        let (_, tip_height) = self.ledger.get_point_tip()?.ok_or(ProcessError::NoTip)?;
        if !check_consideration_series(&cn, tip_height + 1) {
            return Err(ValidationError::BadSeries(id).into());
        }
        if !cn.is_mature(tip_height + 1) {
            return Err(ValidationError::Immature(id).into());
        }
        if cn.is_expired(tip_height + 1) {
            return Err(ValidationError::Expired(id).into());
        }

        // verify signature
        if !cn.verify()? {
            return Err(ValidationError::BadSignature(id).into());
        }

        // the queue enforces imbalance and graph ancestry
        if !self.cn_queue.add(&id, &cn)? {
            // don't notify if it already exists in the queue
            return Ok(());
        }

        self.notify_new_tx(NewTx {
            consideration_id: id,
            consideration: cn,
            source,
        });
        Ok(())
    }

    /// Process a view.
    fn process_view(
        &mut self,
        id: ViewID,
        view: View,
        source: String,
    ) -> Result<(), ProcessError> {
        debug!(view_id = %id, %source, "processing view");
        let now = now_unix();

        // did we process this view already?
        if self.ledger.get_branch_type(&id)? != BranchType::Unknown {
            info!(view_id = %id, "already processed view");
            return Ok(());
        }

        // sanity check the view
        check_view(&id, &view, now)?;

        // have we processed its parent?
        let parent_branch = self.ledger.get_branch_type(&view.header.previous)?;
        if parent_branch != BranchType::Main && parent_branch != BranchType::Side {
            if id == self.genesis_id {
                // store it and begin the ledger
                self.view_store.store(&id, &view, now)?;
                self.connect_view(id, Arc::new(view), &source, false)?;
                info!(view_id = %id, "connected genesis view");
                return Ok(());
            }
            // current view is an orphan
            return Err(ProcessError::Orphan(id));
        }

        // attempt to extend the point
        self.accept_view(id, Arc::new(view), now, &source)
    }

    /// Attempt to extend the point with the new view.
    fn accept_view(
        &mut self,
        id: ViewID,
        view: Arc<View>,
        now: i64,
        source: &str,
    ) -> Result<(), ProcessError> {
        let previous = view.header.previous;
        let prev_header = self
            .view_store
            .get_view_header(&previous)?
            .ok_or(ProcessError::MissingHeader(previous))?
            .0;

        // check height
        let new_height = prev_header.height + 1;
        if view.header.height != new_height {
            return Err(ValidationError::UnexpectedHeight {
                id,
                expected: new_height,
                found: view.header.height,
            }
            .into());
        }

        // check declared proof-of-work target is correct
        let target = compute_target(&prev_header, self.view_store.as_ref(), self.ledger.as_ref())?;
        if view.header.target != target {
            return Err(ValidationError::BadTarget {
                id,
                expected: target,
                found: view.header.target,
            }
            .into());
        }

        // check that cumulative work is correct
        let point_work = compute_point_work(&view.header.target, &prev_header.point_work);
        if view.header.point_work != point_work {
            return Err(ValidationError::BadPointWork {
                id,
                expected: point_work,
                found: view.header.point_work,
            }
            .into());
        }

        // check that the timestamp isn't too far in the past
        let median_timestamp = compute_median_timestamp(&prev_header, self.view_store.as_ref())?;
        if view.header.time <= median_timestamp {
            return Err(ValidationError::TimestampTooEarly(id).into());
        }

        // check series, maturity, expiration then verify signatures
        for cn in &view.considerations {
            let cn_id = cn.id()?;
            if !check_consideration_series(cn, view.header.height) {
                return Err(ValidationError::BadSeries(cn_id).into());
            }
            if !cn.is_viewpoint() {
                if !cn.is_mature(view.header.height) {
                    return Err(ValidationError::Immature(cn_id).into());
                }
                if cn.is_expired(view.header.height) {
                    return Err(ValidationError::Expired(cn_id).into());
                }
                // if it's in the queue with the same signature we've
                // verified it already
                let verified_in_queue = match &cn.signature {
                    Some(sig) => self.cn_queue.exists_signed(&cn_id, sig),
                    None => false,
                };
                if !verified_in_queue && !cn.verify()? {
                    return Err(ValidationError::BadSignature(cn_id).into());
                }
            }
        }

        // store the view if we think we're going to accept it
        self.view_store.store(&id, &view, now)?;

        // get the current tip before we try adjusting the point
        let (tip_id, _) = self.ledger.get_point_tip()?.ok_or(ProcessError::NoTip)?;

        // finish accepting the view if possible
        if let Err(err) = self.accept_view_continue(id, view, now, prev_header, source) {
            // we may have disconnected the old best point and partially
            // connected the new one before encountering a problem.
            // re-activate it now
            if let Err(err2) = self.reconnect_tip(&tip_id, source) {
                error!(view_id = %tip_id, error = %err2, "error reconnecting tip");
            }
            // return the original error
            return Err(err);
        }

        Ok(())
    }

    /// Continue accepting the view: fork choice and the reorganization walk.
    fn accept_view_continue(
        &mut self,
        id: ViewID,
        view: Arc<View>,
        view_when: i64,
        prev_header: ViewHeader,
        source: &str,
    ) -> Result<(), ProcessError> {
        // get the current tip
        let (tip_id, tip_header, tip_when) =
            get_point_tip_header(self.ledger.as_ref(), self.view_store.as_ref())?
                .ok_or(ProcessError::NoTip)?;
        if id == tip_id {
            // can happen if we failed connecting a new view
            return Ok(());
        }

        // is this view better than the current tip?
        if !view.header.compare(&tip_header, view_when, tip_when) {
            // flag this as a side branch view
            info!(view_id = %id, "view does not represent the tip of the best point");
            return self
                .ledger
                .set_branch_type(&id, BranchType::Side)
                .map_err(Into::into);
        }

        // the new view is the better point
        let mut tip_ancestor = tip_header;
        let mut new_ancestor = prev_header;
        let min_height = tip_ancestor.height.min(new_ancestor.height);

        let mut views_to_disconnect: Vec<ViewID> = Vec::new();
        let mut views_to_connect: VecDeque<ViewID> = VecDeque::new();

        // walk back the current tip's point to the common height
        let mut tip_ancestor_id = tip_id;
        while tip_ancestor.height > min_height {
            views_to_disconnect.push(tip_ancestor_id);
            tip_ancestor_id = tip_ancestor.previous;
            tip_ancestor = self
                .view_store
                .get_view_header(&tip_ancestor_id)?
                .ok_or(ProcessError::MissingHeader(tip_ancestor_id))?
                .0;
        }

        // walk back the new point to the common height
        let mut new_ancestor_id = view.header.previous;
        while new_ancestor.height > min_height {
            views_to_connect.push_front(new_ancestor_id);
            new_ancestor_id = new_ancestor.previous;
            new_ancestor = self
                .view_store
                .get_view_header(&new_ancestor_id)?
                .ok_or(ProcessError::MissingHeader(new_ancestor_id))?
                .0;
        }

        // scan both points in lockstep until we're at the common ancestor
        while new_ancestor != tip_ancestor {
            views_to_disconnect.push(tip_ancestor_id);
            views_to_connect.push_front(new_ancestor_id);

            tip_ancestor_id = tip_ancestor.previous;
            tip_ancestor = self
                .view_store
                .get_view_header(&tip_ancestor_id)?
                .ok_or(ProcessError::MissingHeader(tip_ancestor_id))?
                .0;
            new_ancestor_id = new_ancestor.previous;
            new_ancestor = self
                .view_store
                .get_view_header(&new_ancestor_id)?
                .ok_or(ProcessError::MissingHeader(new_ancestor_id))?
                .0;
        }

        // we're at the common ancestor. disconnect the main point views
        for disconnect_id in views_to_disconnect {
            let view_to_disconnect = self
                .view_store
                .get_view(&disconnect_id)?
                .ok_or(ProcessError::MissingView(disconnect_id))?;
            self.disconnect_view(disconnect_id, Arc::new(view_to_disconnect), source)?;
        }

        // connect the new point views
        for connect_id in views_to_connect {
            let view_to_connect = self
                .view_store
                .get_view(&connect_id)?
                .ok_or(ProcessError::MissingView(connect_id))?;
            self.connect_view(connect_id, Arc::new(view_to_connect), source, true)?;
        }

        // and finally connect the new view
        self.connect_view(id, view, source, false)
    }

    /// Update the ledger and consideration queue and notify tip channels of
    /// a connection.
    fn connect_view(
        &mut self,
        id: ViewID,
        view: Arc<View>,
        source: &str,
        more: bool,
    ) -> Result<(), ProcessError> {
        let cn_ids = self.ledger.connect_view(&id, &view)?;

        info!(view_id = %id, height = view.header.height, "view is the new tip");

        // remove newly confirmed non-viewpoint considerations from the queue
        self.cn_queue
            .remove_batch(&cn_ids[1..], view.header.height, more)?;

        // fold the view into the graph before anything else can connect
        if let Some(indexer) = &self.indexer {
            indexer.index_view(&view, &id, true);
            if !more {
                indexer.rank();
            }
        }

        self.notify_tip_change(TipChange {
            view_id: id,
            view,
            source: source.to_owned(),
            connect: true,
            more,
        });
        Ok(())
    }

    /// Update the ledger and consideration queue and notify tip channels of
    /// a disconnection.
    fn disconnect_view(
        &mut self,
        id: ViewID,
        view: Arc<View>,
        source: &str,
    ) -> Result<(), ProcessError> {
        let cn_ids = self.ledger.disconnect_view(&id, &view)?;

        info!(view_id = %id, height = view.header.height, "view has been disconnected");

        // add newly disconnected non-viewpoint considerations back to the
        // front of the queue
        self.cn_queue.add_batch(
            &cn_ids[1..],
            &view.considerations[1..],
            view.header.height - 1,
        );

        // reverse the view's edges before anything else can connect
        if let Some(indexer) = &self.indexer {
            indexer.index_view(&view, &id, false);
            indexer.rank();
        }

        self.notify_tip_change(TipChange {
            view_id: id,
            view,
            source: source.to_owned(),
            connect: false,
            more: false,
        });
        Ok(())
    }

    /// Try to reconnect the previous tip view when accepting a new view
    /// fails partway through its reorganization.
    fn reconnect_tip(&mut self, id: &ViewID, source: &str) -> Result<(), ProcessError> {
        let view = self
            .view_store
            .get_view(id)?
            .ok_or(ProcessError::MissingView(*id))?;
        let (_, when) = self
            .view_store
            .get_view_header(id)?
            .ok_or(ProcessError::MissingHeader(*id))?;
        let previous = view.header.previous;
        let prev_header = self
            .view_store
            .get_view_header(&previous)?
            .ok_or(ProcessError::MissingHeader(previous))?
            .0;
        self.accept_view_continue(*id, Arc::new(view), when, prev_header, source)
    }
}

/// Context-free consideration sanity checks.
pub fn check_consideration(
    id: &ConsiderationID,
    cn: &Consideration,
) -> Result<(), ValidationError> {
    // sane-ish time. consideration timestamps are strictly for user and
    // application usage; nothing in consensus relies on them
    if !in_number_range(cn.time) {
        return Err(ValidationError::BadTime(*id));
    }

    // no negative nonces
    if cn.nonce < 0 {
        return Err(ValidationError::BadNonce(*id));
    }

    if cn.is_viewpoint() {
        if cn.matures > 0 {
            return Err(ValidationError::ViewpointMaturity(*id));
        }
        if cn.expires > 0 {
            return Err(ValidationError::ViewpointExpiration(*id));
        }
        if cn.signature.is_some() {
            return Err(ValidationError::ViewpointSignature(*id));
        }
    } else {
        // sanity check the signature shape
        match &cn.signature {
            Some(sig) if sig.0.len() == ed25519_dalek::SIGNATURE_LENGTH => {}
            _ => return Err(ValidationError::BadSignatureShape(*id)),
        }
    }

    // no pays to self
    if cn.by.as_ref() == Some(&cn.for_) {
        return Err(ValidationError::ToSelf(*id));
    }

    // check memo length. the memo is structurally valid UTF-8
    if cn.memo.len() > MAX_MEMO_LENGTH {
        return Err(ValidationError::MemoTooLong(*id));
    }

    // sanity check maturity, expiration and series
    if !in_number_range(cn.matures) {
        return Err(ValidationError::BadMaturity(*id));
    }
    if !in_number_range(cn.expires) {
        return Err(ValidationError::BadExpiration(*id));
    }
    if cn.series <= 0 || cn.series > MAX_NUMBER {
        return Err(ValidationError::BadSeriesRange(*id));
    }

    Ok(())
}

/// Context-free view sanity checks.
pub fn check_view(id: &ViewID, view: &View, now: i64) -> Result<(), ProcessError> {
    // sanity check time
    if !in_number_range(view.header.time) {
        return Err(ValidationError::BadViewTime(*id).into());
    }

    // check the timestamp isn't too far in the future
    if view.header.time > now + MAX_FUTURE_SECONDS {
        return Err(ValidationError::TimestampTooFarFuture(*id).into());
    }

    // proof-of-work should satisfy the declared target
    if !view.check_pow(id) {
        return Err(ValidationError::InsufficientWork(*id).into());
    }

    // sanity check nonce and height
    if !in_number_range(view.header.nonce) {
        return Err(ValidationError::BadViewNonce(*id).into());
    }
    if !in_number_range(view.header.height) {
        return Err(ValidationError::BadHeight(*id).into());
    }

    // check against known checkpoints
    checkpoint_check(id, view.header.height)?;

    // sanity check the consideration count
    if view.header.consideration_count < 0 {
        return Err(ValidationError::BadConsiderationCount(*id).into());
    }
    if view.header.consideration_count as usize != view.considerations.len() {
        return Err(ValidationError::BadConsiderationCount(*id).into());
    }

    // must have at least one consideration
    if view.considerations.is_empty() {
        return Err(ValidationError::EmptyView(*id).into());
    }

    // the first consideration must be a viewpoint
    if !view.considerations[0].is_viewpoint() {
        return Err(ValidationError::BadViewpointPlacement(*id).into());
    }

    // check the max number of considerations
    let max = compute_max_considerations_per_view(view.header.height);
    if view.considerations.len() as i64 > max {
        return Err(ValidationError::TooManyConsiderations {
            id: *id,
            count: view.considerations.len(),
            max,
        }
        .into());
    }

    // the rest must not be viewpoints
    if view.considerations[1..].iter().any(|cn| cn.is_viewpoint()) {
        return Err(ValidationError::BadViewpointPlacement(*id).into());
    }

    // context-free checks and duplicate detection
    let mut cn_ids = HashSet::with_capacity(view.considerations.len());
    for cn in &view.considerations {
        let cn_id = cn.id()?;
        check_consideration(&cn_id, cn)?;
        cn_ids.insert(cn_id);
    }
    if cn_ids.len() != view.considerations.len() {
        return Err(ValidationError::DuplicateConsideration(*id).into());
    }

    // verify the hash list root
    let mut hasher = Sha3_256::default();
    let hash_list_root = compute_hash_list_root(&mut hasher, &view.considerations)?;
    if hash_list_root != view.header.hash_list_root {
        return Err(ValidationError::BadHashListRoot(*id).into());
    }

    Ok(())
}

/// The maximum number of considerations allowed in a view at the given
/// height: piecewise-linear growth between doublings until the hard cap.
pub fn compute_max_considerations_per_view(height: i64) -> i64 {
    if height >= MAX_CONSIDERATIONS_PER_VIEW_EXCEEDED_AT_HEIGHT {
        return MAX_CONSIDERATIONS_PER_VIEW;
    }

    let doublings = height / VIEWS_UNTIL_CONSIDERATIONS_PER_VIEW_DOUBLING;
    let remainder = height % VIEWS_UNTIL_CONSIDERATIONS_PER_VIEW_DOUBLING;
    let factor = 1i64 << doublings;
    let interpolate = (INITIAL_MAX_CONSIDERATIONS_PER_VIEW * factor * remainder)
        / VIEWS_UNTIL_CONSIDERATIONS_PER_VIEW_DOUBLING;
    INITIAL_MAX_CONSIDERATIONS_PER_VIEW * factor + interpolate
}

/// The current main point's tip ID, header and store timestamp.
pub fn get_point_tip_header(
    ledger: &dyn Ledger,
    view_store: &dyn ViewStorage,
) -> Result<Option<(ViewID, ViewHeader, i64)>, ProcessError> {
    let (tip_id, _) = match ledger.get_point_tip()? {
        Some(tip) => tip,
        None => return Ok(None),
    };
    let (tip_header, tip_when) = view_store
        .get_view_header(&tip_id)?
        .ok_or(ProcessError::MissingHeader(tip_id))?;
    Ok(Some((tip_id, tip_header, tip_when)))
}

/// True while the tip looks too old (or absent) for us to usefully render
/// or index. Returns the current tip height alongside.
pub fn is_initial_view_download(
    ledger: &dyn Ledger,
    view_store: &dyn ViewStorage,
) -> Result<(bool, i64), ProcessError> {
    match get_point_tip_header(ledger, view_store)? {
        None => Ok((true, 0)),
        Some((_, header, _)) => {
            let ibd = header.height < *LATEST_CHECKPOINT_HEIGHT
                || header.time < now_unix() - MAX_TIP_AGE;
            Ok((ibd, header.height))
        }
    }
}
