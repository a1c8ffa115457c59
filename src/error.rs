//! Error taxonomy for the node.
//!
//! Validation errors never modify state. Ledger errors during a reorg trigger
//! a best-effort tip restoration in the processor. Invariant violations
//! (e.g. an undo driving a recipient negative) panic rather than persist
//! corruption.

use thiserror::Error;

use crate::consideration::ConsiderationID;
use crate::view::ViewID;

/// Errors from the underlying storage layers.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage: {0}")]
    Db(#[from] sled::Error),

    #[error("encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("view storage is in read-only mode")]
    ReadOnly,

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Errors from ledger state transitions and queries.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("being asked to connect {id} but previous {previous} does not match tip {tip}")]
    ConnectNotAtTip {
        id: ViewID,
        previous: ViewID,
        tip: ViewID,
    },

    #[error("being asked to disconnect {id} but it does not match tip {tip}")]
    DisconnectNotAtTip { id: ViewID, tip: ViewID },

    #[error("being asked to disconnect {0} but no tip is currently set")]
    NoTipToDisconnect(ViewID),

    #[error("consideration {0} already processed")]
    AlreadyProcessed(ConsiderationID),

    #[error("sender has insufficient imbalance in consideration {0}")]
    InsufficientImbalance(ConsiderationID),

    #[error("sender is a descendant of recipient in consideration {0}")]
    AncestorCycle(ConsiderationID),

    #[error("missing view at height {0}")]
    MissingViewAtHeight(i64),

    #[error("missing view {0}")]
    MissingView(ViewID),

    #[error("missing viewpoint in view {0}")]
    MissingViewpoint(ViewID),

    #[error("consideration {0} doesn't involve the public key")]
    UnrelatedConsideration(ConsiderationID),
}

/// Rejections of candidate considerations and views. None of these modify state.
#[derive(Error, Debug)]
pub enum ValidationError {
    // consideration, context-free
    #[error("invalid consideration time, consideration: {0}")]
    BadTime(ConsiderationID),

    #[error("negative nonce value, consideration: {0}")]
    BadNonce(ConsiderationID),

    #[error("viewpoint can't have a maturity, consideration: {0}")]
    ViewpointMaturity(ConsiderationID),

    #[error("viewpoint can't expire, consideration: {0}")]
    ViewpointExpiration(ConsiderationID),

    #[error("viewpoint can't have a signature, consideration: {0}")]
    ViewpointSignature(ConsiderationID),

    #[error("invalid consideration signature, consideration: {0}")]
    BadSignatureShape(ConsiderationID),

    #[error("consideration {0} to self is invalid")]
    ToSelf(ConsiderationID),

    #[error("consideration {0} memo length exceeded")]
    MemoTooLong(ConsiderationID),

    #[error("invalid maturity, consideration: {0}")]
    BadMaturity(ConsiderationID),

    #[error("invalid expiration, consideration: {0}")]
    BadExpiration(ConsiderationID),

    #[error("invalid series, consideration: {0}")]
    BadSeriesRange(ConsiderationID),

    // consideration, contextual
    #[error("signature verification failed, consideration: {0}")]
    BadSignature(ConsiderationID),

    #[error("consideration {0} would have invalid series")]
    BadSeries(ConsiderationID),

    #[error("consideration {0} is immature")]
    Immature(ConsiderationID),

    #[error("consideration {0} is expired")]
    Expired(ConsiderationID),

    #[error("consideration {0} is already confirmed")]
    AlreadyConfirmed(ConsiderationID),

    #[error("viewpoint consideration {0} only allowed in a view")]
    ViewpointOutsideView(ConsiderationID),

    #[error("sender in consideration {0} has insufficient imbalance")]
    InsufficientImbalance(ConsiderationID),

    #[error("sender is a descendant of recipient in consideration {0}")]
    AncestorCycle(ConsiderationID),

    #[error("no room for consideration {0}, queue is full")]
    QueueFull(ConsiderationID),

    // view
    #[error("time value is invalid, view {0}")]
    BadViewTime(ViewID),

    #[error("timestamp too far in the future for view {0}")]
    TimestampTooFarFuture(ViewID),

    #[error("timestamp is too early for view {0}")]
    TimestampTooEarly(ViewID),

    #[error("insufficient proof-of-work for view {0}")]
    InsufficientWork(ViewID),

    #[error("nonce value is invalid, view {0}")]
    BadViewNonce(ViewID),

    #[error("height value is invalid, view {0}")]
    BadHeight(ViewID),

    #[error("expected height {expected} found {found} for view {id}")]
    UnexpectedHeight { id: ViewID, expected: i64, found: i64 },

    #[error("checkpoint mismatch for view {0}")]
    CheckpointMismatch(ViewID),

    #[error("consideration count in header doesn't match view {0}")]
    BadConsiderationCount(ViewID),

    #[error("no considerations in view {0}")]
    EmptyView(ViewID),

    #[error("view {id} contains too many considerations {count}, max: {max}")]
    TooManyConsiderations { id: ViewID, count: usize, max: i64 },

    #[error("misplaced viewpoint consideration in view {0}")]
    BadViewpointPlacement(ViewID),

    #[error("duplicate consideration in view {0}")]
    DuplicateConsideration(ViewID),

    #[error("hash list root mismatch for view {0}")]
    BadHashListRoot(ViewID),

    #[error("incorrect target {found}, expected {expected} for view {id}")]
    BadTarget {
        id: ViewID,
        expected: ViewID,
        found: ViewID,
    },

    #[error("incorrect point work {found}, expected {expected} for view {id}")]
    BadPointWork {
        id: ViewID,
        expected: ViewID,
        found: ViewID,
    },
}

/// Everything the processor can surface to a caller.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Parent unknown. The view was not stored; the caller may re-request the parent.
    #[error("view {0} is an orphan")]
    Orphan(ViewID),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("missing header for view {0}")]
    MissingHeader(ViewID),

    #[error("missing view {0}")]
    MissingView(ViewID),

    #[error("no main point tip id found")]
    NoTip,

    #[error("processor is shutting down")]
    Shutdown,
}
