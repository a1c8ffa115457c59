//! Consensus constants.
//!
//! The first group comes straight from bitcoin and affects ledger consensus.
//! Changing any of them forks the ledger.

/// Number of views a viewpoint must wait before affecting its recipient's imbalance.
pub const VIEWPOINT_MATURITY: i64 = 100;

/// The initial (easiest allowed) proof-of-work target.
pub const INITIAL_TARGET: &str = "00000000ffff0000000000000000000000000000000000000000000000000000";

/// Maximum allowable clock skew for a view's timestamp. 2 hours.
pub const MAX_FUTURE_SECONDS: i64 = 2 * 60 * 60;

/// Legacy retarget interval. 2 weeks in views.
pub const RETARGET_INTERVAL: i64 = 2016;

/// Legacy retarget timespan. 2 weeks in seconds.
pub const RETARGET_TIME: i64 = 1_209_600;

/// Target view spacing. Every 10 minutes.
pub const TARGET_SPACING: i64 = 600;

/// Number of ancestors consulted for the median timestamp rule.
pub const NUM_VIEWS_FOR_MEDIAN_TIMESTAMP: usize = 11;

// the below value affects ledger consensus and comes from bitcoin cash

/// Simple-moving-average retarget window. 1 day in views.
pub const RETARGET_SMA_WINDOW: i64 = 144;

// the below values affect ledger consensus and are specific to this ledger

/// Initial limit on considerations per view. ~16.6 cn/sec, roughly 4 MB of JSON.
pub const INITIAL_MAX_CONSIDERATIONS_PER_VIEW: i64 = 10_000;

/// The per-view consideration limit doubles every 2 years in views.
pub const VIEWS_UNTIL_CONSIDERATIONS_PER_VIEW_DOUBLING: i64 = 105_000;

/// Hard cap on considerations per view.
pub const MAX_CONSIDERATIONS_PER_VIEW: i64 = (1 << 31) - 1;

/// Pre-calculated height at which the piecewise-linear growth hits the hard cap.
pub const MAX_CONSIDERATIONS_PER_VIEW_EXCEEDED_AT_HEIGHT: i64 = 1_852_032;

/// Series length. 1 week in views.
pub const VIEWS_UNTIL_NEW_SERIES: i64 = 1008;

/// Maximum memo length in bytes (valid UTF-8 only).
pub const MAX_MEMO_LENGTH: usize = 150;

/// Given the JSON protocol we respect Javascript's Number.MAX_SAFE_INTEGER.
pub const MAX_NUMBER: i64 = (1 << 53) - 1;

/// Height at which we switch from bitcoin's difficulty adjustment algorithm
/// to bitcoin cash's algorithm.
pub const BITCOIN_CASH_RETARGET_ALGORITHM_HEIGHT: i64 = 28_861;

// the below values only affect peering behavior and do not affect ledger consensus

pub const DEFAULT_FOCALPOINT_PORT: u16 = 8832;

pub const MAX_OUTBOUND_PEER_CONNECTIONS: usize = 8;

pub const MAX_INBOUND_PEER_CONNECTIONS: usize = 128;

/// If the tip is older than this we consider ourselves to still be syncing. 3 days.
pub const MAX_TIP_AGE: i64 = 24 * 3 * 60 * 60;

/// Maximum length of a protocol message. Does not apply to full views.
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 2 * 1024 * 1024;

// the below values are rendering policy and also do not affect ledger consensus

/// If changed this needs to be less than the consensus maximum at the current height.
pub const MAX_CONSIDERATIONS_TO_INCLUDE_PER_VIEW: usize = INITIAL_MAX_CONSIDERATIONS_PER_VIEW as usize;

pub const MAX_CONSIDERATION_QUEUE_LENGTH: usize = MAX_CONSIDERATIONS_TO_INCLUDE_PER_VIEW * 10;
