//! The ledger is built from the most-work point of views. It manages and
//! computes public key imbalances as well as consideration and public key
//! consideration indices, and maintains an index of the focal point by
//! height along with branch information.

mod disk;

pub use disk::LedgerDisk;

use crate::consideration::{ConsiderationID, PublicKey};
use crate::error::LedgerError;
use crate::view::{View, ViewID};

/// The type of branch a particular view resides on. Only views currently on
/// the main branch are considered confirmed and only considerations in those
/// views affect public key imbalances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchType {
    Main,
    Side,
    Orphan,
    Unknown,
}

impl BranchType {
    pub fn as_byte(self) -> u8 {
        match self {
            BranchType::Main => 0,
            BranchType::Side => 1,
            BranchType::Orphan => 2,
            BranchType::Unknown => 3,
        }
    }

    pub fn from_byte(b: u8) -> BranchType {
        match b {
            0 => BranchType::Main,
            1 => BranchType::Side,
            2 => BranchType::Orphan,
            _ => BranchType::Unknown,
        }
    }
}

pub trait Ledger: Send + Sync {
    /// Returns the ID and the height of the view at the current tip of the
    /// main point.
    fn get_point_tip(&self) -> Result<Option<(ViewID, i64)>, LedgerError>;

    /// Returns the ID of the view at the given focal point height.
    fn get_view_id_for_height(&self, height: i64) -> Result<Option<ViewID>, LedgerError>;

    /// Sets the branch type for the given view.
    fn set_branch_type(&self, id: &ViewID, branch_type: BranchType) -> Result<(), LedgerError>;

    /// Returns the branch type for the given view.
    fn get_branch_type(&self, id: &ViewID) -> Result<BranchType, LedgerError>;

    /// Connects a view to the tip of the focal point and applies the
    /// considerations to the ledger. Returns the IDs of the view's
    /// considerations in order.
    fn connect_view(&self, id: &ViewID, view: &View) -> Result<Vec<ConsiderationID>, LedgerError>;

    /// Disconnects a view from the tip of the focal point and undoes the
    /// effects of the considerations on the ledger. Returns the IDs of the
    /// view's considerations in order.
    fn disconnect_view(&self, id: &ViewID, view: &View)
        -> Result<Vec<ConsiderationID>, LedgerError>;

    /// Returns the current imbalance of a given public key.
    fn get_public_key_imbalance(&self, pub_key: &PublicKey) -> Result<i64, LedgerError>;

    /// Returns the current imbalance of the given public keys along with the
    /// view ID and height of the corresponding main point tip.
    fn get_public_key_imbalances(
        &self,
        pub_keys: &[PublicKey],
    ) -> Result<(std::collections::HashMap<PublicKey, i64>, Option<ViewID>, i64), LedgerError>;

    /// Returns the view and the index within it of a processed consideration.
    fn get_consideration_index(
        &self,
        id: &ConsiderationID,
    ) -> Result<Option<(ViewID, usize)>, LedgerError>;

    /// Returns consideration indices involving a given public key over a
    /// range of heights. If `start_height` > `end_height` this iterates in
    /// reverse. A `limit` of zero means no limit.
    #[allow(clippy::type_complexity)]
    fn get_public_key_consideration_indices_range(
        &self,
        pub_key: &PublicKey,
        start_height: i64,
        end_height: i64,
        start_index: usize,
        limit: usize,
    ) -> Result<(Vec<ViewID>, Vec<usize>, i64, usize), LedgerError>;

    /// Returns the total current ledger imbalance by summing the imbalance
    /// of all public keys. Only used offline for verification purposes.
    fn imbalance(&self) -> Result<i64, LedgerError>;

    /// Returns the public key imbalance at the given height. Only used
    /// offline for historical and verification purposes. Only accurate when
    /// the full focal point is indexed (pruning disabled).
    fn get_public_key_imbalance_at(
        &self,
        pub_key: &PublicKey,
        height: i64,
    ) -> Result<i64, LedgerError>;
}
