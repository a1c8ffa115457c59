//! On-disk ledger over a key-value store.
//!
//! Schema:
//!
//! ```text
//! T                    -> {vid}{height}        (main point tip)
//! B{vid}               -> main|side|orphan     (1 byte)
//! h{height}            -> {vid}
//! t{cnid}              -> {height}{index}      (prunable up to the previous series)
//! k{pk}{height}{index} -> 1
//! b{pk}                -> {imbalance}
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::consideration::{ConsiderationID, PublicKey};
use crate::constants::{VIEWPOINT_MATURITY, VIEWS_UNTIL_NEW_SERIES};
use crate::error::{LedgerError, StorageError};
use crate::graph::{graph_key, Graph};
use crate::imbalance_cache::ImbalanceCache;
use crate::ledger::{BranchType, Ledger};
use crate::view::{View, ViewID};
use crate::view_storage::ViewStorage;

const POINT_TIP_PREFIX: u8 = b'T';
const BRANCH_TYPE_PREFIX: u8 = b'B';
const VIEW_HEIGHT_INDEX_PREFIX: u8 = b'h';
const CONSIDERATION_INDEX_PREFIX: u8 = b't';
const PUB_KEY_CONSIDERATION_INDEX_PREFIX: u8 = b'k';
const PUB_KEY_IMBALANCE_PREFIX: u8 = b'b';

/// An on-disk implementation of the [`Ledger`] interface.
pub struct LedgerDisk {
    db: sled::Db,
    view_store: Arc<dyn ViewStorage>,
    con_graph: Arc<RwLock<Graph>>,
    /// Prune historic consideration and public key consideration indices.
    prune: bool,
}

impl LedgerDisk {
    pub fn new(
        db_path: impl AsRef<Path>,
        view_store: Arc<dyn ViewStorage>,
        con_graph: Arc<RwLock<Graph>>,
        prune: bool,
    ) -> Result<Self, LedgerError> {
        let db = sled::open(db_path).map_err(StorageError::from)?;
        Ok(LedgerDisk {
            db,
            view_store,
            con_graph,
            prune,
        })
    }

    /// Prune consideration and public key consideration indices created by
    /// the view at the given height.
    fn prune_indices(&self, height: i64, batch: &mut sled::Batch) -> Result<(), LedgerError> {
        let id = self
            .get_view_id_for_height(height)?
            .ok_or(LedgerError::MissingViewAtHeight(height))?;
        let view = self
            .view_store
            .get_view(&id)?
            .ok_or(LedgerError::MissingView(id))?;

        for (i, cn) in view.considerations.iter().enumerate() {
            let cn_id = cn.id()?;
            batch.remove(consideration_index_key(&cn_id));
            if let Some(by) = &cn.by {
                batch.remove(pub_key_consideration_index_key(by, Some(height), Some(i)));
            }
            batch.remove(pub_key_consideration_index_key(
                &cn.for_,
                Some(height),
                Some(i),
            ));
        }
        Ok(())
    }

    /// Restore consideration and public key consideration indices created by
    /// the view at the given height.
    fn restore_indices(&self, height: i64, batch: &mut sled::Batch) -> Result<(), LedgerError> {
        let id = self
            .get_view_id_for_height(height)?
            .ok_or(LedgerError::MissingViewAtHeight(height))?;
        let view = self
            .view_store
            .get_view(&id)?
            .ok_or(LedgerError::MissingView(id))?;

        for (i, cn) in view.considerations.iter().enumerate() {
            let cn_id = cn.id()?;
            batch.insert(
                consideration_index_key(&cn_id),
                encode_consideration_index(height, i),
            );
            if let Some(by) = &cn.by {
                batch.insert(
                    pub_key_consideration_index_key(by, Some(height), Some(i)),
                    &[0x1][..],
                );
            }
            batch.insert(
                pub_key_consideration_index_key(&cn.for_, Some(height), Some(i)),
                &[0x1][..],
            );
        }
        Ok(())
    }

    /// Resolve the consideration whose imbalance effect applies for the
    /// given one: a non-viewpoint applies directly; a viewpoint applies the
    /// viewpoint from `VIEWPOINT_MATURITY` views back, if any.
    ///
    /// Viewpoints are not applied until they're that many views deep: during
    /// honest reorgs normal considerations usually get into the new
    /// most-work branch but viewpoints vanish. Deferral softens the impact
    /// on considerations that depend on them.
    fn consideration_to_apply(
        &self,
        view: &View,
        cn: &crate::consideration::Consideration,
    ) -> Result<Option<crate::consideration::Consideration>, LedgerError> {
        if !cn.is_viewpoint() {
            return Ok(Some(cn.clone()));
        }
        let height = view.header.height;
        if height - VIEWPOINT_MATURITY < 0 {
            return Ok(None);
        }

        // mature the viewpoint from the view that many heights back now
        let old_id = self
            .get_view_id_for_height(height - VIEWPOINT_MATURITY)?
            .ok_or(LedgerError::MissingViewAtHeight(height - VIEWPOINT_MATURITY))?;
        let (old_viewpoint, _) = self
            .view_store
            .get_consideration(&old_id, 0)?
            .ok_or(LedgerError::MissingViewpoint(old_id))?;
        Ok(Some(old_viewpoint))
    }

    /// Queue the imbalance deltas accumulated by a (dis-)connection.
    fn write_imbalances(&self, cache: &ImbalanceCache, batch: &mut sled::Batch) {
        for (pub_key, imbalance) in cache.imbalances() {
            let key = pub_key_imbalance_key(pub_key);
            if *imbalance == 0 {
                batch.remove(key);
            } else {
                batch.insert(key, imbalance.to_be_bytes().to_vec());
            }
        }
    }
}

impl Ledger for LedgerDisk {
    fn get_point_tip(&self) -> Result<Option<(ViewID, i64)>, LedgerError> {
        match self.db.get([POINT_TIP_PREFIX]).map_err(StorageError::from)? {
            Some(bytes) => Ok(Some(decode_point_tip(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_view_id_for_height(&self, height: i64) -> Result<Option<ViewID>, LedgerError> {
        let key = view_height_index_key(height);
        match self.db.get(key).map_err(StorageError::from)? {
            Some(bytes) => {
                if bytes.len() != 32 {
                    return Err(StorageError::Corrupt("bad height index record".to_owned()).into());
                }
                let mut id = ViewID::default();
                id.0.copy_from_slice(&bytes);
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    fn set_branch_type(&self, id: &ViewID, branch_type: BranchType) -> Result<(), LedgerError> {
        self.db
            .insert(branch_type_key(id), vec![branch_type.as_byte()])
            .map_err(StorageError::from)?;
        self.db.flush().map_err(StorageError::from)?;
        Ok(())
    }

    fn get_branch_type(&self, id: &ViewID) -> Result<BranchType, LedgerError> {
        match self.db.get(branch_type_key(id)).map_err(StorageError::from)? {
            Some(bytes) if !bytes.is_empty() => Ok(BranchType::from_byte(bytes[0])),
            _ => Ok(BranchType::Unknown),
        }
    }

    fn connect_view(&self, id: &ViewID, view: &View) -> Result<Vec<ConsiderationID>, LedgerError> {
        // sanity check
        if let Some((tip_id, _)) = self.get_point_tip()? {
            if tip_id != view.header.previous {
                return Err(LedgerError::ConnectNotAtTip {
                    id: *id,
                    previous: view.header.previous,
                    tip: tip_id,
                });
            }
        }

        // apply all resulting writes atomically
        let mut batch = sled::Batch::default();
        let mut imbalance_cache = ImbalanceCache::new();
        let mut cn_ids = Vec::with_capacity(view.considerations.len());
        let height = view.header.height;

        for (i, cn) in view.considerations.iter().enumerate() {
            let cn_id = cn.id()?;
            cn_ids.push(cn_id);

            // verify the consideration hasn't been processed already.
            // indices for considerations older than the previous series may
            // have been pruned, which is safe given the series range check
            let key = consideration_index_key(&cn_id);
            if self.db.contains_key(&key).map_err(StorageError::from)? {
                return Err(LedgerError::AlreadyProcessed(cn_id));
            }
            batch.insert(key, encode_consideration_index(height, i));

            if let Some(cn_to_apply) = self.consideration_to_apply(view, cn)? {
                // check sender imbalance and update sender and recipient imbalances
                if !imbalance_cache.apply(self, &cn_to_apply)? {
                    return Err(LedgerError::InsufficientImbalance(cn_to_apply.id()?));
                }

                let graph = self.con_graph.read();
                if graph.is_parent_descendant(
                    &graph_key(Some(&cn_to_apply.for_)),
                    &graph_key(cn_to_apply.by.as_ref()),
                ) {
                    return Err(LedgerError::AncestorCycle(cn_to_apply.id()?));
                }
            }

            // associate this consideration with both parties
            if let Some(by) = &cn.by {
                batch.insert(
                    pub_key_consideration_index_key(by, Some(height), Some(i)),
                    &[0x1][..],
                );
            }
            batch.insert(
                pub_key_consideration_index_key(&cn.for_, Some(height), Some(i)),
                &[0x1][..],
            );
        }

        // update recorded imbalances
        self.write_imbalances(&imbalance_cache, &mut batch);

        // index the view by height
        batch.insert(view_height_index_key(height), id.as_bytes().to_vec());

        // set this view on the main point
        batch.insert(branch_type_key(id), &[BranchType::Main.as_byte()][..]);

        // set this view as the new tip
        batch.insert([POINT_TIP_PREFIX].to_vec(), encode_point_tip(id, height));

        // prune historic consideration and public key consideration indices now
        if self.prune && height >= 2 * VIEWS_UNTIL_NEW_SERIES {
            self.prune_indices(height - 2 * VIEWS_UNTIL_NEW_SERIES, &mut batch)?;
        }

        // perform the writes
        self.db.apply_batch(batch).map_err(StorageError::from)?;
        self.db.flush().map_err(StorageError::from)?;

        Ok(cn_ids)
    }

    fn disconnect_view(
        &self,
        id: &ViewID,
        view: &View,
    ) -> Result<Vec<ConsiderationID>, LedgerError> {
        // sanity check
        let (tip_id, _) = self
            .get_point_tip()?
            .ok_or(LedgerError::NoTipToDisconnect(*id))?;
        if tip_id != *id {
            return Err(LedgerError::DisconnectNotAtTip {
                id: *id,
                tip: tip_id,
            });
        }

        // apply all resulting writes atomically
        let mut batch = sled::Batch::default();
        let mut imbalance_cache = ImbalanceCache::new();
        let mut cn_ids = vec![ConsiderationID::default(); view.considerations.len()];
        let height = view.header.height;

        // disconnect considerations in reverse order
        for (i, cn) in view.considerations.iter().enumerate().rev() {
            let cn_id = cn.id()?;
            cn_ids[i] = cn_id;

            // mark the consideration unprocessed now
            batch.remove(consideration_index_key(&cn_id));

            if let Some(cn_to_undo) = self.consideration_to_apply(view, cn)? {
                // credit sender and debit recipient
                imbalance_cache.undo(self, &cn_to_undo)?;
            }

            // unassociate this consideration with both parties
            if let Some(by) = &cn.by {
                batch.remove(pub_key_consideration_index_key(by, Some(height), Some(i)));
            }
            batch.remove(pub_key_consideration_index_key(
                &cn.for_,
                Some(height),
                Some(i),
            ));
        }

        // update recorded imbalances
        self.write_imbalances(&imbalance_cache, &mut batch);

        // remove this view's index by height
        batch.remove(view_height_index_key(height));

        // set this view on a side point
        batch.insert(branch_type_key(id), &[BranchType::Side.as_byte()][..]);

        // set the previous view as the point tip
        batch.insert(
            [POINT_TIP_PREFIX].to_vec(),
            encode_point_tip(&view.header.previous, height - 1),
        );

        // restore historic indices now
        if self.prune && height >= 2 * VIEWS_UNTIL_NEW_SERIES {
            self.restore_indices(height - 2 * VIEWS_UNTIL_NEW_SERIES, &mut batch)?;
        }

        // perform the writes
        self.db.apply_batch(batch).map_err(StorageError::from)?;
        self.db.flush().map_err(StorageError::from)?;

        Ok(cn_ids)
    }

    fn get_public_key_imbalance(&self, pub_key: &PublicKey) -> Result<i64, LedgerError> {
        match self
            .db
            .get(pub_key_imbalance_key(pub_key))
            .map_err(StorageError::from)?
        {
            Some(bytes) => decode_i64(&bytes).map_err(Into::into),
            None => Ok(0),
        }
    }

    fn get_public_key_imbalances(
        &self,
        pub_keys: &[PublicKey],
    ) -> Result<(HashMap<PublicKey, i64>, Option<ViewID>, i64), LedgerError> {
        // reads are serialized behind the single writer, so tip and
        // imbalances observed here are mutually consistent
        let (tip_id, tip_height) = match self.get_point_tip()? {
            Some((id, height)) => (Some(id), height),
            None => (None, 0),
        };

        let mut imbalances = HashMap::with_capacity(pub_keys.len());
        for pub_key in pub_keys {
            imbalances.insert(*pub_key, self.get_public_key_imbalance(pub_key)?);
        }
        Ok((imbalances, tip_id, tip_height))
    }

    fn get_consideration_index(
        &self,
        id: &ConsiderationID,
    ) -> Result<Option<(ViewID, usize)>, LedgerError> {
        let bytes = match self
            .db
            .get(consideration_index_key(id))
            .map_err(StorageError::from)?
        {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let (height, index) = decode_consideration_index(&bytes)?;

        // map height to view id
        let view_id = self
            .get_view_id_for_height(height)?
            .ok_or(LedgerError::MissingViewAtHeight(height))?;
        Ok(Some((view_id, index)))
    }

    fn get_public_key_consideration_indices_range(
        &self,
        pub_key: &PublicKey,
        start_height: i64,
        end_height: i64,
        start_index: usize,
        limit: usize,
    ) -> Result<(Vec<ViewID>, Vec<usize>, i64, usize), LedgerError> {
        let reverse = end_height < start_height;
        let (range_start, range_end) = if reverse {
            // make the start index inclusive when iterating backwards
            (
                pub_key_consideration_index_key(pub_key, Some(end_height), None),
                pub_key_consideration_index_key(pub_key, Some(start_height), Some(start_index + 1)),
            )
        } else {
            (
                pub_key_consideration_index_key(pub_key, Some(start_height), Some(start_index)),
                // make the end height inclusive
                pub_key_consideration_index_key(pub_key, Some(end_height + 1), None),
            )
        };

        let mut ids = Vec::new();
        let mut indices = Vec::new();
        let mut last_height: i64 = 0;
        let mut last_index: usize = 0;
        let mut height_map: HashMap<i64, ViewID> = HashMap::new();

        let iter = self.db.range(range_start..range_end);
        let mut walk = |entry: Result<(sled::IVec, sled::IVec), sled::Error>| -> Result<bool, LedgerError> {
            let (key, _) = entry.map_err(StorageError::from)?;
            let (_, height, index) = decode_pub_key_consideration_index_key(&key)?;
            last_height = height;
            last_index = index;

            let id = match height_map.get(&height) {
                Some(id) => *id,
                None => {
                    let id = self
                        .get_view_id_for_height(height)?
                        .ok_or(LedgerError::MissingViewAtHeight(height))?;
                    height_map.insert(height, id);
                    id
                }
            };
            ids.push(id);
            indices.push(index);
            Ok(limit != 0 && indices.len() == limit)
        };

        if reverse {
            for entry in iter.rev() {
                if walk(entry)? {
                    break;
                }
            }
        } else {
            for entry in iter {
                if walk(entry)? {
                    break;
                }
            }
        }

        Ok((ids, indices, last_height, last_index))
    }

    fn imbalance(&self) -> Result<i64, LedgerError> {
        let mut total: i64 = 0;
        for entry in self.db.scan_prefix([PUB_KEY_IMBALANCE_PREFIX]) {
            let (_, value) = entry.map_err(StorageError::from)?;
            total += decode_i64(&value)?;
        }
        Ok(total)
    }

    fn get_public_key_imbalance_at(
        &self,
        pub_key: &PublicKey,
        height: i64,
    ) -> Result<i64, LedgerError> {
        let current_height = self.get_point_tip()?.map(|(_, h)| h).unwrap_or(0);

        let start_key = pub_key_consideration_index_key(pub_key, None, None);
        // make the height inclusive
        let end_key = pub_key_consideration_index_key(pub_key, Some(height + 1), None);

        let mut imbalance: i64 = 0;
        for entry in self.db.range(start_key..end_key) {
            let (key, _) = entry.map_err(StorageError::from)?;
            let (_, height, index) = decode_pub_key_consideration_index_key(&key)?;

            if index == 0 && height > current_height - VIEWPOINT_MATURITY {
                // viewpoint isn't mature
                continue;
            }

            let id = self
                .get_view_id_for_height(height)?
                .ok_or(LedgerError::MissingViewAtHeight(height))?;
            let (cn, _) = self
                .view_store
                .get_consideration(&id, index)?
                .ok_or(LedgerError::MissingView(id))?;

            if cn.for_ == *pub_key {
                imbalance += 1;
            } else if cn.by.as_ref() == Some(pub_key) {
                imbalance -= 1;
            } else {
                return Err(LedgerError::UnrelatedConsideration(cn.id()?));
            }
        }
        Ok(imbalance)
    }
}

fn branch_type_key(id: &ViewID) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32);
    key.push(BRANCH_TYPE_PREFIX);
    key.extend_from_slice(id.as_bytes());
    key
}

fn view_height_index_key(height: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 8);
    key.push(VIEW_HEIGHT_INDEX_PREFIX);
    key.extend_from_slice(&height.to_be_bytes());
    key
}

fn consideration_index_key(id: &ConsiderationID) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32);
    key.push(CONSIDERATION_INDEX_PREFIX);
    key.extend_from_slice(id.as_bytes());
    key
}

fn pub_key_consideration_index_key(
    pub_key: &PublicKey,
    height: Option<i64>,
    index: Option<usize>,
) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32 + 8 + 4);
    key.push(PUB_KEY_CONSIDERATION_INDEX_PREFIX);
    key.extend_from_slice(pub_key.as_bytes());
    if let Some(height) = height {
        key.extend_from_slice(&height.to_be_bytes());
        if let Some(index) = index {
            key.extend_from_slice(&(index as i32).to_be_bytes());
        }
    }
    key
}

fn decode_pub_key_consideration_index_key(
    key: &[u8],
) -> Result<(PublicKey, i64, usize), StorageError> {
    if key.len() != 1 + 32 + 8 + 4 {
        return Err(StorageError::Corrupt(
            "bad public key consideration index key".to_owned(),
        ));
    }
    let mut pub_key = PublicKey::default();
    pub_key.0.copy_from_slice(&key[1..33]);
    let mut height_bytes = [0u8; 8];
    height_bytes.copy_from_slice(&key[33..41]);
    let mut index_bytes = [0u8; 4];
    index_bytes.copy_from_slice(&key[41..45]);
    Ok((
        pub_key,
        i64::from_be_bytes(height_bytes),
        i32::from_be_bytes(index_bytes) as usize,
    ))
}

fn pub_key_imbalance_key(pub_key: &PublicKey) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + 32);
    key.push(PUB_KEY_IMBALANCE_PREFIX);
    key.extend_from_slice(pub_key.as_bytes());
    key
}

fn encode_point_tip(id: &ViewID, height: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + 8);
    buf.extend_from_slice(id.as_bytes());
    buf.extend_from_slice(&height.to_be_bytes());
    buf
}

fn decode_point_tip(bytes: &[u8]) -> Result<(ViewID, i64), StorageError> {
    if bytes.len() != 32 + 8 {
        return Err(StorageError::Corrupt("bad point tip record".to_owned()));
    }
    let mut id = ViewID::default();
    id.0.copy_from_slice(&bytes[..32]);
    let mut height_bytes = [0u8; 8];
    height_bytes.copy_from_slice(&bytes[32..]);
    Ok((id, i64::from_be_bytes(height_bytes)))
}

fn encode_consideration_index(height: i64, index: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + 4);
    buf.extend_from_slice(&height.to_be_bytes());
    buf.extend_from_slice(&(index as i32).to_be_bytes());
    buf
}

fn decode_consideration_index(bytes: &[u8]) -> Result<(i64, usize), StorageError> {
    if bytes.len() != 8 + 4 {
        return Err(StorageError::Corrupt(
            "bad consideration index record".to_owned(),
        ));
    }
    let mut height_bytes = [0u8; 8];
    height_bytes.copy_from_slice(&bytes[..8]);
    let mut index_bytes = [0u8; 4];
    index_bytes.copy_from_slice(&bytes[8..]);
    Ok((
        i64::from_be_bytes(height_bytes),
        i32::from_be_bytes(index_bytes) as usize,
    ))
}

fn decode_i64(bytes: &[u8]) -> Result<i64, StorageError> {
    if bytes.len() != 8 {
        return Err(StorageError::Corrupt("bad imbalance record".to_owned()));
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(i64::from_be_bytes(buf))
}
