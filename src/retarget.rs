//! Difficulty retargeting. Two algorithms, switched by height: the legacy
//! 2016-view interval adjustment below the switch height, and a per-view
//! 144-view simple-moving-average adjustment at and above it.

use num_bigint::BigUint;

use crate::constants::{
    BITCOIN_CASH_RETARGET_ALGORITHM_HEIGHT, INITIAL_TARGET, NUM_VIEWS_FOR_MEDIAN_TIMESTAMP,
    RETARGET_INTERVAL, RETARGET_SMA_WINDOW, RETARGET_TIME, TARGET_SPACING,
};
use crate::error::{LedgerError, ProcessError};
use crate::ledger::Ledger;
use crate::view::{ViewHeader, ViewID};
use crate::view_storage::ViewStorage;

/// Compute the expected target of the view following `prev_header`.
pub fn compute_target(
    prev_header: &ViewHeader,
    view_store: &dyn ViewStorage,
    ledger: &dyn Ledger,
) -> Result<ViewID, ProcessError> {
    if prev_header.height >= BITCOIN_CASH_RETARGET_ALGORITHM_HEIGHT {
        return compute_target_sma_window(prev_header, view_store, ledger);
    }
    compute_target_legacy(prev_header, view_store)
}

/// Original interval-based target computation. Retargets on every 2016th
/// view by the ratio of the actual interval timespan to the expected one,
/// clamped to a factor of 4 either way.
fn compute_target_legacy(
    prev_header: &ViewHeader,
    view_store: &dyn ViewStorage,
) -> Result<ViewID, ProcessError> {
    if (prev_header.height + 1) % RETARGET_INTERVAL != 0 {
        // not a retarget view, keep the previous target
        return Ok(prev_header.target);
    }

    // defend against time warp: the very first retarget walks back one view
    // fewer than all subsequent ones
    let views_to_go_back = if prev_header.height + 1 == RETARGET_INTERVAL {
        RETARGET_INTERVAL - 1
    } else {
        RETARGET_INTERVAL
    };

    // walk back to the first view of the interval
    let mut first_header = prev_header.clone();
    for _ in 0..views_to_go_back {
        let previous = first_header.previous;
        first_header = view_store
            .get_view_header(&previous)?
            .ok_or(ProcessError::MissingHeader(previous))?
            .0;
    }

    let mut actual_timespan = prev_header.time - first_header.time;
    actual_timespan = actual_timespan.clamp(RETARGET_TIME / 4, RETARGET_TIME * 4);

    let prev_target_int = prev_header.target.as_big();
    let new_target_int =
        prev_target_int * BigUint::from(actual_timespan as u64) / BigUint::from(RETARGET_TIME as u64);

    Ok(clamp_to_initial_target(new_target_int))
}

/// Revised per-view target computation over a simple moving average window.
/// Scales the work done over the window to the target spacing, bounding the
/// adjustment amplitude to a factor in [0.5, 2].
fn compute_target_sma_window(
    prev_header: &ViewHeader,
    view_store: &dyn ViewStorage,
    ledger: &dyn Ledger,
) -> Result<ViewID, ProcessError> {
    let first_height = prev_header.height - RETARGET_SMA_WINDOW;
    let first_id = ledger
        .get_view_id_for_height(first_height)?
        .ok_or(LedgerError::MissingViewAtHeight(first_height))?;
    let first_header = view_store
        .get_view_header(&first_id)?
        .ok_or(ProcessError::MissingHeader(first_id))?
        .0;

    let prev_work = prev_header.point_work.as_big();
    let first_work = first_header.point_work.as_big();
    if prev_work < first_work {
        return Err(crate::error::StorageError::Corrupt(
            "point work decreased across retarget window".to_owned(),
        )
        .into());
    }
    let work_int = prev_work - first_work;

    let actual_timespan = (prev_header.time - first_header.time).clamp(
        (RETARGET_SMA_WINDOW / 2) * TARGET_SPACING,
        2 * RETARGET_SMA_WINDOW * TARGET_SPACING,
    );

    let scaled_work = work_int * BigUint::from(TARGET_SPACING as u64)
        / BigUint::from(actual_timespan as u64);

    // T = (2^256 / W) - 1
    let max_int = BigUint::from(1u8) << 256;
    let new_target_int = max_int / scaled_work - 1u8;

    Ok(clamp_to_initial_target(new_target_int))
}

/// Never go above (easier than) the initial target.
fn clamp_to_initial_target(new_target: BigUint) -> ViewID {
    let max_target = ViewID::from_hex(INITIAL_TARGET).expect("initial target constant");
    if new_target > max_target.as_big() {
        max_target
    } else {
        ViewID::from_big(&new_target)
    }
}

/// Compute the median timestamp of the most recent views ending at
/// `prev_header`.
pub fn compute_median_timestamp(
    prev_header: &ViewHeader,
    view_store: &dyn ViewStorage,
) -> Result<i64, ProcessError> {
    let mut timestamps = Vec::with_capacity(NUM_VIEWS_FOR_MEDIAN_TIMESTAMP);
    let mut header = prev_header.clone();
    for _ in 0..NUM_VIEWS_FOR_MEDIAN_TIMESTAMP {
        timestamps.push(header.time);
        match view_store.get_view_header(&header.previous)? {
            Some((previous, _)) => header = previous,
            None => break,
        }
    }
    timestamps.sort_unstable();
    Ok(timestamps[timestamps.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consideration::{ConsiderationID, PublicKey};
    use crate::error::LedgerError;
    use crate::ledger::BranchType;
    use crate::view::View;
    use crate::view_storage::ViewStorageMemory;
    use std::collections::HashMap;

    /// Maps heights to view IDs; every other ledger query is unused here.
    struct HeightLedger(HashMap<i64, ViewID>);

    impl Ledger for HeightLedger {
        fn get_point_tip(&self) -> Result<Option<(ViewID, i64)>, LedgerError> {
            Ok(None)
        }
        fn get_view_id_for_height(&self, height: i64) -> Result<Option<ViewID>, LedgerError> {
            Ok(self.0.get(&height).copied())
        }
        fn set_branch_type(&self, _: &ViewID, _: BranchType) -> Result<(), LedgerError> {
            Ok(())
        }
        fn get_branch_type(&self, _: &ViewID) -> Result<BranchType, LedgerError> {
            Ok(BranchType::Unknown)
        }
        fn connect_view(&self, _: &ViewID, _: &View) -> Result<Vec<ConsiderationID>, LedgerError> {
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
        fn get_public_key_imbalance_at(&self, _: &PublicKey, _: i64) -> Result<i64, LedgerError> {
            unimplemented!()
        }
    }

    /// Store a chain of synthetic headers with the given target and spacing,
    /// covering heights `start_height..start_height + count`, timestamped
    /// from `start_time`.
    fn store_chain(
        store: &ViewStorageMemory,
        start_height: i64,
        count: i64,
        target: ViewID,
        start_time: i64,
        spacing: i64,
    ) -> (HashMap<i64, ViewID>, ViewHeader) {
        let mut by_height = HashMap::new();
        let mut previous = ViewID::default();
        let mut prev_work = ViewID::default();
        let mut header = None;

        for height in start_height..start_height + count {
            let mut viewpoint =
                crate::consideration::Consideration::new(None, PublicKey([9; 32]), 0, 0, height, "");
            viewpoint.time = 1;
            viewpoint.nonce = (height % i32::MAX as i64) as i32;
            let mut view = View::new(previous, height, target, prev_work, vec![viewpoint]).unwrap();
            view.header.time = start_time + (height - start_height) * spacing;
            view.header.nonce = height;

            let id = view.id().unwrap();
            store.store(&id, &view, view.header.time).unwrap();
            by_height.insert(height, id);
            previous = id;
            prev_work = view.header.point_work;
            header = Some(view.header);
        }

        (by_height, header.unwrap())
    }

    #[test]
    fn legacy_keeps_target_between_intervals() {
        let store = ViewStorageMemory::new();
        let target = ViewID::from_hex(INITIAL_TARGET).unwrap();
        let (heights, tip) = store_chain(&store, 0, 10, target, 1_000_000, TARGET_SPACING);
        let ledger = HeightLedger(heights);

        // height 9: the next view (10) is not a retarget view
        let next = compute_target(&tip, &store, &ledger).unwrap();
        assert_eq!(next, target);
    }

    #[test]
    fn legacy_first_retarget_uses_2015_view_lookback() {
        let store = ViewStorageMemory::new();
        let target = ViewID::from_hex(INITIAL_TARGET).unwrap();
        // chain of heights 0..=2015 at exact spacing: the first retarget
        // walks back 2015 views (2016 would run past genesis) and measures
        // 2015 intervals against RETARGET_TIME, adjusting slightly harder
        let (heights, tip) =
            store_chain(&store, 0, RETARGET_INTERVAL, target, 1_000_000, TARGET_SPACING);
        assert_eq!(tip.height, RETARGET_INTERVAL - 1);
        let ledger = HeightLedger(heights);

        let next = compute_target(&tip, &store, &ledger).unwrap();
        let expected = target.as_big() * 1_209_000u32 / 1_209_600u32;
        assert_eq!(next.as_big(), expected);
    }

    #[test]
    fn legacy_retarget_scales_with_timespan() {
        let store = ViewStorageMemory::new();
        // a harder-than-initial target so the clamp doesn't mask the scaling
        let target = ViewID::from_hex(
            "000000000fff0000000000000000000000000000000000000000000000000000",
        )
        .unwrap();
        // views at twice the target spacing
        let (heights, tip) =
            store_chain(&store, 0, RETARGET_INTERVAL, target, 1_000_000, 2 * TARGET_SPACING);
        let ledger = HeightLedger(heights);

        let next = compute_target(&tip, &store, &ledger).unwrap();
        // timespan = 2015 doubled intervals; ratio = 4030/2016
        let expected = target.as_big() * 4030u32 / 2016u32;
        assert_eq!(next.as_big(), expected);
    }

    #[test]
    fn sma_window_holds_target_at_exact_spacing() {
        let store = ViewStorageMemory::new();
        let target = ViewID::from_hex(
            "000000000fff0000000000000000000000000000000000000000000000000000",
        )
        .unwrap();
        let start = BITCOIN_CASH_RETARGET_ALGORITHM_HEIGHT - RETARGET_SMA_WINDOW - 2;
        let count = RETARGET_SMA_WINDOW + 4;
        let (heights, tip) = store_chain(&store, start, count, target, 1_000_000, TARGET_SPACING);
        assert!(tip.height >= BITCOIN_CASH_RETARGET_ALGORITHM_HEIGHT);
        let ledger = HeightLedger(heights);

        // W = 144 * work(target); W' = W * spacing / (144 * spacing) = work;
        // T = 2^256 / work - 1 ~= target
        let next = compute_target(&tip, &store, &ledger).unwrap();
        let ratio_num = next.as_big().max(target.as_big());
        let ratio_den = next.as_big().min(target.as_big());
        // within 0.1% of the held target
        assert!(ratio_num - ratio_den.clone() < ratio_den / 1000u32);
    }

    #[test]
    fn sma_window_timespan_is_clamped() {
        let store = ViewStorageMemory::new();
        let target = ViewID::from_hex(
            "000000000fff0000000000000000000000000000000000000000000000000000",
        )
        .unwrap();
        let start = BITCOIN_CASH_RETARGET_ALGORITHM_HEIGHT - RETARGET_SMA_WINDOW - 2;
        let count = RETARGET_SMA_WINDOW + 4;
        // absurdly slow views: timespan clamps to 2 * window * spacing,
        // so the target at most doubles
        let (heights, tip) =
            store_chain(&store, start, count, target, 1_000_000, 100 * TARGET_SPACING);
        let ledger = HeightLedger(heights);

        let next = compute_target(&tip, &store, &ledger).unwrap();
        let upper = target.as_big() * 2u32 + BigUint::from(2u8);
        assert!(next.as_big() <= upper);
        assert!(next.as_big() > target.as_big());
    }

    #[test]
    fn median_timestamp_walks_up_to_eleven_views() {
        let store = ViewStorageMemory::new();
        let target = ViewID::from_hex(INITIAL_TARGET).unwrap();
        let (_, tip) = store_chain(&store, 0, 20, target, 1_000, 10);

        // heights 9..=19 have times 1090..=1190; median is height 14's time
        let median = compute_median_timestamp(&tip, &store).unwrap();
        assert_eq!(median, 1_000 + 14 * 10);

        // a short chain uses what exists
        let store2 = ViewStorageMemory::new();
        let (_, tip2) = store_chain(&store2, 0, 3, target, 1_000, 10);
        let median2 = compute_median_timestamp(&tip2, &store2).unwrap();
        assert_eq!(median2, 1_010);
    }
}
