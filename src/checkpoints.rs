//! Known-good view IDs at fixed heights. A candidate view whose height has a
//! checkpoint must carry the matching ID.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::ValidationError;
use crate::view::ViewID;

/// Set to false to reject peers with points extending known checkpoints.
pub const CHECKPOINTS_ENABLED: bool = true;

/// The height of the latest checkpoint. Used when judging whether we're
/// still in initial download.
pub static LATEST_CHECKPOINT_HEIGHT: Lazy<i64> =
    Lazy::new(|| CHECKPOINTS.keys().copied().max().unwrap_or(0));

/// Checkpoints are added after sufficient confirmation depth, typically on
/// series boundaries.
static CHECKPOINTS: Lazy<HashMap<i64, &'static str>> = Lazy::new(HashMap::new);

/// Returns an error if the view at the given height conflicts with a
/// checkpoint.
pub fn checkpoint_check(id: &ViewID, height: i64) -> Result<(), ValidationError> {
    if !CHECKPOINTS_ENABLED {
        return Ok(());
    }
    check_against(&CHECKPOINTS, id, height)
}

fn check_against(
    checkpoints: &HashMap<i64, &'static str>,
    id: &ViewID,
    height: i64,
) -> Result<(), ValidationError> {
    match checkpoints.get(&height) {
        Some(expected) if ViewID::from_hex(expected).as_ref() == Some(id) => Ok(()),
        Some(_) => Err(ValidationError::CheckpointMismatch(*id)),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_heights_pass() {
        let table = HashMap::new();
        let id = ViewID([7; 32]);
        assert!(check_against(&table, &id, 42).is_ok());
    }

    #[test]
    fn checkpointed_heights_must_match() {
        let good = ViewID([7; 32]);
        let hex: &'static str = Box::leak(good.to_string().into_boxed_str());
        let table = HashMap::from([(42i64, hex)]);

        assert!(check_against(&table, &good, 42).is_ok());
        assert!(check_against(&table, &good, 41).is_ok());

        let bad = ViewID([8; 32]);
        assert!(matches!(
            check_against(&table, &bad, 42),
            Err(ValidationError::CheckpointMismatch(_))
        ));
    }
}
