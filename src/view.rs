//! Views: a header plus an ordered list of considerations. As views are
//! connected their considerations affect the underlying ledger.

use std::fmt;

use num_bigint::BigUint;
use num_traits::Zero;
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Sha3_256};

use crate::consideration::{now_unix, Consideration, ConsiderationID};
use crate::constants::{MAX_CONSIDERATIONS_PER_VIEW, MAX_NUMBER};
use crate::error::{ProcessError, StorageError, ValidationError};
use crate::view_header_hasher::ViewHeaderHasher;

/// A view's unique identifier. SHA3-256 hash of its canonical header JSON.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ViewID(pub [u8; 32]);

/// Data used to determine view validity and its place on the focal point.
///
/// Field order is part of consensus: IDs are computed over the serialized form.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ViewHeader {
    pub previous: ViewID,
    pub hash_list_root: ConsiderationID,
    pub time: i64,
    pub target: ViewID,
    /// Total cumulative point work.
    pub point_work: ViewID,
    /// Not used for crypto.
    pub nonce: i64,
    pub height: i64,
    pub consideration_count: i32,
}

/// A view of the focal point.
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct View {
    pub header: ViewHeader,
    pub considerations: Vec<Consideration>,
    /// Running hash state over non-viewpoint consideration IDs, used by the
    /// renderer to update the hash list root in O(1) per appended
    /// consideration. Not serialized.
    #[serde(skip)]
    hasher: Sha3_256,
}

impl View {
    /// Creates a new view to be rendered. The considerations list must start
    /// with a viewpoint.
    pub fn new(
        previous: ViewID,
        height: i64,
        target: ViewID,
        prev_point_work: ViewID,
        considerations: Vec<Consideration>,
    ) -> Result<Self, ProcessError> {
        if considerations.len() as i64 > MAX_CONSIDERATIONS_PER_VIEW {
            return Err(ValidationError::TooManyConsiderations {
                id: ViewID::default(),
                count: considerations.len(),
                max: MAX_CONSIDERATIONS_PER_VIEW,
            }
            .into());
        }
        if considerations.is_empty() {
            return Err(ValidationError::EmptyView(ViewID::default()).into());
        }

        let mut hasher = Sha3_256::new();
        let hash_list_root = compute_hash_list_root(&mut hasher, &considerations)?;

        let mut rng = rand::thread_rng();
        Ok(View {
            header: ViewHeader {
                previous,
                hash_list_root,
                time: now_unix(),
                target,
                point_work: compute_point_work(&target, &prev_point_work),
                nonce: rng.gen_range(0..MAX_NUMBER),
                height,
                consideration_count: considerations.len() as i32,
            },
            considerations,
            hasher,
        })
    }

    /// Computes an ID for the view.
    pub fn id(&self) -> Result<ViewID, StorageError> {
        self.header.id()
    }

    /// Verifies the view's proof-of-work satisfies the declared target.
    pub fn check_pow(&self, id: &ViewID) -> bool {
        id.as_big() <= self.header.target.as_big()
    }

    /// Adds a new consideration to the view while it is being rendered,
    /// updating the hash list root incrementally.
    pub fn add_consideration(
        &mut self,
        id: ConsiderationID,
        cn: Consideration,
    ) -> Result<(), StorageError> {
        // fold the new consideration hash into the running state
        self.hasher.update(id.0);

        // update the root to account for the fixed viewpoint
        self.header.hash_list_root =
            add_viewpoint_to_hash_list_root(&self.hasher, &self.considerations[0])?;

        self.considerations.push(cn);
        self.header.consideration_count += 1;
        Ok(())
    }
}

/// Compute a hash list root of all consideration hashes. The running hasher
/// state (over the non-viewpoint considerations) is left primed so the caller
/// can continue appending.
pub fn compute_hash_list_root(
    hasher: &mut Sha3_256,
    considerations: &[Consideration],
) -> Result<ConsiderationID, StorageError> {
    let (viewpoint, rest) = considerations
        .split_first()
        .ok_or_else(|| StorageError::Corrupt("empty consideration list".to_owned()))?;

    // don't include the viewpoint in the first round
    for cn in rest {
        let id = cn.id()?;
        hasher.update(id.0);
    }

    // add the viewpoint last
    add_viewpoint_to_hash_list_root(hasher, viewpoint)
}

/// Hash the viewpoint's ID together with the root of the remaining
/// consideration hashes. The resulting root has the form:
/// `H(CNID[0] | H(CNID[1] | ... | CNID[N-1]))`, which lets the renderer
/// append considerations without rehashing the fixed viewpoint.
fn add_viewpoint_to_hash_list_root(
    hasher: &Sha3_256,
    viewpoint: &Consideration,
) -> Result<ConsiderationID, StorageError> {
    let root_without_viewpoint = hasher.clone().finalize();

    let id = viewpoint.id()?;
    let mut root_hasher = Sha3_256::new();
    root_hasher.update(id.0);
    root_hasher.update(root_without_viewpoint);

    let mut root = ConsiderationID::default();
    root.0.copy_from_slice(&root_hasher.finalize());
    Ok(root)
}

/// Compute view work given its target: `2^256 / (target + 1)`.
pub fn compute_view_work(target: &ViewID) -> BigUint {
    let target_int = target.as_big();
    if target_int.is_zero() {
        return BigUint::zero();
    }
    let max_int = BigUint::from(1u8) << 256;
    max_int / (target_int + 1u8)
}

/// Compute cumulative point work given a view's target and the previous point work.
pub fn compute_point_work(target: &ViewID, prev_point_work: &ViewID) -> ViewID {
    let sum = prev_point_work.as_big() + compute_view_work(target);
    ViewID::from_big(&sum)
}

impl ViewHeader {
    /// Computes an ID for the view header.
    pub fn id(&self) -> Result<ViewID, StorageError> {
        let json = serde_json::to_vec(self)?;
        let digest = Sha3_256::digest(&json);
        let mut id = ViewID::default();
        id.0.copy_from_slice(&digest);
        Ok(id)
    }

    /// Computes an ID while rendering, reusing the given incremental hasher.
    pub fn id_fast(&self, hasher: &mut ViewHeaderHasher) -> (ViewID, i64) {
        hasher.update(self)
    }

    /// Returns true if this header indicates a better point than `their`
    /// up to both tips. `this_when` and `their_when` are the timestamps of
    /// when each view was stored.
    pub fn compare(&self, their: &ViewHeader, this_when: i64, their_when: i64) -> bool {
        let this_work = self.point_work.as_big();
        let their_work = their.point_work.as_big();

        // most work wins
        if this_work != their_work {
            return this_work > their_work;
        }

        // tie goes to the view stored first
        if this_when != their_when {
            return this_when < their_when;
        }

        // if we still need to break a tie go by the lesser id
        let this_id = self.id().expect("header serialization");
        let their_id = their.id().expect("header serialization");
        this_id.as_big() < their_id.as_big()
    }
}

impl ViewID {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The ID interpreted as a big-endian integer.
    pub fn as_big(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    /// Converts from a big integer. Values above 256 bits indicate a corrupt
    /// point-work computation and are fatal.
    pub fn from_big(i: &BigUint) -> ViewID {
        let bytes = i.to_bytes_be();
        if bytes.len() > 32 {
            panic!("point work exceeds 256 bits");
        }
        let mut id = ViewID::default();
        id.0[32 - bytes.len()..].copy_from_slice(&bytes);
        id
    }

    pub fn from_hex(s: &str) -> Option<ViewID> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 32 {
            return None;
        }
        let mut id = ViewID::default();
        id.0.copy_from_slice(&bytes);
        Some(id)
    }
}

impl fmt::Display for ViewID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ViewID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for ViewID {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for ViewID {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ViewID::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid view ID"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consideration::PublicKey;
    use crate::constants::INITIAL_TARGET;

    fn viewpoint_for(fill: u8) -> Consideration {
        let mut cn = Consideration::new(None, PublicKey([fill; 32]), 0, 0, 0, "vp");
        cn.time = 1_700_000_000;
        cn.nonce = 42;
        cn
    }

    fn user_cn(n: u8) -> Consideration {
        let mut cn = Consideration::new(
            Some(PublicKey([n; 32])),
            PublicKey([n.wrapping_add(1); 32]),
            0,
            0,
            0,
            "",
        );
        cn.time = 1_700_000_000;
        cn.nonce = n as i32;
        cn
    }

    #[test]
    fn header_json_field_order() {
        let header = ViewHeader {
            previous: ViewID([0x11; 32]),
            hash_list_root: ConsiderationID([0x22; 32]),
            time: 1_700_000_000,
            target: ViewID([0x33; 32]),
            point_work: ViewID([0x44; 32]),
            nonce: 7,
            height: 9,
            consideration_count: 1,
        };
        let json = serde_json::to_string(&header).unwrap();
        let expected = format!(
            concat!(
                r#"{{"previous":"{}","hash_list_root":"{}","time":1700000000,"#,
                r#""target":"{}","point_work":"{}","nonce":7,"height":9,"#,
                r#""consideration_count":1}}"#,
            ),
            "11".repeat(32),
            "22".repeat(32),
            "33".repeat(32),
            "44".repeat(32),
        );
        assert_eq!(json, expected);

        let digest = Sha3_256::digest(json.as_bytes());
        assert_eq!(header.id().unwrap().0[..], digest[..]);
    }

    #[test]
    fn view_work_formula() {
        // work(t) = 2^256 / (t + 1); the all-ones target yields exactly 1
        let easiest = ViewID([0xff; 32]);
        assert_eq!(compute_view_work(&easiest), BigUint::from(1u8));

        let zero = ViewID::default();
        assert_eq!(compute_view_work(&zero), BigUint::zero());

        let initial = ViewID::from_hex(INITIAL_TARGET).unwrap();
        let work = compute_view_work(&initial);
        // 2^256 / (0x00000000ffff0001 << 192) ~= 2^32
        assert!(work > BigUint::from(1u64 << 31));
        assert!(work < BigUint::from(1u64 << 33));
    }

    #[test]
    fn point_work_accumulates() {
        let easiest = ViewID([0xff; 32]);
        let mut acc = ViewID::default();
        for i in 1u8..=5 {
            acc = compute_point_work(&easiest, &acc);
            assert_eq!(acc.as_big(), BigUint::from(i));
        }
    }

    #[test]
    fn incremental_root_matches_full_recompute() {
        let cns = vec![viewpoint_for(9), user_cn(1), user_cn(2)];
        let mut view = View::new(
            ViewID::default(),
            0,
            ViewID([0xff; 32]),
            ViewID::default(),
            cns,
        )
        .unwrap();

        let extra = user_cn(3);
        let extra_id = extra.id().unwrap();
        view.add_consideration(extra_id, extra).unwrap();
        assert_eq!(view.header.consideration_count, 4);

        let mut hasher = Sha3_256::new();
        let expected = compute_hash_list_root(&mut hasher, &view.considerations).unwrap();
        assert_eq!(view.header.hash_list_root, expected);
    }

    #[test]
    fn compare_prefers_work_then_store_time_then_id() {
        let mut a = ViewHeader {
            previous: ViewID::default(),
            hash_list_root: ConsiderationID::default(),
            time: 1,
            target: ViewID([0xff; 32]),
            point_work: ViewID::from_big(&BigUint::from(10u8)),
            nonce: 1,
            height: 1,
            consideration_count: 1,
        };
        let mut b = a.clone();

        b.point_work = ViewID::from_big(&BigUint::from(11u8));
        assert!(b.compare(&a, 0, 0));
        assert!(!a.compare(&b, 0, 0));

        // equal work: earlier store time wins
        b.point_work = a.point_work;
        b.nonce = 2;
        assert!(a.compare(&b, 5, 6));
        assert!(!b.compare(&a, 6, 5));

        // equal work and store time: lesser id wins
        let (a_id, b_id) = (a.id().unwrap(), b.id().unwrap());
        let a_wins = a_id.as_big() < b_id.as_big();
        assert_eq!(a.compare(&b, 5, 5), a_wins);
        assert_eq!(b.compare(&a, 5, 5), !a_wins);

        // a header never beats itself
        a.nonce = 1;
        let c = a.clone();
        assert!(!a.compare(&c, 5, 5));
    }

    #[test]
    #[should_panic(expected = "point work exceeds 256 bits")]
    fn oversized_point_work_is_fatal() {
        let big = BigUint::from(1u8) << 256;
        let _ = ViewID::from_big(&big);
    }
}
