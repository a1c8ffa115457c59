//! Considerations: signed records transferring a single unit of consideration
//! from one public key to another.
//!
//! A consideration's ID is the SHA3-256 of its canonical JSON serialization
//! with the signature omitted, so signature malleability never affects IDs.
//! Canonical means: fields in declaration order, no whitespace, optional
//! zero-valued fields omitted entirely, public keys and signatures as padded
//! standard base64, IDs as lowercase hex.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Sha3_256};

use crate::constants::{MAX_NUMBER, VIEWS_UNTIL_NEW_SERIES};
use crate::error::StorageError;

/// A consideration's unique identifier. SHA3-256 hash of its canonical JSON.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ConsiderationID(pub [u8; 32]);

/// An ed25519 public key as carried on the wire. Recipients of viewpoints may
/// be structured strings that decode to 32 bytes without being valid curve
/// points, so the raw bytes are kept and only interpreted as a verifying key
/// when checking signatures.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PublicKey(pub [u8; 32]);

/// A consideration's ed25519 signature.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(pub Vec<u8>);

/// A ledger consideration. Transfers one unit from `by` to `for`.
///
/// Field order matters: IDs are computed over the serialized form.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Consideration {
    pub time: i64,
    /// Collision prevention. Pseudorandom, not used for crypto.
    pub nonce: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by: Option<PublicKey>,
    #[serde(rename = "for")]
    pub for_: PublicKey,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memo: String,
    /// View height. If set the consideration can't be rendered before it.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub matures: i64,
    /// View height. If set the consideration can't be rendered after it.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub expires: i64,
    /// Incremented roughly once a week to allow for pruning history.
    pub series: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

impl Consideration {
    /// Returns a new unsigned consideration. `height` is the height the
    /// consideration is expected to confirm around; it selects the series.
    pub fn new(
        by: Option<PublicKey>,
        for_: PublicKey,
        matures: i64,
        expires: i64,
        height: i64,
        memo: &str,
    ) -> Self {
        let mut rng = rand::thread_rng();
        Consideration {
            time: now_unix(),
            nonce: rng.gen_range(0..i32::MAX),
            by,
            for_,
            memo: memo.to_owned(),
            matures,
            expires,
            series: compute_consideration_series(by.is_none(), height),
            signature: None,
        }
    }

    /// Computes the ID. The signature is never part of it.
    pub fn id(&self) -> Result<ConsiderationID, StorageError> {
        let mut stripped = self.clone();
        stripped.signature = None;
        let json = serde_json::to_vec(&stripped)?;
        let digest = Sha3_256::digest(&json);
        let mut id = ConsiderationID::default();
        id.0.copy_from_slice(&digest);
        Ok(id)
    }

    /// Signs the consideration, replacing any previous signature.
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), StorageError> {
        let id = self.id()?;
        self.signature = Some(Signature(key.sign(&id.0).to_bytes().to_vec()));
        Ok(())
    }

    /// Verifies only that the consideration is properly signed.
    pub fn verify(&self) -> Result<bool, StorageError> {
        let id = self.id()?;
        let by = match &self.by {
            Some(by) => by,
            None => return Ok(false),
        };
        let key = match VerifyingKey::from_bytes(&by.0) {
            Ok(key) => key,
            Err(_) => return Ok(false),
        };
        let sig = match &self.signature {
            Some(sig) => sig,
            None => return Ok(false),
        };
        let sig = match ed25519_dalek::Signature::try_from(sig.0.as_slice()) {
            Ok(sig) => sig,
            Err(_) => return Ok(false),
        };
        Ok(key.verify(&id.0, &sig).is_ok())
    }

    /// True if this is a viewpoint: the first consideration in every view,
    /// recognising the renderer for rendering it.
    pub fn is_viewpoint(&self) -> bool {
        self.by.is_none()
    }

    /// True if the consideration is relevant to the given public key.
    pub fn contains(&self, pub_key: &PublicKey) -> bool {
        if let Some(by) = &self.by {
            if by == pub_key {
                return true;
            }
        }
        &self.for_ == pub_key
    }

    /// True if the consideration can be confirmed at the given height.
    /// The view at exactly `matures` is the first that may confirm it.
    pub fn is_mature(&self, height: i64) -> bool {
        if self.matures == 0 {
            return true;
        }
        height >= self.matures
    }

    /// True if the consideration can no longer be confirmed at the given height.
    pub fn is_expired(&self, height: i64) -> bool {
        if self.expires == 0 {
            return false;
        }
        self.expires < height
    }
}

/// Compute the series to use for a new consideration at the given height.
pub fn compute_consideration_series(is_viewpoint: bool, height: i64) -> i64 {
    if is_viewpoint {
        // viewpoints start using the new series right on time
        return height / VIEWS_UNTIL_NEW_SERIES + 1;
    }

    // otherwise don't start using a new series until 100 views in to mitigate
    // potential reorg issues right around the switchover
    (height - 100) / VIEWS_UNTIL_NEW_SERIES + 1
}

/// The series must be within the acceptable range given the current height.
pub fn check_consideration_series(cn: &Consideration, height: i64) -> bool {
    if cn.is_viewpoint() {
        // viewpoints must start a new series right on time
        return cn.series == height / VIEWS_UNTIL_NEW_SERIES + 1;
    }

    // user considerations have a grace period (1 full series) to mitigate
    // effects of any queueing delay and/or reorgs near series switchover time
    let high = height / VIEWS_UNTIL_NEW_SERIES + 1;
    let mut low = high - 1;
    if low == 0 {
        low = 1;
    }
    cn.series >= low && cn.series <= high
}

/// Sanity bound used across time-like fields carried in JSON.
pub fn in_number_range(v: i64) -> bool {
    (0..=MAX_NUMBER).contains(&v)
}

/// Current unix time in seconds.
pub fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl ConsiderationID {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ConsiderationID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for ConsiderationID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for ConsiderationID {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for ConsiderationID {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("invalid consideration ID"));
        }
        let mut id = ConsiderationID::default();
        id.0.copy_from_slice(&bytes);
        Ok(id)
    }
}

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(&self.0))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(&s).map_err(serde::de::Error::custom)?;
        if bytes.len() != 32 {
            return Err(serde::de::Error::custom("invalid public key"));
        }
        let mut pk = PublicKey::default();
        pk.0.copy_from_slice(&bytes);
        Ok(pk)
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(&s).map_err(serde::de::Error::custom)?;
        Ok(Signature(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(fill: u8) -> SigningKey {
        SigningKey::from_bytes(&[fill; 32])
    }

    #[test]
    fn canonical_json_is_byte_exact() {
        let cn = Consideration {
            time: 1_700_000_000,
            nonce: 123456789,
            by: Some(PublicKey([1; 32])),
            for_: PublicKey([2; 32]),
            memo: "hi".to_owned(),
            matures: 0,
            expires: 0,
            series: 1,
            signature: None,
        };
        let json = serde_json::to_string(&cn).unwrap();
        assert_eq!(
            json,
            concat!(
                r#"{"time":1700000000,"nonce":123456789,"#,
                r#""by":"AQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQEBAQE=","#,
                r#""for":"AgICAgICAgICAgICAgICAgICAgICAgICAgICAgICAgI=","#,
                r#""memo":"hi","series":1}"#,
            )
        );

        // the ID is the SHA3-256 of exactly these bytes
        let digest = Sha3_256::digest(json.as_bytes());
        assert_eq!(cn.id().unwrap().0[..], digest[..]);
    }

    #[test]
    fn optional_zero_fields_are_omitted() {
        let viewpoint = Consideration {
            time: 1_700_000_000,
            nonce: 7,
            by: None,
            for_: PublicKey([2; 32]),
            memo: String::new(),
            matures: 0,
            expires: 0,
            series: 1,
            signature: None,
        };
        let json = serde_json::to_string(&viewpoint).unwrap();
        assert!(!json.contains("\"by\""));
        assert!(!json.contains("\"memo\""));
        assert!(!json.contains("\"matures\""));
        assert!(!json.contains("\"expires\""));
        assert!(!json.contains("\"signature\""));

        let nonzero = Consideration {
            matures: 5,
            expires: 10,
            ..viewpoint
        };
        let json = serde_json::to_string(&nonzero).unwrap();
        assert!(json.contains("\"matures\":5"));
        assert!(json.contains("\"expires\":10"));
    }

    #[test]
    fn signature_never_affects_the_id() {
        let key = test_key(3);
        let mut cn = Consideration::new(
            Some(PublicKey(key.verifying_key().to_bytes())),
            PublicKey([2; 32]),
            0,
            0,
            0,
            "memo",
        );
        let before = cn.id().unwrap();
        cn.sign(&key).unwrap();
        assert_eq!(before, cn.id().unwrap());
        assert!(cn.verify().unwrap());

        // tamper
        cn.memo.push('!');
        assert!(!cn.verify().unwrap());
    }

    #[test]
    fn memo_length_counts_bytes_not_chars() {
        let cn = Consideration::new(None, PublicKey([2; 32]), 0, 0, 0, "こんにちは");
        assert_eq!(cn.memo.len(), 15);
    }

    #[test]
    fn series_selection() {
        // viewpoints switch series right on time
        assert_eq!(compute_consideration_series(true, 0), 1);
        assert_eq!(compute_consideration_series(true, 1007), 1);
        assert_eq!(compute_consideration_series(true, 1008), 2);

        // user considerations lag the switchover by 100 views
        assert_eq!(compute_consideration_series(false, 0), 1);
        assert_eq!(compute_consideration_series(false, 1008), 1);
        assert_eq!(compute_consideration_series(false, 1108), 2);
    }

    fn user_cn(series: i64) -> Consideration {
        Consideration {
            time: 0,
            nonce: 0,
            by: Some(PublicKey([1; 32])),
            for_: PublicKey([2; 32]),
            memo: String::new(),
            matures: 0,
            expires: 0,
            series,
            signature: None,
        }
    }

    #[test]
    fn series_acceptance_window() {
        // crossing a multiple of the series length: high and high-1 accepted
        let height = 2 * VIEWS_UNTIL_NEW_SERIES; // high == 3
        assert!(check_consideration_series(&user_cn(3), height));
        assert!(check_consideration_series(&user_cn(2), height));
        assert!(!check_consideration_series(&user_cn(4), height));
        assert!(!check_consideration_series(&user_cn(1), height));

        // at height 0 the lower bound clamps to 1
        assert!(check_consideration_series(&user_cn(1), 0));
        assert!(!check_consideration_series(&user_cn(0), 0));
        assert!(!check_consideration_series(&user_cn(-1), 0));

        // viewpoints must match exactly
        let mut vp = user_cn(1);
        vp.by = None;
        assert!(check_consideration_series(&vp, 0));
        vp.series = 2;
        assert!(!check_consideration_series(&vp, 0));
    }

    #[test]
    fn maturity_and_expiry() {
        let mut cn = user_cn(1);
        cn.matures = 100;
        cn.expires = 200;
        // the view at exactly `matures` is the first that may confirm it
        assert!(!cn.is_mature(99));
        assert!(cn.is_mature(100));
        assert!(cn.is_mature(150));
        // valid through `expires` inclusive
        assert!(!cn.is_expired(200));
        assert!(cn.is_expired(201));

        // zero means unrestricted
        cn.matures = 0;
        cn.expires = 0;
        assert!(cn.is_mature(0));
        assert!(!cn.is_expired(i64::MAX));
    }

    #[test]
    fn id_round_trips_through_json() {
        let id = ConsiderationID([0xab; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json.len(), 64 + 2);
        let back: ConsiderationID = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
