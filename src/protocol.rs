//! Message types for the peer protocol. Peers exchange length-prefixed JSON
//! frames of the form `{"type": ..., "body": ...}` over WebSocket/TLS;
//! transport itself lives outside this crate.

use serde::{Deserialize, Serialize};

use crate::consideration::{Consideration, ConsiderationID, PublicKey};
use crate::view::{View, ViewHeader, ViewID};

/// The name of this version of the focalpoint peer protocol.
pub const PROTOCOL: &str = "focalpoint.1";

/// A message frame for all messages in the protocol.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Message {
    InvView(InvViewMessage),
    GetView(GetViewMessage),
    GetViewByHeight(GetViewByHeightMessage),
    View(Box<ViewMessage>),
    GetViewHeader(GetViewHeaderMessage),
    GetViewHeaderByHeight(GetViewHeaderByHeightMessage),
    ViewHeader(Box<ViewHeaderMessage>),
    FindCommonAncestor(FindCommonAncestorMessage),
    GetTipHeader,
    TipHeader(Box<TipHeaderMessage>),
    GetConsideration(GetConsiderationMessage),
    Consideration(Box<ConsiderationMessage>),
    PushConsideration(Box<PushConsiderationMessage>),
    PushConsiderationResult(PushConsiderationResultMessage),
    FilterLoad(FilterLoadMessage),
    FilterAdd(FilterAddMessage),
    FilterResult(FilterResultMessage),
    FilterView(Box<FilterViewMessage>),
    FilterConsiderationQueue(FilterConsiderationQueueMessage),
    GetPublicKeyConsiderations(GetPublicKeyConsiderationsMessage),
    PublicKeyConsiderations(Box<PublicKeyConsiderationsMessage>),
    GetImbalance(GetImbalanceMessage),
    Imbalance(ImbalanceMessage),
    GetImbalances(GetImbalancesMessage),
    Imbalances(ImbalancesMessage),
    GetRanking(GetRankingMessage),
    Ranking(RankingMessage),
    GetRankings(GetRankingsMessage),
    Rankings(RankingsMessage),
    GetGraph(GetGraphMessage),
    Graph(GraphMessage),
    GetPeerAddresses,
    PeerAddresses(PeerAddressesMessage),
    GetWork(GetWorkMessage),
    Work(Box<WorkMessage>),
    SubmitWork(Box<SubmitWorkMessage>),
    SubmitWorkResult(SubmitWorkResultMessage),
}

/// Communicates views available for download.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InvViewMessage {
    pub view_ids: Vec<ViewID>,
}

/// Requests a view for download.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetViewMessage {
    pub view_id: ViewID,
}

/// Requests a view for download by height.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetViewByHeightMessage {
    pub height: i64,
}

/// Sends a peer a complete view.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ViewMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<ViewID>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view: Option<View>,
}

/// Requests a view header.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetViewHeaderMessage {
    pub view_id: ViewID,
}

/// Requests a view header by height.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetViewHeaderByHeightMessage {
    pub height: i64,
}

/// Sends a peer a view's header.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ViewHeaderMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<ViewID>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "header")]
    pub view_header: Option<ViewHeader>,
}

/// Finds a common ancestor with a peer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FindCommonAncestorMessage {
    pub view_ids: Vec<ViewID>,
}

/// Sends a peer the header of the tip view. Sent in response to the empty
/// `get_tip_header` message.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TipHeaderMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<ViewID>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "header")]
    pub view_header: Option<ViewHeader>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub time_seen: i64,
}

/// Requests a confirmed consideration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetConsiderationMessage {
    pub consideration_id: ConsiderationID,
}

/// Sends a peer a confirmed consideration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ConsiderationMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<ViewID>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub height: i64,
    pub consideration_id: ConsiderationID,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consideration: Option<Consideration>,
}

/// Pushes a newly processed unconfirmed consideration to peers.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PushConsiderationMessage {
    pub consideration: Consideration,
}

/// Response to a `push_consideration` message.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PushConsiderationResultMessage {
    pub consideration_id: ConsiderationID,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Requests that the peer load a filter limiting the considerations
/// returned to it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FilterLoadMessage {
    #[serde(rename = "type")]
    pub filter_type: String,
    #[serde(with = "base64_bytes")]
    pub filter: Vec<u8>,
}

/// Requests the addition of the given public keys to the current filter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FilterAddMessage {
    pub public_keys: Vec<PublicKey>,
}

/// Whether or not a filter request was successful.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FilterResultMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// A pared down view containing only considerations relevant to the peer
/// given their filter.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FilterViewMessage {
    pub view_id: ViewID,
    pub header: ViewHeader,
    pub considerations: Vec<Consideration>,
}

/// A pared down view of the unconfirmed consideration queue, filtered for
/// the peer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FilterConsiderationQueueMessage {
    pub considerations: Vec<Consideration>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Requests considerations associated with a public key over a height range.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetPublicKeyConsiderationsMessage {
    pub public_key: PublicKey,
    pub start_height: i64,
    pub start_index: usize,
    pub end_height: i64,
    pub limit: usize,
}

/// Returns view headers and considerations relevant to the requested public
/// key over a height range.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PublicKeyConsiderationsMessage {
    pub public_key: PublicKey,
    pub start_height: i64,
    pub stop_height: i64,
    pub stop_index: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter_views: Vec<FilterViewMessage>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Requests a public key's imbalance.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetImbalanceMessage {
    pub public_key: PublicKey,
}

/// Sends a public key's imbalance to a peer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImbalanceMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<ViewID>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub height: i64,
    pub public_key: PublicKey,
    pub imbalance: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Requests a set of public key imbalances.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetImbalancesMessage {
    pub public_keys: Vec<PublicKey>,
}

/// Sends a set of public key imbalances to a peer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ImbalancesMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<ViewID>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub height: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imbalances: Vec<PublicKeyImbalance>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// An entry in [`ImbalancesMessage`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PublicKeyImbalance {
    pub public_key: PublicKey,
    pub imbalance: i64,
}

/// Requests a public key's considerability ranking.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetRankingMessage {
    pub public_key: PublicKey,
}

/// Sends a public key's considerability ranking to a peer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RankingMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<ViewID>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub height: i64,
    pub public_key: PublicKey,
    pub ranking: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// Requests a set of public key rankings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetRankingsMessage {
    pub public_keys: Vec<PublicKey>,
}

/// Sends a set of public key rankings to a peer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RankingsMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<ViewID>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub height: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rankings: Vec<PublicKeyRanking>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// An entry in [`RankingsMessage`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PublicKeyRanking {
    pub public_key: String,
    pub ranking: f64,
}

/// Requests the graph neighborhood of a public key.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetGraphMessage {
    pub public_key: PublicKey,
}

/// Sends a public key's graph neighborhood to a peer, DOT-rendered.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GraphMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub view_id: Option<ViewID>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub height: i64,
    pub public_key: PublicKey,
    pub graph: String,
}

/// Communicates a list of potential peer addresses known by a peer.
/// Sent in response to the empty `get_peer_addresses` message.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PeerAddressesMessage {
    pub addresses: Vec<String>,
}

/// Used by a rendering peer to request rendering work.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GetWorkMessage {
    pub public_keys: Vec<PublicKey>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub memo: String,
}

/// Work to perform, sent to a rendering peer. The timestamp and nonce in
/// the header may be manipulated by the rendering peer; it must keep the
/// timestamp above `min_time` and the nonce within the safe number range.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkMessage {
    pub work_id: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<ViewHeader>,
    pub min_time: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// A potential solution submitted by a rendering peer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitWorkMessage {
    pub work_id: i32,
    pub header: ViewHeader,
}

/// The result of submitted work.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitWorkResultMessage {
    pub work_id: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let msg = Message::GetViewByHeight(GetViewByHeightMessage { height: 7 });
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"type":"get_view_by_height","body":{"height":7}}"#);

        let back: Message = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            back,
            Message::GetViewByHeight(GetViewByHeightMessage { height: 7 })
        ));
    }

    #[test]
    fn empty_messages_carry_no_body() {
        let json = serde_json::to_string(&Message::GetTipHeader).unwrap();
        assert_eq!(json, r#"{"type":"get_tip_header"}"#);
        let back: Message = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Message::GetTipHeader));
    }

    #[test]
    fn snake_case_type_tags() {
        let msg = Message::PushConsiderationResult(PushConsiderationResultMessage {
            consideration_id: ConsiderationID([1; 32]),
            error: String::new(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.starts_with(r#"{"type":"push_consideration_result""#));
        assert!(!json.contains("error"));
    }
}
