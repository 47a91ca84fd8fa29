//! Encoding and decoding of the event kinds used by zap boards.
//!
//! This is the only place that looks inside raw tags and content. Decoders are
//! defensive: malformed input yields `None`, never a panic, so a bad event from
//! an untrusted relay cannot abort a subscription.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{
    tag_value, unix_now, Event, Tag, UnsignedEvent, KIND_BOARD_CONFIG, KIND_SLUG_RESERVATION,
    KIND_ZAP_RECEIPT, KIND_ZAP_REQUEST,
};

/// Minimum zap amount assumed when a config carries no `min_zap` tag.
pub const DEFAULT_MIN_ZAP: u64 = 1000;
/// Display name for zaps that carry none.
pub const ANONYMOUS: &str = "Anonymous";
/// Topic tag marking a board as listed in public discovery.
pub const EXPLORE_MARKER: &str = "zapboard";
/// Topic tag carried by every slug reservation.
pub const SLUG_MARKER: &str = "zapboard-slug";
/// Price advertised in reservations that omit an `amount` tag.
pub const DEFAULT_SLUG_PRICE: u64 = 2100;

/// Board configuration as published in a replaceable event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardConfig {
    pub board_id: String,
    pub board_name: String,
    /// Lightning address the board is paid through.
    pub lightning_address: String,
    /// Advisory minimum per message, in sats.
    pub min_zap_amount: u64,
    pub creator_pubkey: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_slug: Option<String>,
    #[serde(default)]
    pub is_explorable: bool,
    /// Creation time, Unix seconds.
    pub created_at: u64,
}

/// Descriptive fields carried in the board config content body.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoardContent {
    #[serde(default)]
    board_name: Option<String>,
    #[serde(default)]
    min_zap_amount: Option<u64>,
    #[serde(default)]
    lightning_address: Option<String>,
    #[serde(default)]
    created_at: Option<u64>,
    #[serde(default)]
    is_explorable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    logo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    custom_slug: Option<String>,
}

/// Build the replaceable board config event.
pub fn encode_board_config(config: &BoardConfig) -> UnsignedEvent {
    let mut tags = vec![
        Tag::new(["d", config.board_id.as_str()]),
        Tag::new(["title", config.board_name.as_str()]),
        Tag::new(["ln", config.lightning_address.as_str()]),
        Tag::new(["min_zap".to_string(), config.min_zap_amount.to_string()]),
    ];
    if config.is_explorable {
        tags.push(Tag::new(["t", EXPLORE_MARKER]));
    }
    let content = BoardContent {
        board_name: Some(config.board_name.clone()),
        min_zap_amount: Some(config.min_zap_amount),
        lightning_address: Some(config.lightning_address.clone()),
        created_at: Some(config.created_at),
        is_explorable: Some(config.is_explorable),
        logo_url: config.logo_url.clone(),
        custom_slug: config.custom_slug.clone(),
    };
    let body = serde_json::to_string(&content).unwrap_or_else(|_| "{}".into());
    UnsignedEvent::new(KIND_BOARD_CONFIG, tags, body)
}

/// Parse a board config event. Tags win over content for the indexed fields.
pub fn decode_board_config(ev: &Event) -> Option<BoardConfig> {
    if ev.kind != KIND_BOARD_CONFIG {
        return None;
    }
    let board_id = ev.tag_value("d")?.to_string();
    let content: BoardContent = match serde_json::from_str(&ev.content) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(id = %ev.id, error = %e, "board config content unreadable");
            return None;
        }
    };
    let board_name = content
        .board_name
        .or_else(|| ev.tag_value("title").map(str::to_string))
        .unwrap_or_default();
    let min_zap_amount = ev
        .tag_value("min_zap")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MIN_ZAP);
    let lightning_address = ev.tag_value("ln").unwrap_or_default().to_string();
    let listed = ev
        .tags
        .iter()
        .any(|t| t.name() == Some("t") && t.value() == Some(EXPLORE_MARKER));
    Some(BoardConfig {
        board_id,
        board_name,
        lightning_address,
        min_zap_amount,
        creator_pubkey: ev.pubkey.clone(),
        logo_url: content.logo_url,
        custom_slug: content.custom_slug,
        is_explorable: content.is_explorable.unwrap_or(false) || listed,
        created_at: content.created_at.unwrap_or(ev.created_at),
    })
}

/// Correlation data recovered from a zap receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapReceipt {
    /// Id of the receipt event.
    pub receipt_id: String,
    /// `p` tag of the receipt: who got paid.
    pub recipient: Option<String>,
    /// `board` tag of the embedded request.
    pub board_id: Option<String>,
    pub message: String,
    /// Whole sats, floored from the embedded millisat amount.
    pub amount: u64,
    /// Author of the embedded request.
    pub sender: Option<String>,
    pub display_name: String,
    /// Receipt creation time, Unix seconds.
    pub created_at: u64,
}

/// Extract the embedded zap request from a receipt's `description` tag.
pub fn decode_zap_receipt(ev: &Event) -> Option<ZapReceipt> {
    if ev.kind != KIND_ZAP_RECEIPT {
        return None;
    }
    let description = ev.tag_value("description")?;
    let request: Value = match serde_json::from_str(description) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(id = %ev.id, error = %e, "zap request description unreadable");
            return None;
        }
    };
    if !request.is_object() {
        return None;
    }
    let tags: Vec<Tag> = request
        .get("tags")
        .cloned()
        .and_then(|t| serde_json::from_value(t).ok())
        .unwrap_or_default();
    let millisats: u64 = tag_value(&tags, "amount")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    Some(ZapReceipt {
        receipt_id: ev.id.clone(),
        recipient: ev.tag_value("p").map(str::to_string),
        board_id: tag_value(&tags, "board").map(str::to_string),
        message: request
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string(),
        amount: millisats / 1000,
        sender: request
            .get("pubkey")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        display_name: tag_value(&tags, "displayName")
            .unwrap_or(ANONYMOUS)
            .to_string(),
        created_at: ev.created_at,
    })
}

/// Parameters of a zap request that ties a payment to a board.
#[derive(Debug, Clone)]
pub struct ZapRequestParams<'a> {
    /// Board creator receiving the zap.
    pub recipient: &'a str,
    pub amount_msats: u64,
    pub message: &'a str,
    pub board_id: &'a str,
    pub display_name: Option<&'a str>,
    /// Relays the payment provider should publish the receipt to.
    pub relays: &'a [String],
}

/// Build the zap request body (kind 9734).
pub fn encode_zap_request(params: &ZapRequestParams<'_>) -> UnsignedEvent {
    let mut relays = vec!["relays".to_string()];
    relays.extend(params.relays.iter().cloned());
    let mut tags = vec![
        Tag(relays),
        Tag::new(["amount".to_string(), params.amount_msats.to_string()]),
        Tag::new(["p", params.recipient]),
        Tag::new(["board", params.board_id]),
    ];
    if let Some(name) = params.display_name.filter(|n| !n.trim().is_empty()) {
        tags.push(Tag::new(["displayName", name]));
    }
    UnsignedEvent::new(KIND_ZAP_REQUEST, tags, params.message)
}

/// Structural and cryptographic checks on a signed zap request.
pub fn validate_zap_request(ev: &Event) -> Result<(), String> {
    if ev.kind != KIND_ZAP_REQUEST {
        return Err(format!("wrong kind {}", ev.kind));
    }
    ev.verify()
        .map_err(|e| format!("invalid signature on zap request: {e}"))?;
    let p = ev.tag_value("p").ok_or("zap request has no 'p' tag")?;
    if p.len() != 64 || hex::decode(p).is_err() {
        return Err("zap request 'p' tag is not valid hex".into());
    }
    if ev.content.trim().is_empty() {
        return Err("zap request message is empty".into());
    }
    Ok(())
}

/// A claim on a short board name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlugReservation {
    pub slug: String,
    pub board_id: String,
    /// Identity that signed the claim.
    pub user_pubkey: String,
    /// Reference to the payment that bought the slug.
    pub payment_hash: String,
    pub amount: u64,
    /// Claim time, Unix seconds.
    pub reserved_at: u64,
    pub event_id: String,
}

/// Build the slug reservation event.
pub fn encode_slug_reservation(
    slug: &str,
    board_id: &str,
    payment: &str,
    amount: u64,
) -> UnsignedEvent {
    let tags = vec![
        Tag::new(["d", slug]),
        Tag::new(["b", board_id]),
        Tag::new(["payment", payment]),
        Tag::new(["amount".to_string(), amount.to_string()]),
        Tag::new(["t", SLUG_MARKER]),
    ];
    let content = serde_json::json!({ "reservedAt": unix_now() * 1000 }).to_string();
    UnsignedEvent::new(KIND_SLUG_RESERVATION, tags, content)
}

/// Parse a slug reservation; `d`, `b` and `payment` are required.
pub fn decode_slug_reservation(ev: &Event) -> Option<SlugReservation> {
    if ev.kind != KIND_SLUG_RESERVATION {
        return None;
    }
    Some(SlugReservation {
        slug: ev.tag_value("d")?.to_string(),
        board_id: ev.tag_value("b")?.to_string(),
        payment_hash: ev.tag_value("payment")?.to_string(),
        user_pubkey: ev.pubkey.clone(),
        amount: ev
            .tag_value("amount")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SLUG_PRICE),
        reserved_at: ev.created_at,
        event_id: ev.id.clone(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::signer::Keys;

    pub(crate) fn sample_config(creator: &str) -> BoardConfig {
        BoardConfig {
            board_id: "ab".repeat(32),
            board_name: "Coffee wall".into(),
            lightning_address: "alice@example.com".into(),
            min_zap_amount: 1000,
            creator_pubkey: creator.into(),
            logo_url: None,
            custom_slug: None,
            is_explorable: false,
            created_at: 1_700_000_000,
        }
    }

    /// Signed zap request + receipt pair as a payment provider would publish.
    pub(crate) fn receipt_for(
        provider: &Keys,
        recipient: &str,
        board_id: &str,
        message: &str,
        msats: u64,
        display_name: Option<&str>,
        created_at: u64,
    ) -> Event {
        let payer = Keys::generate();
        let request = payer
            .sign(encode_zap_request(&ZapRequestParams {
                recipient,
                amount_msats: msats,
                message,
                board_id,
                display_name,
                relays: &[],
            }))
            .unwrap();
        let mut receipt = UnsignedEvent::new(
            KIND_ZAP_RECEIPT,
            vec![
                Tag::new(["p", recipient]),
                Tag::new(["description".to_string(), serde_json::to_string(&request).unwrap()]),
            ],
            "",
        );
        receipt.created_at = created_at;
        provider.sign(receipt).unwrap()
    }

    #[test]
    fn board_config_round_trip() {
        let keys = Keys::generate();
        let mut config = sample_config(&keys.public_key_hex());
        config.logo_url = Some("https://example.com/logo.png".into());
        let ev = keys.sign(encode_board_config(&config)).unwrap();
        let decoded = decode_board_config(&ev).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn explorable_config_carries_marker_tag() {
        let keys = Keys::generate();
        let mut config = sample_config(&keys.public_key_hex());
        config.is_explorable = true;
        let unsigned = encode_board_config(&config);
        assert!(unsigned
            .tags
            .iter()
            .any(|t| t.0 == vec!["t".to_string(), EXPLORE_MARKER.to_string()]));
        let plain = encode_board_config(&sample_config("x"));
        assert!(!plain.tags.iter().any(|t| t.name() == Some("t")));
    }

    #[test]
    fn board_config_defaults_for_missing_tags() {
        let keys = Keys::generate();
        let ev = keys
            .sign(UnsignedEvent::new(
                KIND_BOARD_CONFIG,
                vec![Tag::new(["d", "board"])],
                r#"{"boardName":"Bare"}"#,
            ))
            .unwrap();
        let config = decode_board_config(&ev).unwrap();
        assert_eq!(config.min_zap_amount, DEFAULT_MIN_ZAP);
        assert_eq!(config.lightning_address, "");
        assert_eq!(config.created_at, ev.created_at);
        assert!(!config.is_explorable);
    }

    #[test]
    fn board_config_without_id_or_json_is_rejected() {
        let keys = Keys::generate();
        let no_d = keys
            .sign(UnsignedEvent::new(KIND_BOARD_CONFIG, vec![], "{}"))
            .unwrap();
        assert!(decode_board_config(&no_d).is_none());
        let bad_json = keys
            .sign(UnsignedEvent::new(
                KIND_BOARD_CONFIG,
                vec![Tag::new(["d", "board"])],
                "not json",
            ))
            .unwrap();
        assert!(decode_board_config(&bad_json).is_none());
    }

    #[test]
    fn receipt_decodes_embedded_request() {
        let provider = Keys::generate();
        let recipient = "cd".repeat(32);
        let ev = receipt_for(&provider, &recipient, "board-1", "gm", 500_000, Some("bob"), 42);
        let receipt = decode_zap_receipt(&ev).unwrap();
        assert_eq!(receipt.amount, 500);
        assert_eq!(receipt.message, "gm");
        assert_eq!(receipt.board_id.as_deref(), Some("board-1"));
        assert_eq!(receipt.display_name, "bob");
        assert_eq!(receipt.recipient, Some("cd".repeat(32)));
        assert_eq!(receipt.created_at, 42);
        assert!(receipt.sender.is_some());
    }

    #[test]
    fn receipt_amount_is_floored_and_name_defaults() {
        let provider = Keys::generate();
        let ev = receipt_for(&provider, &"cd".repeat(32), "b", "hi", 1_999, None, 1);
        let receipt = decode_zap_receipt(&ev).unwrap();
        assert_eq!(receipt.amount, 1);
        assert_eq!(receipt.display_name, ANONYMOUS);
    }

    #[test]
    fn malformed_receipts_yield_none() {
        let provider = Keys::generate();
        let missing = provider
            .sign(UnsignedEvent::new(KIND_ZAP_RECEIPT, vec![], ""))
            .unwrap();
        assert!(decode_zap_receipt(&missing).is_none());
        for desc in ["{not json", "[1,2,3]", "\"string\""] {
            let ev = provider
                .sign(UnsignedEvent::new(
                    KIND_ZAP_RECEIPT,
                    vec![Tag::new(["description", desc])],
                    "",
                ))
                .unwrap();
            assert!(decode_zap_receipt(&ev).is_none(), "{desc}");
        }
        let weird_tags = provider
            .sign(UnsignedEvent::new(
                KIND_ZAP_RECEIPT,
                vec![Tag::new(["description", r#"{"tags":"nope","content":5}"#])],
                "",
            ))
            .unwrap();
        let receipt = decode_zap_receipt(&weird_tags).unwrap();
        assert_eq!(receipt.amount, 0);
        assert_eq!(receipt.message, "");
        assert!(receipt.board_id.is_none());
    }

    #[test]
    fn zap_request_validation() {
        let payer = Keys::generate();
        let recipient = "cd".repeat(32);
        let params = ZapRequestParams {
            recipient: &recipient,
            amount_msats: 21_000,
            message: "hello board",
            board_id: "b1",
            display_name: Some("carol"),
            relays: &["wss://relay.example".to_string()],
        };
        let ev = payer.sign(encode_zap_request(&params)).unwrap();
        assert!(validate_zap_request(&ev).is_ok());
        assert_eq!(ev.tag_value("amount"), Some("21000"));
        assert_eq!(ev.tag_value("relays"), Some("wss://relay.example"));

        let blank = payer
            .sign(encode_zap_request(&ZapRequestParams {
                message: "   ",
                ..params.clone()
            }))
            .unwrap();
        assert!(validate_zap_request(&blank).is_err());

        let bad_p = payer
            .sign(encode_zap_request(&ZapRequestParams {
                recipient: "nothex",
                ..params
            }))
            .unwrap();
        assert!(validate_zap_request(&bad_p).is_err());
    }

    #[test]
    fn slug_reservation_round_trip() {
        let keys = Keys::generate();
        let ev = keys
            .sign(encode_slug_reservation("my-board", "abc", "p1", 2100))
            .unwrap();
        let r = decode_slug_reservation(&ev).unwrap();
        assert_eq!(r.slug, "my-board");
        assert_eq!(r.board_id, "abc");
        assert_eq!(r.payment_hash, "p1");
        assert_eq!(r.amount, 2100);
        assert_eq!(r.user_pubkey, keys.public_key_hex());
        assert_eq!(r.event_id, ev.id);
        assert_eq!(ev.tag_value("t"), Some(SLUG_MARKER));
    }

    #[test]
    fn slug_reservation_requires_core_tags() {
        let keys = Keys::generate();
        let ev = keys
            .sign(UnsignedEvent::new(
                KIND_SLUG_RESERVATION,
                vec![Tag::new(["d", "x"]), Tag::new(["b", "y"])],
                "",
            ))
            .unwrap();
        assert!(decode_slug_reservation(&ev).is_none());
    }
}
