//! Receipt correlation and the live message feed of a board.
//!
//! The [`Correlator`] owns one relay subscription for zap receipts addressed
//! to a board creator and turns matching receipts into [`ZapMessage`]s. The
//! [`Feed`] holding the seen-set and the messages belongs to the caller, so
//! resubscribing after a board change can keep or drop accumulated state.

use std::collections::HashSet;

use crate::{
    codec::decode_zap_receipt,
    event::{Event, KIND_ZAP_RECEIPT},
    filter::Filter,
    relay::{RelayPool, Subscription, SubscriptionItem},
};

/// Paid message accepted onto a board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZapMessage {
    /// Id of the receipt event that proved the payment.
    pub id: String,
    pub board_id: String,
    pub message: String,
    /// Whole sats.
    pub amount: u64,
    pub sender: Option<String>,
    pub display_name: String,
    /// Receipt creation time, Unix seconds.
    pub timestamp: u64,
}

/// Append-only set of messages with derived views.
#[derive(Debug, Default, Clone)]
pub struct Feed {
    seen: HashSet<String>,
    messages: Vec<ZapMessage>,
}

impl Feed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `msg` unless its id was seen before. Returns whether it was added.
    pub fn insert(&mut self, msg: ZapMessage) -> bool {
        if !self.seen.insert(msg.id.clone()) {
            return false;
        }
        self.messages.push(msg);
        true
    }

    /// Messages in arrival order.
    pub fn messages(&self) -> &[ZapMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn total_amount(&self) -> u64 {
        self.messages.iter().map(|m| m.amount).sum()
    }

    /// Newest first; equal timestamps keep arrival order.
    pub fn by_time(&self) -> Vec<&ZapMessage> {
        let mut out: Vec<&ZapMessage> = self.messages.iter().collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out
    }

    /// Three largest payments; ties keep time order.
    pub fn leaderboard(&self) -> Vec<&ZapMessage> {
        let mut out = self.by_time();
        out.sort_by(|a, b| b.amount.cmp(&a.amount));
        out.truncate(3);
        out
    }
}

/// Lifecycle of a [`Correlator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorState {
    Idle,
    /// Stored receipts are still arriving.
    Subscribing,
    /// Backlog exhausted; only live receipts follow.
    Live,
}

/// Item produced by [`Correlator::next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedUpdate {
    /// A new message was added to the feed.
    Message(ZapMessage),
    /// Historical receipts are exhausted.
    Live,
}

/// Board and identity a correlator is tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationTarget {
    pub board_id: String,
    /// Identity zaps are addressed to, the board creator.
    pub recipient: String,
}

/// Turn a receipt into a message for `target`, or `None` when the receipt is
/// malformed or belongs elsewhere.
pub fn correlate(ev: &Event, target: &CorrelationTarget) -> Option<ZapMessage> {
    let receipt = decode_zap_receipt(ev)?;
    if receipt.board_id.as_deref() != Some(target.board_id.as_str()) {
        return None;
    }
    if receipt.recipient.as_deref() != Some(target.recipient.as_str()) {
        return None;
    }
    Some(ZapMessage {
        id: receipt.receipt_id,
        board_id: target.board_id.clone(),
        message: receipt.message,
        amount: receipt.amount,
        sender: receipt.sender,
        display_name: receipt.display_name,
        timestamp: receipt.created_at,
    })
}

/// Subscription state machine `Idle -> Subscribing -> Live`.
pub struct Correlator {
    pool: RelayPool,
    state: CorrelatorState,
    target: Option<CorrelationTarget>,
    subscription: Option<Subscription>,
}

impl Correlator {
    pub fn new(pool: RelayPool) -> Self {
        Self {
            pool,
            state: CorrelatorState::Idle,
            target: None,
            subscription: None,
        }
    }

    pub fn state(&self) -> CorrelatorState {
        self.state
    }

    pub fn target(&self) -> Option<&CorrelationTarget> {
        self.target.as_ref()
    }

    /// Start tracking `target`, replacing any current subscription.
    ///
    /// Without `since` the whole receipt history is replayed; with it only
    /// receipts from that time on are considered, which is how payment
    /// detection waits for one fresh receipt.
    pub fn subscribe(&mut self, target: CorrelationTarget, since: Option<u64>) {
        self.unsubscribe();
        let mut filter = Filter::new()
            .kind(KIND_ZAP_RECEIPT)
            .tag("p", target.recipient.clone());
        if let Some(since) = since {
            filter = filter.since(since);
        }
        tracing::debug!(board = %target.board_id, ?since, "subscribing to receipts");
        self.subscription = Some(self.pool.subscribe(filter));
        self.target = Some(target);
        self.state = CorrelatorState::Subscribing;
    }

    /// Wait for the next feed change, adding new messages to `feed`.
    ///
    /// Returns `None` when idle or once every relay has gone away.
    pub async fn next(&mut self, feed: &mut Feed) -> Option<FeedUpdate> {
        loop {
            let (Some(sub), Some(target)) = (self.subscription.as_mut(), self.target.as_ref())
            else {
                return None;
            };
            let Some(item) = sub.next().await else {
                tracing::debug!(board = %target.board_id, "receipt subscription ended");
                self.unsubscribe();
                return None;
            };
            match item {
                SubscriptionItem::EndOfStoredEvents => {
                    self.state = CorrelatorState::Live;
                    return Some(FeedUpdate::Live);
                }
                SubscriptionItem::Event(ev) => {
                    let Some(msg) = correlate(&ev, target) else {
                        tracing::debug!(id = %ev.id, "receipt ignored");
                        continue;
                    };
                    if feed.insert(msg.clone()) {
                        return Some(FeedUpdate::Message(msg));
                    }
                }
            }
        }
    }

    /// Close the subscription and return to `Idle`. The feed is left as is.
    pub fn unsubscribe(&mut self) {
        if let Some(mut sub) = self.subscription.take() {
            sub.close();
        }
        self.target = None;
        self.state = CorrelatorState::Idle;
    }
}
