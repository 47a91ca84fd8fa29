//! Premium listing payments.
//!
//! Listing a board publicly costs a fixed zap to the service's own payout
//! address. The zap message names the board and the paying user, and a
//! receipt carrying that message with at least the premium amount proves the
//! payment.

use std::time::Duration;

use crate::{
    event::{unix_now, KIND_ZAP_RECEIPT},
    feed::{correlate, CorrelationTarget, Correlator, Feed, FeedUpdate, ZapMessage},
    filter::Filter,
    payment::{InvoiceRequest, PaymentError, PaymentRequest, PaymentRequestBuilder},
    relay::RelayPool,
};

/// Premium price in sats.
pub const PREMIUM_AMOUNT: u64 = 10;
pub const PREMIUM_ADDRESS: &str = "zapit@coinos.io";
pub const PREMIUM_RECIPIENT: &str =
    "72bdbc57bdd6dfc4e62685051de8041d148c3c68fe42bf301f71aa6cf53e52fb";
/// How long [`PremiumService::monitor`] waits for a live receipt by default.
pub const MONITOR_TIMEOUT: Duration = Duration::from_secs(300);

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const HISTORY_LIMIT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum PremiumError {
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error("payment confirmation timed out")]
    Timeout,
    #[error("receipt subscription ended before a payment arrived")]
    SubscriptionEnded,
}

/// Zap message binding a premium payment to a board and user.
pub fn premium_message(board_id: &str, user_pubkey: &str) -> String {
    format!("premium-board-{}-{}", prefix(board_id), prefix(user_pubkey))
}

fn prefix(s: &str) -> &str {
    s.get(..8).unwrap_or(s)
}

fn pays_premium(msg: &ZapMessage, expected: &str) -> bool {
    msg.amount >= PREMIUM_AMOUNT && msg.message.to_lowercase().contains(&expected.to_lowercase())
}

#[derive(Clone)]
pub struct PremiumService {
    pool: RelayPool,
    payments: PaymentRequestBuilder,
    address: String,
    recipient: String,
    query_timeout: Duration,
}

impl PremiumService {
    pub fn new(pool: RelayPool, payments: PaymentRequestBuilder) -> Self {
        Self {
            pool,
            payments,
            address: PREMIUM_ADDRESS.into(),
            recipient: PREMIUM_RECIPIENT.into(),
            query_timeout: QUERY_TIMEOUT,
        }
    }

    /// Collect premium payments at another payout address and identity.
    pub fn with_recipient(mut self, address: &str, recipient: &str) -> Self {
        self.address = address.into();
        self.recipient = recipient.into();
        self
    }

    pub fn with_query_timeout(mut self, wait: Duration) -> Self {
        self.query_timeout = wait;
        self
    }

    fn target(&self, board_id: &str) -> CorrelationTarget {
        CorrelationTarget {
            board_id: board_id.into(),
            recipient: self.recipient.clone(),
        }
    }

    /// Invoice for the premium listing of `board_id` paid by `user_pubkey`.
    pub async fn invoice(
        &self,
        board_id: &str,
        user_pubkey: &str,
    ) -> Result<PaymentRequest, PremiumError> {
        let message = premium_message(board_id, user_pubkey);
        let req = InvoiceRequest {
            address: &self.address,
            amount: PREMIUM_AMOUNT,
            message: &message,
            board_id,
            recipient: &self.recipient,
            display_name: None,
        };
        Ok(self.payments.build(&req).await?)
    }

    /// Look through recent receipts for an existing premium payment.
    pub async fn verify(&self, board_id: &str, user_pubkey: &str) -> bool {
        let target = self.target(board_id);
        let expected = premium_message(board_id, user_pubkey);
        let filter = Filter::new()
            .kind(KIND_ZAP_RECEIPT)
            .tag("p", self.recipient.clone())
            .limit(HISTORY_LIMIT);
        self.pool
            .fetch_first(filter, self.query_timeout, |ev| {
                correlate(ev, &target).filter(|m| pays_premium(m, &expected))
            })
            .await
            .is_some()
    }

    /// Wait up to `wait` for a premium receipt created from now on.
    pub async fn monitor(
        &self,
        board_id: &str,
        user_pubkey: &str,
        wait: Duration,
    ) -> Result<ZapMessage, PremiumError> {
        let expected = premium_message(board_id, user_pubkey);
        let mut correlator = Correlator::new(self.pool.clone());
        let mut feed = Feed::new();
        correlator.subscribe(self.target(board_id), Some(unix_now()));
        tracing::info!(board = %board_id, %expected, "waiting for premium payment");
        let confirmed = async {
            loop {
                match correlator.next(&mut feed).await {
                    Some(FeedUpdate::Message(m)) if pays_premium(&m, &expected) => return Ok(m),
                    Some(FeedUpdate::Message(m)) => {
                        tracing::debug!(amount = m.amount, "receipt does not settle premium");
                    }
                    Some(FeedUpdate::Live) => {}
                    None => return Err(PremiumError::SubscriptionEnded),
                }
            }
        };
        let res = tokio::time::timeout(wait, confirmed)
            .await
            .unwrap_or(Err(PremiumError::Timeout));
        correlator.unsubscribe();
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::tests::receipt_for,
        payment::tests::{spawn_lnurl, zap_descriptor},
        signer::Keys,
        testing::MockRelay,
    };
    use axum::http::StatusCode;
    use serde_json::json;

    const BOARD: &str = "0123456789abcdef";
    const USER: &str = "fedcba9876543210";

    fn recipient() -> String {
        "cd".repeat(32)
    }

    async fn service(relay: &MockRelay) -> PremiumService {
        let (address, _mock) = spawn_lnurl(
            StatusCode::OK,
            zap_descriptor,
            StatusCode::OK,
            json!({ "pr": "lnbc100n1premium" }),
        )
        .await;
        let pool = RelayPool::new(vec![relay.url.clone()], None, true);
        let payments = PaymentRequestBuilder::new(vec![]).unwrap().with_scheme("http");
        PremiumService::new(pool, payments)
            .with_recipient(&address, &recipient())
            .with_query_timeout(Duration::from_secs(3))
    }

    #[test]
    fn message_uses_short_prefixes() {
        assert_eq!(premium_message(BOARD, USER), "premium-board-01234567-fedcba98");
        assert_eq!(premium_message("ab", "cd"), "premium-board-ab-cd");
    }

    #[tokio::test]
    async fn invoice_carries_premium_message() {
        let relay = MockRelay::start().await;
        let svc = service(&relay).await;
        let req = svc.invoice(BOARD, USER).await.unwrap();
        assert_eq!(req.invoice, "lnbc100n1premium");
        assert_eq!(req.zap_request.content, premium_message(BOARD, USER));
        assert_eq!(req.zap_request.tag_value("amount"), Some("10000"));
        assert_eq!(req.zap_request.tag_value("p"), Some(recipient().as_str()));
    }

    #[tokio::test]
    async fn verify_scans_history() {
        let relay = MockRelay::start().await;
        let provider = Keys::generate();
        let msg = premium_message(BOARD, USER);
        relay.seed(receipt_for(&provider, &recipient(), BOARD, &msg, 5_000, None, 1));
        let svc = service(&relay).await;
        assert!(!svc.verify(BOARD, USER).await);
        let shouted = msg.to_uppercase();
        relay.seed(receipt_for(&provider, &recipient(), BOARD, &shouted, 10_000, None, 2));
        assert!(svc.verify(BOARD, USER).await);
        assert!(!svc.verify(BOARD, "0000000000").await);
    }

    #[tokio::test]
    async fn monitor_confirms_live_receipt() {
        let relay = MockRelay::start().await;
        let provider = Keys::generate();
        let svc = service(&relay).await;
        let msg = premium_message(BOARD, USER);
        let waiter = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.monitor(BOARD, USER, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        let (to, now) = (recipient(), unix_now());
        relay.push_live(receipt_for(&provider, &to, BOARD, "unrelated", 50_000, None, now));
        relay.push_live(receipt_for(&provider, &to, BOARD, &msg, 21_000, None, now));
        let confirmed = waiter.await.unwrap().unwrap();
        assert_eq!(confirmed.amount, 21);
    }

    #[tokio::test]
    async fn monitor_times_out() {
        let relay = MockRelay::start().await;
        let svc = service(&relay).await;
        let res = svc.monitor(BOARD, USER, Duration::from_millis(500)).await;
        assert!(matches!(res, Err(PremiumError::Timeout)));
    }
}
