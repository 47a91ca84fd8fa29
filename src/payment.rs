//! Payment request builder for zap boards.
//!
//! Resolves a payout address through its LNURL-pay descriptor, signs a zap
//! request with a one-time key and trades it for a Lightning invoice at the
//! descriptor's callback. Every stage either succeeds or aborts the whole
//! operation with one [`PaymentError`]; nothing is retried here.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::{
    codec::{encode_zap_request, validate_zap_request, ZapRequestParams},
    event::Event,
    signer::{Keys, SignerError},
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors surfaced while building a payment request.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("invalid payout address: {0}")]
    InvalidAddress(String),
    #[error("payout address not found: {0}")]
    AddressNotFound(String),
    #[error("payout address does not support zaps: {0}")]
    UnsupportedAddress(String),
    #[error("amount {amount_msats} msats outside {min}..={max}")]
    AmountOutOfRange { amount_msats: u64, min: u64, max: u64 },
    #[error("invalid zap request: {0}")]
    InvalidRequest(String),
    #[error("invoice callback failed: {0}")]
    CallbackError(String),
    #[error("signing failed: {0}")]
    Signing(#[from] SignerError),
}

/// Parameters of one board payment.
#[derive(Debug, Clone)]
pub struct InvoiceRequest<'a> {
    /// Payout address of the board, `user@domain`.
    pub address: &'a str,
    /// Amount in sats.
    pub amount: u64,
    pub message: &'a str,
    pub board_id: &'a str,
    /// Identity the zap is addressed to, usually the board creator.
    pub recipient: &'a str,
    pub display_name: Option<&'a str>,
}

/// Payable invoice together with the zap request it commits to.
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    /// BOLT11 payment request string.
    pub invoice: String,
    pub zap_request: Event,
}

/// LNURL-pay descriptor served from `/.well-known/lnurlp/<user>`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayDescriptor {
    pub callback: Option<String>,
    #[serde(default)]
    pub allows_nostr: bool,
    pub nostr_pubkey: Option<String>,
    pub min_sendable: Option<u64>,
    pub max_sendable: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CallbackResponse {
    pr: Option<String>,
    status: Option<String>,
    reason: Option<String>,
}

/// Split `user@domain` into its parts.
pub fn parse_address(address: &str) -> Result<(&str, &str), PaymentError> {
    let invalid = || PaymentError::InvalidAddress(address.to_string());
    if address.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (user, domain) = address.split_once('@').ok_or_else(invalid)?;
    if user.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) if !host.is_empty() && !tld.is_empty() => Ok((user, domain)),
        _ => Err(invalid()),
    }
}

/// Builds zap-backed payment requests over HTTP.
#[derive(Clone)]
pub struct PaymentRequestBuilder {
    client: Client,
    scheme: String,
    relays: Vec<String>,
}

impl PaymentRequestBuilder {
    /// `relays` are written into every zap request so the payment provider
    /// knows where to publish the receipt.
    pub fn new(relays: Vec<String>) -> Result<Self, PaymentError> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| PaymentError::AddressNotFound(e.to_string()))?;
        Ok(Self {
            client,
            scheme: "https".into(),
            relays,
        })
    }

    /// Use another URL scheme for descriptor lookups (plain `http` for local
    /// endpoints).
    pub fn with_scheme(mut self, scheme: &str) -> Self {
        self.scheme = scheme.to_string();
        self
    }

    /// Fetch the LNURL-pay descriptor for `address`.
    pub async fn resolve(&self, address: &str) -> Result<PayDescriptor, PaymentError> {
        let (user, domain) = parse_address(address)?;
        let url = format!("{}://{domain}/.well-known/lnurlp/{user}", self.scheme);
        tracing::debug!(%url, "resolving payout address");
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| PaymentError::AddressNotFound(format!("{address}: {e}")))?;
        if !resp.status().is_success() {
            return Err(PaymentError::AddressNotFound(format!(
                "{address}: HTTP {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| PaymentError::UnsupportedAddress(format!("unreadable descriptor: {e}")))
    }

    /// Check that `address` resolves to a usable payment endpoint.
    pub async fn verify_address(&self, address: &str) -> Result<(), PaymentError> {
        let descriptor = self.resolve(address).await?;
        if descriptor.callback.is_none() || descriptor.min_sendable.is_none() {
            return Err(PaymentError::UnsupportedAddress(
                "descriptor lacks callback or minSendable".into(),
            ));
        }
        Ok(())
    }

    /// Run the full handshake and return a payable invoice.
    pub async fn build(&self, req: &InvoiceRequest<'_>) -> Result<PaymentRequest, PaymentError> {
        let descriptor = self.resolve(req.address).await?;
        let has_pubkey = descriptor.nostr_pubkey.as_deref().map_or(false, |k| !k.is_empty());
        if !descriptor.allows_nostr || !has_pubkey {
            return Err(PaymentError::UnsupportedAddress(req.address.to_string()));
        }
        let callback = descriptor
            .callback
            .as_deref()
            .ok_or_else(|| PaymentError::UnsupportedAddress("descriptor has no callback".into()))?;

        let amount_msats = req.amount.saturating_mul(1000);
        let min = descriptor.min_sendable.unwrap_or(1);
        let max = descriptor.max_sendable.unwrap_or(u64::MAX);
        if amount_msats == 0 || amount_msats < min || amount_msats > max {
            return Err(PaymentError::AmountOutOfRange {
                amount_msats,
                min,
                max,
            });
        }

        // One-time key: payers stay anonymous toward the relays.
        let keys = Keys::generate();
        let zap_request = keys.sign(encode_zap_request(&ZapRequestParams {
            recipient: req.recipient,
            amount_msats,
            message: req.message,
            board_id: req.board_id,
            display_name: req.display_name,
            relays: &self.relays,
        }))?;
        validate_zap_request(&zap_request).map_err(PaymentError::InvalidRequest)?;

        let invoice = self.request_invoice(callback, amount_msats, &zap_request).await?;
        tracing::info!(board = %req.board_id, amount = req.amount, "invoice issued");
        Ok(PaymentRequest {
            invoice,
            zap_request,
        })
    }

    async fn request_invoice(
        &self,
        callback: &str,
        amount_msats: u64,
        zap_request: &Event,
    ) -> Result<String, PaymentError> {
        let mut url = Url::parse(callback)
            .map_err(|e| PaymentError::CallbackError(format!("bad callback url: {e}")))?;
        let nostr = serde_json::to_string(zap_request)
            .map_err(|e| PaymentError::InvalidRequest(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("amount", &amount_msats.to_string())
            .append_pair("nostr", &nostr);
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| PaymentError::CallbackError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(PaymentError::CallbackError(format!("HTTP {}", resp.status())));
        }
        let body: CallbackResponse = resp
            .json()
            .await
            .map_err(|e| PaymentError::CallbackError(format!("unreadable response: {e}")))?;
        if body.status.as_deref() == Some("ERROR") {
            return Err(PaymentError::CallbackError(
                body.reason.unwrap_or_else(|| "invoice generation failed".into()),
            ));
        }
        body.pr
            .filter(|pr| !pr.is_empty())
            .ok_or_else(|| PaymentError::CallbackError("no invoice returned".into()))
    }
}
