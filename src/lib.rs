//! Core of a zap board client: paid message boards on Nostr.
//!
//! Messages are admitted when a Lightning payment proven by a NIP-57 zap
//! receipt names the board. This crate covers the protocol side: a relay
//! multiplexer, the event codec, the LNURL payment handshake, receipt
//! correlation into a live feed, and slug reservations resolved without a
//! coordinator.

pub mod board;
pub mod cache;
pub mod codec;
pub mod config;
pub mod event;
pub mod feed;
pub mod filter;
pub mod payment;
pub mod premium;
pub mod relay;
pub mod signer;
pub mod slug;

#[cfg(test)]
pub(crate) mod testing;
