//! Board lifecycle: creation, config publishing, lookup and discovery.

use std::{collections::BTreeMap, time::Duration};

use crate::{
    cache::{Cache, StoredBoard},
    codec::{decode_board_config, encode_board_config, BoardConfig, EXPLORE_MARKER},
    event::{unix_now, Event, KIND_BOARD_CONFIG, KIND_CONTACTS, KIND_PROFILE},
    filter::Filter,
    payment::{PaymentError, PaymentRequestBuilder},
    relay::{PublishOutcome, RelayPool, PUBLISH_TIMEOUT},
    signer::{generate_board_id, Keys, Signer, SignerError},
};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound of boards requested for the explore listing.
pub const EXPLORE_LIMIT: usize = 100;
/// Follows a publisher needs before listing boards publicly.
pub const MIN_FOLLOWS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("board name must not be empty")]
    EmptyName,
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error("a user identity is required for explorable boards")]
    IdentityRequired,
    #[error("board belongs to {expected}, signer is {actual}")]
    IdentityMismatch { expected: String, actual: String },
    #[error("board {0} not found")]
    NotFound(String),
    #[error("signing failed: {0}")]
    Signing(#[from] SignerError),
}

/// Input for [`BoardService::create`].
#[derive(Debug, Clone)]
pub struct NewBoard {
    pub name: String,
    /// Payout address, `user@domain`.
    pub address: String,
    /// Advisory minimum per message, in sats.
    pub min_zap: u64,
    pub explorable: bool,
    pub logo_url: Option<String>,
}

/// Whether a user may list boards publicly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eligibility {
    pub eligible: bool,
    pub reason: Option<String>,
    pub nip05: Option<String>,
}

impl Eligibility {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            eligible: false,
            reason: Some(reason.into()),
            nip05: None,
        }
    }
}

/// Judge a publisher from their profile and contact list.
pub fn check_eligibility(profile: Option<&Event>, contacts: Option<&Event>) -> Eligibility {
    let Some(profile) = profile else {
        return Eligibility::rejected("No profile found. Please create a Nostr profile first.");
    };
    let Ok(meta) = serde_json::from_str::<serde_json::Value>(&profile.content) else {
        return Eligibility::rejected("Invalid profile data");
    };
    let nip05 = meta
        .get("nip05")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let Some(nip05) = nip05 else {
        return Eligibility::rejected("NIP-05 identifier required. Please add one to your profile.");
    };
    let Some(contacts) = contacts else {
        return Eligibility::rejected("No contact list found. Please follow at least 10 users.");
    };
    let follows = contacts.tags.iter().filter(|t| t.name() == Some("p")).count();
    if follows < MIN_FOLLOWS {
        return Eligibility::rejected(format!(
            "You need to follow at least {MIN_FOLLOWS} users. Currently following: {follows}"
        ));
    }
    Eligibility {
        eligible: true,
        reason: None,
        nip05: Some(nip05.to_string()),
    }
}

/// One config per board id, newest boards first.
///
/// Only a board's creator may replace its config. The creator is the key the
/// board was created with when `known_creator` knows it, otherwise the author
/// of the oldest signed config for that id. Among the creator's configs the
/// newest wins.
fn resolve_configs<F>(events: &[Event], known_creator: F) -> Vec<BoardConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut by_board: BTreeMap<String, Vec<(&Event, BoardConfig)>> = BTreeMap::new();
    for ev in events {
        if let Err(e) = ev.verify() {
            tracing::debug!(id = %ev.id, error = %e, "skipping unverifiable board config");
            continue;
        }
        let Some(config) = decode_board_config(ev) else {
            tracing::debug!(id = %ev.id, "skipping undecodable board config");
            continue;
        };
        by_board.entry(config.board_id.clone()).or_default().push((ev, config));
    }
    let mut resolved: Vec<(u64, BoardConfig)> = by_board
        .into_iter()
        .filter_map(|(board_id, mut claims)| {
            claims.sort_by(|(a, _), (b, _)| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
            let creator = known_creator(&board_id)
                .or_else(|| claims.first().map(|(ev, _)| ev.pubkey.clone()))?;
            let total = claims.len();
            let mut own: Vec<_> = claims
                .into_iter()
                .filter(|(ev, _)| ev.pubkey == creator)
                .collect();
            if own.len() < total {
                tracing::debug!(
                    board = %board_id,
                    ignored = total - own.len(),
                    "ignoring configs not signed by the board creator"
                );
            }
            own.pop().map(|(ev, config)| (ev.created_at, config))
        })
        .collect();
    resolved.sort_by(|a, b| b.0.cmp(&a.0));
    resolved.into_iter().map(|(_, c)| c).collect()
}

/// Board operations over the relays, the local cache and payout lookups.
#[derive(Clone)]
pub struct BoardService {
    pool: RelayPool,
    cache: Cache,
    payments: PaymentRequestBuilder,
    query_timeout: Duration,
    publish_timeout: Duration,
}

impl BoardService {
    pub fn new(pool: RelayPool, cache: Cache, payments: PaymentRequestBuilder) -> Self {
        Self {
            pool,
            cache,
            payments,
            query_timeout: QUERY_TIMEOUT,
            publish_timeout: PUBLISH_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, query: Duration, publish: Duration) -> Self {
        self.query_timeout = query;
        self.publish_timeout = publish;
        self
    }

    /// Create a board and publish its first config.
    ///
    /// Explorable boards are signed by `user`, which must be a public
    /// identity. Other boards get a fresh key whose secret is kept in the
    /// local cache for later updates.
    pub async fn create(
        &self,
        new: NewBoard,
        user: Option<&dyn Signer>,
    ) -> Result<StoredBoard, BoardError> {
        let name = new.name.trim();
        if name.is_empty() {
            return Err(BoardError::EmptyName);
        }
        let user = user.filter(|u| !u.is_ephemeral());
        if new.explorable && user.is_none() {
            return Err(BoardError::IdentityRequired);
        }
        self.payments.verify_address(&new.address).await?;

        let board_keys = (!new.explorable).then(Keys::generate);
        let signer: &dyn Signer = match (&board_keys, user) {
            (Some(keys), _) => keys,
            (None, Some(user)) => user,
            (None, None) => return Err(BoardError::IdentityRequired),
        };
        let created_at = unix_now();
        let config = BoardConfig {
            board_id: generate_board_id(),
            board_name: name.to_string(),
            lightning_address: new.address.clone(),
            min_zap_amount: new.min_zap,
            creator_pubkey: signer.public_key().await?,
            logo_url: new.logo_url.clone(),
            custom_slug: None,
            is_explorable: new.explorable,
            created_at,
        };
        self.publish_config(&config, signer).await?;
        let stored = StoredBoard {
            board_id: config.board_id.clone(),
            config,
            created_at,
            board_key: board_keys.map(|k| k.secret_hex()),
        };
        self.cache.put_board(stored.clone());
        tracing::info!(board = %stored.board_id, explorable = new.explorable, "board created");
        Ok(stored)
    }

    /// Sign and publish `config` as its creator.
    pub async fn publish_config(
        &self,
        config: &BoardConfig,
        signer: &dyn Signer,
    ) -> Result<(Event, PublishOutcome), BoardError> {
        let actual = signer.public_key().await?;
        if actual != config.creator_pubkey {
            return Err(BoardError::IdentityMismatch {
                expected: config.creator_pubkey.clone(),
                actual,
            });
        }
        let event = signer.sign_event(encode_board_config(config)).await?;
        let outcome = self
            .pool
            .publish(std::slice::from_ref(&event), self.publish_timeout)
            .await;
        tracing::debug!(board = %config.board_id, ?outcome, "board config published");
        Ok((event, outcome))
    }

    /// Replace a board's config, signing with the stored board key when there
    /// is one and with `user` otherwise.
    pub async fn update(
        &self,
        config: BoardConfig,
        user: Option<&dyn Signer>,
    ) -> Result<Event, BoardError> {
        let stored = self.cache.board(&config.board_id);
        let board_keys = stored
            .as_ref()
            .and_then(|b| b.board_key.as_deref())
            .map(Keys::from_secret_hex)
            .transpose()?;
        let signer: &dyn Signer = match (&board_keys, user) {
            (Some(keys), _) if !config.is_explorable => keys,
            (Some(_), _) => return Err(BoardError::IdentityRequired),
            (None, Some(user)) => user,
            (None, None) => return Err(BoardError::IdentityRequired),
        };
        if config.is_explorable && signer.is_ephemeral() {
            return Err(BoardError::IdentityRequired);
        }
        let (event, _) = self.publish_config(&config, signer).await?;
        if let Some(mut stored) = stored {
            stored.config = config;
            self.cache.put_board(stored);
        }
        Ok(event)
    }

    /// Republish the board without its discovery marker.
    pub async fn remove_from_explore(
        &self,
        board_id: &str,
        user: Option<&dyn Signer>,
    ) -> Result<Event, BoardError> {
        let mut config = self
            .load_board(board_id)
            .await
            .ok_or_else(|| BoardError::NotFound(board_id.to_string()))?;
        config.is_explorable = false;
        self.update(config, user).await
    }

    /// Newest config for `board_id` signed by its creator, seen before end of
    /// stored events or the query timeout.
    pub async fn fetch_board_config(&self, board_id: &str) -> Option<BoardConfig> {
        let filter = Filter::new().kind(KIND_BOARD_CONFIG).tag("d", board_id);
        let events = self.pool.fetch(filter, self.query_timeout).await;
        let owned = self.cache.board(board_id).map(|b| b.config.creator_pubkey);
        resolve_configs(&events, |_| owned.clone())
            .into_iter()
            .find(|c| c.board_id == board_id)
    }

    /// Network first, then the owned-boards cache.
    pub async fn load_board(&self, board_id: &str) -> Option<BoardConfig> {
        if let Some(config) = self.fetch_board_config(board_id).await {
            return Some(config);
        }
        let cached = self.cache.board(board_id).map(|b| b.config);
        if cached.is_some() {
            tracing::debug!(board = %board_id, "board served from local cache");
        }
        cached
    }

    /// Publicly listed boards, newest config per board.
    pub async fn fetch_all_boards(&self) -> Vec<BoardConfig> {
        let filter = Filter::new()
            .kind(KIND_BOARD_CONFIG)
            .tag("t", EXPLORE_MARKER)
            .limit(EXPLORE_LIMIT);
        let events = self.pool.fetch(filter, self.query_timeout).await;
        let owned = self.cache.boards();
        let known_creator = |id: &str| {
            owned
                .iter()
                .find(|b| b.board_id == id)
                .map(|b| b.config.creator_pubkey.clone())
        };
        resolve_configs(&events, known_creator)
            .into_iter()
            .filter(|c| c.is_explorable)
            .collect()
    }

    /// Boards created from this client.
    pub fn my_boards(&self) -> Vec<StoredBoard> {
        self.cache.boards()
    }

    /// Check whether `pubkey` may publish explorable boards.
    pub async fn verify_user_eligibility(&self, pubkey: &str) -> Eligibility {
        let filter = Filter::new()
            .kinds([KIND_PROFILE, KIND_CONTACTS])
            .author(pubkey)
            .limit(10);
        let events = self.pool.fetch(filter, self.query_timeout).await;
        let newest = |kind: u32| {
            events
                .iter()
                .filter(|e| e.kind == kind && e.pubkey == pubkey)
                .max_by_key(|e| e.created_at)
        };
        check_eligibility(newest(KIND_PROFILE), newest(KIND_CONTACTS))
    }
}
