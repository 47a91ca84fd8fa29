//! Custom short names for boards, claimed through signed reservation events.
//!
//! There is no coordinator: claims are ordinary replaceable events on the
//! relays and any number of writers may race for the same slug. Reads settle
//! the race deterministically: the claim with the oldest `created_at` wins and
//! equal timestamps fall back to the smaller event id. `reserve` checks
//! availability right before publishing and looks again afterwards, which
//! narrows the window but cannot close it.

use std::time::Duration;

use crate::{
    cache::Cache,
    codec::{decode_slug_reservation, encode_slug_reservation, SlugReservation, DEFAULT_SLUG_PRICE},
    event::{Event, KIND_SLUG_RESERVATION},
    filter::Filter,
    relay::{RelayPool, LIGHT_PUBLISH_TIMEOUT},
    signer::{Signer, SignerError},
};

pub const MIN_SLUG_LEN: usize = 3;
pub const MAX_SLUG_LEN: usize = 30;

/// Names that collide with top-level routes.
pub const RESERVED_SLUGS: [&str; 9] = [
    "create", "pay", "board", "explore", "settings", "api", "admin", "zapme", "i",
];

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const RESOLVE_LIMIT: usize = 10;

/// Why a candidate slug is not acceptable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlugValidationError {
    #[error("slug must be at least 3 characters long")]
    TooShort,
    #[error("slug must be at most 30 characters long")]
    TooLong,
    #[error("slug can only contain lowercase letters, numbers, and hyphens")]
    InvalidCharacters,
    #[error("slug cannot start or end with a hyphen")]
    EdgeHyphen,
    #[error("slug cannot contain consecutive hyphens")]
    DoubleHyphen,
    #[error("slug is reserved")]
    Reserved,
}

#[derive(Debug, thiserror::Error)]
pub enum SlugError {
    #[error(transparent)]
    Invalid(#[from] SlugValidationError),
    #[error("slug is already taken by board {}", .0.board_id)]
    Unavailable(Box<SlugReservation>),
    #[error("a slug must be claimed by a public identity, not a one-time key")]
    SignerRequired,
    #[error("signing failed: {0}")]
    Signing(#[from] SignerError),
    #[error("an earlier claim binds the slug to board {board_id}")]
    LostRace { board_id: String },
}

/// Check the shape of a candidate slug.
pub fn validate_slug(slug: &str) -> Result<(), SlugValidationError> {
    if slug.len() < MIN_SLUG_LEN {
        return Err(SlugValidationError::TooShort);
    }
    if slug.len() > MAX_SLUG_LEN {
        return Err(SlugValidationError::TooLong);
    }
    if !slug
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return Err(SlugValidationError::InvalidCharacters);
    }
    if slug.starts_with('-') || slug.ends_with('-') {
        return Err(SlugValidationError::EdgeHyphen);
    }
    if slug.contains("--") {
        return Err(SlugValidationError::DoubleHyphen);
    }
    if RESERVED_SLUGS.contains(&slug) {
        return Err(SlugValidationError::Reserved);
    }
    Ok(())
}

/// Answer of [`SlugService::check_availability`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    pub available: bool,
    pub reason: Option<String>,
    /// Claim that makes the slug unavailable.
    pub existing: Option<SlugReservation>,
}

/// Oldest claim wins; equal timestamps fall back to the smaller id.
pub fn authoritative_claim<I>(claims: I) -> Option<SlugReservation>
where
    I: IntoIterator<Item = SlugReservation>,
{
    claims
        .into_iter()
        .min_by(|a, b| (a.reserved_at, &a.event_id).cmp(&(b.reserved_at, &b.event_id)))
}

/// Decode a claim for `slug`, skipping anything unsigned or mismatched.
fn claim_for(ev: &Event, slug: &str) -> Option<SlugReservation> {
    if let Err(e) = ev.verify() {
        tracing::debug!(id = %ev.id, error = %e, "ignoring unverifiable slug claim");
        return None;
    }
    decode_slug_reservation(ev).filter(|r| r.slug == slug)
}

/// Slug operations over a relay pool and the local resolution cache.
#[derive(Clone)]
pub struct SlugService {
    pool: RelayPool,
    cache: Cache,
    query_timeout: Duration,
    publish_timeout: Duration,
    price: u64,
}

impl SlugService {
    pub fn new(pool: RelayPool, cache: Cache) -> Self {
        Self {
            pool,
            cache,
            query_timeout: QUERY_TIMEOUT,
            publish_timeout: LIGHT_PUBLISH_TIMEOUT,
            price: DEFAULT_SLUG_PRICE,
        }
    }

    pub fn with_timeouts(mut self, query: Duration, publish: Duration) -> Self {
        self.query_timeout = query;
        self.publish_timeout = publish;
        self
    }

    /// Price written into new reservations, in sats.
    pub fn with_price(mut self, price: u64) -> Self {
        self.price = price;
        self
    }

    pub fn price(&self) -> u64 {
        self.price
    }

    /// Look for any existing claim on `slug`. A timeout counts as available.
    pub async fn check_availability(&self, slug: &str) -> Result<Availability, SlugError> {
        validate_slug(slug)?;
        let filter = Filter::new()
            .kind(KIND_SLUG_RESERVATION)
            .tag("d", slug)
            .limit(1);
        let existing = self
            .pool
            .fetch_first(filter, self.query_timeout, |ev| claim_for(ev, slug))
            .await;
        Ok(match existing {
            Some(claim) => Availability {
                available: false,
                reason: Some("Slug is already taken".into()),
                existing: Some(claim),
            },
            None => Availability {
                available: true,
                reason: None,
                existing: None,
            },
        })
    }

    /// Claim `slug` for `board_id` and return the reservation event id.
    ///
    /// After publishing, the relays are asked again which claim is
    /// authoritative. If an older claim for another board shows up the
    /// reservation is reported as lost and nothing is cached.
    pub async fn reserve(
        &self,
        slug: &str,
        board_id: &str,
        payment: &str,
        signer: &dyn Signer,
    ) -> Result<String, SlugError> {
        validate_slug(slug)?;
        if signer.is_ephemeral() {
            return Err(SlugError::SignerRequired);
        }
        let availability = self.check_availability(slug).await?;
        if let Some(existing) = availability.existing {
            return Err(SlugError::Unavailable(Box::new(existing)));
        }

        let event = signer
            .sign_event(encode_slug_reservation(slug, board_id, payment, self.price))
            .await?;
        let outcome = self
            .pool
            .publish(std::slice::from_ref(&event), self.publish_timeout)
            .await;
        tracing::info!(
            %slug,
            board = %board_id,
            id = %event.id,
            ?outcome,
            "slug reservation published"
        );

        if let Some(winner) = self.resolve_from_relays(slug).await {
            if winner.event_id != event.id && winner.board_id != board_id {
                tracing::warn!(
                    %slug,
                    winner = %winner.board_id,
                    "slug claimed earlier by another board"
                );
                return Err(SlugError::LostRace {
                    board_id: winner.board_id,
                });
            }
        }
        self.cache.put_slug(slug, board_id);
        Ok(event.id)
    }

    /// Board bound to `slug`, from the local cache or the relays.
    pub async fn resolve(&self, slug: &str) -> Option<String> {
        if validate_slug(slug).is_err() {
            return None;
        }
        if let Some(board_id) = self.cache.slug(slug) {
            return Some(board_id);
        }
        let winner = self.resolve_from_relays(slug).await?;
        self.cache.put_slug(slug, &winner.board_id);
        Some(winner.board_id)
    }

    /// Authoritative claim for `slug` as currently visible on the relays,
    /// bypassing the cache.
    pub async fn resolve_from_relays(&self, slug: &str) -> Option<SlugReservation> {
        let filter = Filter::new()
            .kind(KIND_SLUG_RESERVATION)
            .tag("d", slug)
            .limit(RESOLVE_LIMIT);
        let events = self.pool.fetch(filter, self.query_timeout).await;
        authoritative_claim(events.iter().filter_map(|ev| claim_for(ev, slug)))
    }

    /// Slug of the first claim found for `board_id`, remembered in the cache.
    pub async fn slug_for_board(&self, board_id: &str) -> Option<String> {
        let filter = Filter::new()
            .kind(KIND_SLUG_RESERVATION)
            .tag("b", board_id)
            .limit(1);
        let slug = self
            .pool
            .fetch_first(filter, self.query_timeout, |ev| {
                if ev.verify().is_err() {
                    return None;
                }
                decode_slug_reservation(ev)
                    .filter(|r| r.board_id == board_id)
                    .map(|r| r.slug)
            })
            .await?;
        self.cache.put_slug(&slug, board_id);
        Some(slug)
    }

    /// Drop every cached slug resolution.
    pub fn clear_cache(&self) {
        self.cache.clear_slugs();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        signer::Keys,
        testing::{MockRelay, SilentRelay},
    };
    use std::time::Instant;
    use tempfile::TempDir;

    fn claim(keys: &Keys, slug: &str, board: &str, created_at: u64) -> Event {
        let mut unsigned = encode_slug_reservation(slug, board, "proof", 2100);
        unsigned.created_at = created_at;
        keys.sign(unsigned).unwrap()
    }

    fn user() -> Keys {
        Keys::from_secret_hex(&"07".repeat(32)).unwrap()
    }

    fn service(relays: &[&MockRelay], dir: &TempDir) -> SlugService {
        let pool = RelayPool::new(relays.iter().map(|r| r.url.clone()).collect(), None, true);
        SlugService::new(pool, Cache::new(dir.path().to_path_buf()))
            .with_timeouts(Duration::from_secs(3), Duration::from_secs(3))
    }

    #[test]
    fn validation_rules() {
        use SlugValidationError::*;
        assert_eq!(validate_slug("ab"), Err(TooShort));
        assert_eq!(validate_slug(&"a".repeat(31)), Err(TooLong));
        assert_eq!(validate_slug("My-Board"), Err(InvalidCharacters));
        assert_eq!(validate_slug("my_board"), Err(InvalidCharacters));
        assert_eq!(validate_slug("-board"), Err(EdgeHyphen));
        assert_eq!(validate_slug("board-"), Err(EdgeHyphen));
        assert_eq!(validate_slug("my--board"), Err(DoubleHyphen));
        assert_eq!(validate_slug("admin"), Err(Reserved));
        assert_eq!(validate_slug("explore"), Err(Reserved));
        assert_eq!(validate_slug(&"a".repeat(30)), Ok(()));
    }

    #[test]
    fn validation_is_idempotent() {
        for slug in ["abc", "my-board", "b0ard-2024", "x-y-z", "zapme-too"] {
            assert_eq!(validate_slug(slug), Ok(()));
            assert_eq!(validate_slug(slug), Ok(()));
        }
    }

    #[test]
    fn oldest_claim_wins_regardless_of_order() {
        let keys = Keys::generate();
        let claims: Vec<SlugReservation> = [(30, "c"), (10, "a"), (20, "b")]
            .iter()
            .map(|(ts, board)| claim(&keys, "my-board", board, *ts))
            .map(|ev| decode_slug_reservation(&ev).unwrap())
            .collect();
        let mut reversed = claims.clone();
        reversed.reverse();
        assert_eq!(authoritative_claim(claims).unwrap().board_id, "a");
        assert_eq!(authoritative_claim(reversed).unwrap().board_id, "a");
        assert!(authoritative_claim(Vec::new()).is_none());
    }

    #[tokio::test]
    async fn availability_reflects_existing_claims() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = MockRelay::start().await;
        r1.seed(claim(&Keys::generate(), "taken", "abc", 5));
        let svc = service(&[&r1], &dir);
        let free = svc.check_availability("free-one").await.unwrap();
        assert!(free.available);
        assert!(free.existing.is_none());
        let taken = svc.check_availability("taken").await.unwrap();
        assert!(!taken.available);
        assert_eq!(taken.existing.unwrap().board_id, "abc");
        assert!(matches!(
            svc.check_availability("no").await,
            Err(SlugError::Invalid(SlugValidationError::TooShort))
        ));
    }

    #[tokio::test]
    async fn forged_claims_do_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = MockRelay::start().await;
        let mut forged = claim(&Keys::generate(), "forged", "abc", 5);
        forged.sig = "00".repeat(64);
        r1.seed(forged);
        let pool = RelayPool::new(vec![r1.url.clone()], None, false);
        let svc = SlugService::new(pool, Cache::new(dir.path().to_path_buf()));
        assert!(svc.check_availability("forged").await.unwrap().available);
        assert!(svc.resolve("forged").await.is_none());
    }

    #[tokio::test]
    async fn reserve_publishes_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = MockRelay::start().await;
        let svc = service(&[&r1], &dir);
        let id = svc.reserve("my-board", "abc", "p1", &user()).await.unwrap();
        let stored = r1.events();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].pubkey, user().public_key_hex());
        assert_eq!(Cache::new(dir.path().to_path_buf()).slug("my-board").as_deref(), Some("abc"));

        let again = svc.reserve("my-board", "other", "p2", &user()).await;
        assert!(matches!(again, Err(SlugError::Unavailable(_))));
    }

    #[tokio::test]
    async fn reserve_rejects_one_time_keys() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = MockRelay::start().await;
        let svc = service(&[&r1], &dir);
        let err = svc
            .reserve("my-board", "abc", "p1", &Keys::generate())
            .await
            .unwrap_err();
        assert!(matches!(err, SlugError::SignerRequired));
        assert!(r1.events().is_empty());
    }

    #[tokio::test]
    async fn reserve_detects_lost_race() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = MockRelay::start().await;
        r1.inject_on_next_publish(claim(&Keys::generate(), "my-board", "xyz", 1));
        let svc = service(&[&r1], &dir);
        match svc.reserve("my-board", "abc", "p1", &user()).await {
            Err(SlugError::LostRace { board_id }) => assert_eq!(board_id, "xyz"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(Cache::new(dir.path().to_path_buf()).slug("my-board").is_none());
    }

    #[tokio::test]
    async fn earlier_concurrent_claim_wins_on_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = MockRelay::start().await;
        let r2 = MockRelay::start().await;
        let svc = service(&[&r1, &r2], &dir);
        svc.reserve("my-board", "abc", "p1", &user()).await.unwrap();
        // A concurrent writer signed its claim before ours but it only
        // reaches one relay afterwards.
        r2.seed(claim(&Keys::generate(), "my-board", "xyz", 1));

        let fresh_dir = tempfile::tempdir().unwrap();
        let fresh = service(&[&r1, &r2], &fresh_dir);
        assert_eq!(fresh.resolve("my-board").await.as_deref(), Some("xyz"));
        assert_eq!(
            Cache::new(fresh_dir.path().to_path_buf()).slug("my-board").as_deref(),
            Some("xyz")
        );
    }

    #[tokio::test]
    async fn resolve_prefers_cache() {
        let dir = tempfile::tempdir().unwrap();
        Cache::new(dir.path().to_path_buf()).put_slug("cached", "board-1");
        let pool = RelayPool::new(vec!["ws://127.0.0.1:1".into()], None, true);
        let svc = SlugService::new(pool, Cache::new(dir.path().to_path_buf()));
        assert_eq!(svc.resolve("cached").await.as_deref(), Some("board-1"));
        assert!(svc.resolve("missing").await.is_none());
        svc.clear_cache();
        assert!(svc.resolve("cached").await.is_none());
    }

    #[tokio::test]
    async fn slug_for_board_finds_claim() {
        let dir = tempfile::tempdir().unwrap();
        let r1 = MockRelay::start().await;
        r1.seed(claim(&Keys::generate(), "coffee", "board-c", 3));
        let svc = service(&[&r1], &dir);
        assert_eq!(svc.slug_for_board("board-c").await.as_deref(), Some("coffee"));
        assert_eq!(
            Cache::new(dir.path().to_path_buf()).slug("coffee").as_deref(),
            Some("board-c")
        );
        assert!(svc.slug_for_board("board-z").await.is_none());
    }

    #[tokio::test]
    async fn silent_relays_read_as_available() {
        let dir = tempfile::tempdir().unwrap();
        let silent = SilentRelay::start().await;
        let pool = RelayPool::new(vec![silent.url.clone()], None, true);
        let svc = SlugService::new(pool, Cache::new(dir.path().to_path_buf()))
            .with_timeouts(Duration::from_millis(300), Duration::from_millis(300));

        let started = Instant::now();
        let res = svc.check_availability("quiet-one").await.unwrap();
        assert!(res.available);
        assert!(res.existing.is_none());
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(svc.resolve("quiet-one").await.is_none());
        assert!(svc.slug_for_board("board-q").await.is_none());
    }

    #[test]
    fn claims_use_light_publish_bound() {
        let dir = tempfile::tempdir().unwrap();
        let pool = RelayPool::new(vec![], None, true);
        let svc = SlugService::new(pool, Cache::new(dir.path().to_path_buf()));
        assert_eq!(svc.publish_timeout, LIGHT_PUBLISH_TIMEOUT);
    }
}
