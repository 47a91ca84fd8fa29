//! Signing capability and local secp256k1 keys.

use async_trait::async_trait;
use rand::RngCore;
use secp256k1::{All, Keypair, Message, Secp256k1};

use crate::event::{Event, UnsignedEvent};

/// Errors surfaced by a [`Signer`].
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("invalid secret key: {0}")]
    InvalidKey(String),
    #[error("event encoding failed: {0}")]
    Encoding(#[from] crate::event::EventError),
}

/// Capability to identify as a public key and sign events.
///
/// Implemented locally by [`Keys`]; other implementations can delegate to an
/// external signer holding the user's identity.
#[async_trait]
pub trait Signer: Send + Sync {
    /// Hex x-only public key of this identity.
    async fn public_key(&self) -> Result<String, SignerError>;

    /// Sign an event body as this identity.
    async fn sign_event(&self, event: UnsignedEvent) -> Result<Event, SignerError>;

    /// Whether the identity is a throwaway key rather than a public identity.
    fn is_ephemeral(&self) -> bool {
        false
    }
}

/// Local secp256k1 keypair.
#[derive(Clone)]
pub struct Keys {
    secp: Secp256k1<All>,
    keypair: Keypair,
    ephemeral: bool,
}

impl Keys {
    /// Generate a fresh one-time keypair.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();
        loop {
            let mut sk = [0u8; 32];
            rng.fill_bytes(&mut sk);
            // Out-of-range scalars are astronomically unlikely; draw again.
            if let Ok(keypair) = Keypair::from_seckey_slice(&secp, &sk) {
                return Self {
                    secp,
                    keypair,
                    ephemeral: true,
                };
            }
        }
    }

    /// Load a user identity from a hex secret key.
    pub fn from_secret_hex(secret: &str) -> Result<Self, SignerError> {
        let bytes = hex::decode(secret.trim()).map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, &bytes)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self {
            secp,
            keypair,
            ephemeral: false,
        })
    }

    /// Hex x-only public key.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.x_only_public_key().0.serialize())
    }

    /// Hex secret key, for persisting a generated board key.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    /// Sign synchronously, filling in `pubkey`, `id` and `sig`.
    pub fn sign(&self, unsigned: UnsignedEvent) -> Result<Event, SignerError> {
        let pubkey = self.public_key_hex();
        let hash = unsigned.hash_for(&pubkey)?;
        let msg = Message::from_digest(hash);
        let sig = self.secp.sign_schnorr_no_aux_rand(&msg, &self.keypair);
        Ok(Event {
            id: hex::encode(hash),
            pubkey,
            kind: unsigned.kind,
            created_at: unsigned.created_at,
            tags: unsigned.tags,
            content: unsigned.content,
            sig: hex::encode(sig.as_ref()),
        })
    }
}

impl std::fmt::Debug for Keys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys")
            .field("pubkey", &self.public_key_hex())
            .field("ephemeral", &self.ephemeral)
            .finish()
    }
}

#[async_trait]
impl Signer for Keys {
    async fn public_key(&self) -> Result<String, SignerError> {
        Ok(self.public_key_hex())
    }

    async fn sign_event(&self, event: UnsignedEvent) -> Result<Event, SignerError> {
        self.sign(event)
    }

    fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }
}

/// Fresh random board identifier: 32 bytes, hex encoded.
pub fn generate_board_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
