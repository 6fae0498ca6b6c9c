//! # Identity and Cryptographic Primitives
//!
//! Core identity types for the overlay:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`NodeIdentity`]: a node's 512-bit address bound to its keypair
//! - [`Peer`]: a validated routing-table entry for a remote node
//!
//! ## Identity model
//!
//! A full node's address is either derived from its public key
//! (`blake3` XOF, 64 bytes) or supplied explicitly by the host, in which
//! case the host is expected to resolve public keys through the
//! `on_request_public_key` handler during validation. Identity
//! (`address`, `public_key`) is immutable for the lifetime of a [`Peer`]
//! entry; only its `rank` is mutable.
//!
//! Anonymous nodes carry an *ephemeral* identity: a random address and a
//! throwaway keypair. They can send via a bootstrap relay but are never
//! admitted into anyone's routing table.
//!
//! ## Ownership proofs
//!
//! Admission into a routing table requires proof that the claimant holds
//! the private key for its claimed identity: an Ed25519 signature over a
//! domain-separated payload binding claimant, audience and a fresh nonce.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::address::{Address, ADDRESS_BYTES};

/// Domain separation prefix for identity-ownership signatures.
/// Prevents cross-protocol signature reuse.
const OWNERSHIP_DOMAIN: &[u8] = b"vicinity-ownership-v1:";

/// A node's Ed25519 signing keypair.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The address derived from this keypair's public key.
    pub fn derived_address(&self) -> Address {
        address_of_key(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Sign an identity-ownership claim: "I, `claimant`, prove to
    /// `audience` that I hold this key", bound to a caller-chosen nonce.
    ///
    /// `audience` is `None` for broadcast-style claims (the initial Join
    /// hello, where the responder is not yet known).
    pub fn prove_ownership(
        &self,
        claimant: &Address,
        audience: Option<&Address>,
        nonce: &[u8],
    ) -> Signature {
        self.signing_key
            .sign(&ownership_payload(claimant, audience, nonce))
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key_bytes()))
            .finish_non_exhaustive()
    }
}

/// Derive a 512-bit address from an Ed25519 public key (blake3 XOF).
pub fn address_of_key(key: &VerifyingKey) -> Address {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.as_bytes());
    let mut out = [0u8; ADDRESS_BYTES];
    hasher.finalize_xof().fill(&mut out);
    Address::from_bytes(out)
}

fn ownership_payload(claimant: &Address, audience: Option<&Address>, nonce: &[u8]) -> Vec<u8> {
    let mut payload =
        Vec::with_capacity(OWNERSHIP_DOMAIN.len() + 2 * ADDRESS_BYTES + nonce.len());
    payload.extend_from_slice(OWNERSHIP_DOMAIN);
    payload.extend_from_slice(claimant.as_bytes());
    match audience {
        Some(a) => payload.extend_from_slice(a.as_bytes()),
        None => payload.extend_from_slice(Address::ZERO.as_bytes()),
    }
    payload.extend_from_slice(nonce);
    payload
}

/// Verify an identity-ownership signature against a claimed public key.
pub fn verify_ownership(
    key: &VerifyingKey,
    claimant: &Address,
    audience: Option<&Address>,
    nonce: &[u8],
    signature: &Signature,
) -> bool {
    key.verify(&ownership_payload(claimant, audience, nonce), signature)
        .is_ok()
}

/// A node's own identity: address plus keypair.
///
/// Constructed once and shared immutably; the ephemeral flag marks
/// anonymous sessions.
#[derive(Clone, Debug)]
pub struct NodeIdentity {
    address: Address,
    keypair: Keypair,
    ephemeral: bool,
}

impl NodeIdentity {
    /// Full identity with a key-derived address.
    pub fn from_keypair(keypair: Keypair) -> Self {
        let address = keypair.derived_address();
        Self {
            address,
            keypair,
            ephemeral: false,
        }
    }

    /// Full identity with an explicitly assigned address. The host is then
    /// responsible for public-key resolution during peer validation.
    pub fn with_address(address: Address, keypair: Keypair) -> Self {
        Self {
            address,
            keypair,
            ephemeral: false,
        }
    }

    /// Ephemeral identity for an anonymous session: random address,
    /// throwaway keys. Not routable and never admitted to routing tables.
    pub fn ephemeral() -> Self {
        Self {
            address: Address::random(),
            keypair: Keypair::generate(),
            ephemeral: true,
        }
    }

    #[inline]
    pub fn address(&self) -> Address {
        self.address
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.keypair.public_key()
    }

    #[inline]
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }
}

/// A validated remote node, as held in the routing table.
///
/// `connection_id` is the transport-layer handle for the peer; it is
/// address-shaped but may differ from `address` (relayed and bootstrap
/// connections get transport-assigned handles).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub address: Address,
    pub public_key: VerifyingKey,
    pub connection_id: Address,
    pub rank: i32,
}

impl Peer {
    pub fn new(address: Address, public_key: VerifyingKey, connection_id: Address) -> Self {
        Self {
            address,
            public_key,
            connection_id,
            rank: 0,
        }
    }

    /// True iff this peer's address is derived from its public key.
    pub fn has_derived_address(&self) -> bool {
        address_of_key(&self.public_key) == self.address
    }
}
