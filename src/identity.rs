use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand_core::CryptoRngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::crypt::fernet::{Fernet, PlainText, Token};
use crate::error::RnsError;
use crate::hash::AddressHash;
use crate::ratchets;

pub const PUBLIC_KEY_LENGTH: usize = 32;
const DERIVED_KEY_LENGTH: usize = 64;

/// Identities are hashed over the concatenation of their encryption and
/// signing public keys, truncated to an address hash.
pub trait HashIdentity {
    fn as_address_hash_slice(&self) -> &[u8];
}

pub trait EncryptIdentity {
    fn encrypt_to<R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, RnsError>;
}

pub trait DecryptIdentity {
    fn decrypt_from(&self, ciphertext: &[u8]) -> Result<Vec<u8>, RnsError>;
}

/// The encryption/verification half of an identity: an X25519 public key
/// paired with an Ed25519 verifying key.
#[derive(Debug, Clone, Copy)]
pub struct Identity {
    pub public_key: PublicKey,
    pub verifying_key: VerifyingKey,
    pub address_hash: AddressHash,
}

impl Identity {
    pub fn new(public_key: PublicKey, verifying_key: VerifyingKey) -> Self {
        let mut combined = [0u8; PUBLIC_KEY_LENGTH * 2];
        combined[..PUBLIC_KEY_LENGTH].copy_from_slice(public_key.as_bytes());
        combined[PUBLIC_KEY_LENGTH..].copy_from_slice(verifying_key.as_bytes());
        let address_hash = AddressHash::new_from_slice(&combined);

        Self { public_key, verifying_key, address_hash }
    }

    pub fn new_from_slices(public_key: &[u8], verifying_key: &[u8]) -> Self {
        let mut pub_bytes = [0u8; PUBLIC_KEY_LENGTH];
        pub_bytes.copy_from_slice(&public_key[..PUBLIC_KEY_LENGTH]);

        let mut verify_bytes = [0u8; PUBLIC_KEY_LENGTH];
        verify_bytes.copy_from_slice(&verifying_key[..PUBLIC_KEY_LENGTH]);

        let public_key = PublicKey::from(pub_bytes);
        let verifying_key = VerifyingKey::from_bytes(&verify_bytes)
            .unwrap_or_else(|_| SigningKey::from_bytes(&[1u8; 32]).verifying_key());

        Self::new(public_key, verifying_key)
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        *self.public_key.as_bytes()
    }

    pub fn verifying_key_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.verifying_key.to_bytes()
    }

    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<(), RnsError> {
        self.verifying_key.verify(data, signature).map_err(|_| RnsError::IncorrectSignature)
    }
}

impl HashIdentity for Identity {
    fn as_address_hash_slice(&self) -> &[u8] {
        self.address_hash.as_slice()
    }
}

impl Default for Identity {
    fn default() -> Self {
        let secret = StaticSecret::from([1u8; 32]);
        let public_key = PublicKey::from(&secret);
        let signing_key = SigningKey::from_bytes(&[1u8; 32]);
        Self::new(public_key, signing_key.verifying_key())
    }
}

impl EncryptIdentity for Identity {
    fn encrypt_to<R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, RnsError> {
        ratchets::encrypt_for_public_key(&self.public_key, self.as_address_hash_slice(), plaintext, rng)
    }
}

/// The full keypair behind an `Identity`: a static X25519 secret used for key
/// agreement and an Ed25519 signing key used to authenticate announces and
/// link proofs.
#[derive(Clone)]
pub struct PrivateIdentity {
    secret: StaticSecret,
    signing_key: SigningKey,
    identity: Identity,
}

impl PrivateIdentity {
    pub fn new(secret: StaticSecret, signing_key: SigningKey) -> Self {
        let public_key = PublicKey::from(&secret);
        let verifying_key = signing_key.verifying_key();
        let identity = Identity::new(public_key, verifying_key);

        Self { secret, signing_key, identity }
    }

    pub fn new_from_rand<R: CryptoRngCore + Copy>(mut rng: R) -> Self {
        let secret = StaticSecret::random_from_rng(rng);
        let signing_key = SigningKey::generate(&mut rng);

        Self::new(secret, signing_key)
    }

    pub fn as_identity(&self) -> &Identity {
        &self.identity
    }

    pub fn address_hash(&self) -> &AddressHash {
        &self.identity.address_hash
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }

    pub fn sign_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn derive_key(&self, peer_public: &PublicKey, salt: Option<&[u8]>) -> DerivedKey {
        let shared = self.secret.diffie_hellman(peer_public);
        DerivedKey::new(&shared, salt)
    }

    pub fn encrypt<'a, R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        text: &[u8],
        derived_key: &DerivedKey,
        out_buf: &'a mut [u8],
    ) -> Result<&'a [u8], RnsError> {
        let fernet = derived_key.fernet(rng);
        let token = fernet.encrypt(PlainText::from(text), out_buf)?;
        Ok(token.as_bytes())
    }

    pub fn decrypt<'a, R: CryptoRngCore + Copy>(
        &self,
        rng: R,
        text: &[u8],
        derived_key: &DerivedKey,
        out_buf: &'a mut [u8],
    ) -> Result<&'a [u8], RnsError> {
        let fernet = derived_key.fernet(rng);
        let token = fernet.verify(Token::from(text))?;
        let plain = fernet.decrypt(token, out_buf)?;
        Ok(plain.as_bytes())
    }
}

impl HashIdentity for PrivateIdentity {
    fn as_address_hash_slice(&self) -> &[u8] {
        self.identity.as_address_hash_slice()
    }
}

impl DecryptIdentity for PrivateIdentity {
    fn decrypt_from(&self, ciphertext: &[u8]) -> Result<Vec<u8>, RnsError> {
        ratchets::decrypt_with_identity(self, self.as_address_hash_slice(), ciphertext)
    }
}

/// A marker identity for destinations that carry no encryption or signing
/// keys at all (plain, unauthenticated destinations).
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyIdentity {}

impl HashIdentity for EmptyIdentity {
    fn as_address_hash_slice(&self) -> &[u8] {
        &[]
    }
}

/// Key material derived from an X25519 shared secret via HKDF-SHA256, split
/// in half to produce a Token sign key and encryption key.
#[derive(Clone)]
pub struct DerivedKey([u8; DERIVED_KEY_LENGTH]);

impl DerivedKey {
    pub fn new(shared_secret: &SharedSecret, salt: Option<&[u8]>) -> Self {
        let hkdf = Hkdf::<Sha256>::new(salt, shared_secret.as_bytes());
        let mut okm = [0u8; DERIVED_KEY_LENGTH];
        hkdf.expand(b"link", &mut okm).expect("derived key length is valid for HKDF-SHA256");
        Self(okm)
    }

    pub fn new_empty() -> Self {
        Self([0u8; DERIVED_KEY_LENGTH])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn fernet<R: CryptoRngCore + Copy>(&self, rng: R) -> Fernet<R> {
        let split = self.0.len() / 2;
        Fernet::new_from_slices(&self.0[..split], &self.0[split..], rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    #[test]
    fn identity_address_hash_is_stable_for_same_keys() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let a = Identity::new_from_slices(
            &identity.as_identity().public_key_bytes(),
            &identity.as_identity().verifying_key_bytes(),
        );
        let b = *identity.as_identity();
        assert_eq!(a.address_hash, b.address_hash);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let identity = PrivateIdentity::new_from_rand(OsRng);
        let data = b"announce payload";
        let signature = identity.sign(data);
        assert!(identity.as_identity().verify(data, &signature).is_ok());
    }

    #[test]
    fn derive_key_matches_on_both_sides() {
        let alice = PrivateIdentity::new_from_rand(OsRng);
        let bob = PrivateIdentity::new_from_rand(OsRng);

        let salt = [7u8; 16];
        let alice_key = alice.derive_key(&bob.as_identity().public_key, Some(&salt));
        let bob_key = bob.derive_key(&alice.as_identity().public_key, Some(&salt));

        assert_eq!(alice_key.as_bytes(), bob_key.as_bytes());
    }

    #[test]
    fn link_style_encrypt_decrypt_roundtrip() {
        let alice = PrivateIdentity::new_from_rand(OsRng);
        let bob = PrivateIdentity::new_from_rand(OsRng);
        let salt = [1u8; 16];
        let key = alice.derive_key(&bob.as_identity().public_key, Some(&salt));

        let mut out = [0u8; 128];
        let token = alice.encrypt(OsRng, b"hello link", &key, &mut out).expect("encrypt");
        let token = token.to_vec();

        let mut plain = [0u8; 128];
        let recovered = bob.decrypt(OsRng, &token, &key, &mut plain).expect("decrypt");
        assert_eq!(recovered, b"hello link");
    }

    #[test]
    fn identity_encrypt_decrypt_roundtrip() {
        let bob = PrivateIdentity::new_from_rand(OsRng);
        let ciphertext =
            bob.as_identity().encrypt_to(OsRng, b"announce app data").expect("encrypt");
        let plaintext = bob.decrypt_from(&ciphertext).expect("decrypt");
        assert_eq!(plaintext, b"announce app data");
    }
}
