//! Account authenticators carried inside a fee-payer envelope.

use crate::crypto::{account_address, PUBLIC_KEY_LEN, SCHEME_SINGLE_KEY, SIGNATURE_LEN};
use crate::types::{GatewayError, Result};
use crate::wire::{Address, WireReader, WireWriter};

/// Account authenticator variant: plain Ed25519
pub const ACCOUNT_AUTH_ED25519: u8 = 0x00;

/// Account authenticator variant: single key (wraps any public key)
pub const ACCOUNT_AUTH_SINGLE_KEY: u8 = 0x02;

/// Any-public-key / any-signature variant: keyless
pub const ANY_KEY_KEYLESS: u8 = 0x03;

/// Ephemeral key scheme inside a keyless signature: Ed25519
pub const EPHEMERAL_ED25519: u8 = 0x00;

/// Encoded length of a [`SponsorAuthenticator`]
pub const SPONSOR_AUTHENTICATOR_LEN: usize = 1 + 1 + PUBLIC_KEY_LEN + 1 + SIGNATURE_LEN;

// =============================================================================
// Sponsor
// =============================================================================

/// Ed25519 account authenticator produced by the sponsor for one envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SponsorAuthenticator {
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub signature: [u8; SIGNATURE_LEN],
}

impl SponsorAuthenticator {
    pub fn encode_into(&self, w: &mut WireWriter) {
        w.tag(ACCOUNT_AUTH_ED25519)
            .bytes(&self.public_key)
            .bytes(&self.signature);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(SPONSOR_AUTHENTICATOR_LEN);
        self.encode_into(&mut w);
        w.finish()
    }

    pub fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        r.expect_tag(ACCOUNT_AUTH_ED25519, "sponsor authenticator")?;
        let public_key = r.bytes()?;
        let signature = r.bytes()?;
        Ok(Self {
            public_key: public_key.try_into().map_err(|_| {
                GatewayError::Wire("sponsor authenticator public key length".into())
            })?,
            signature: signature.try_into().map_err(|_| {
                GatewayError::Wire("sponsor authenticator signature length".into())
            })?,
        })
    }
}

// =============================================================================
// Keyless
// =============================================================================

/// Public key of a keyless account: issuer plus identity commitment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeylessPublicKey {
    pub issuer: String,
    pub identity_commitment: [u8; 32],
}

impl KeylessPublicKey {
    pub fn encode_into(&self, w: &mut WireWriter) {
        w.bytes(self.issuer.as_bytes())
            .bytes(&self.identity_commitment);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.encode_into(&mut w);
        w.finish()
    }

    pub fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        let issuer = std::str::from_utf8(r.bytes()?)
            .map_err(|_| GatewayError::Wire("keyless issuer is not UTF-8".into()))?
            .to_string();
        let identity_commitment = r
            .bytes()?
            .try_into()
            .map_err(|_| GatewayError::Wire("identity commitment length".into()))?;
        Ok(Self {
            issuer,
            identity_commitment,
        })
    }

    /// Ledger address: `sha3(0x03 || keyless_public_key || 0x02)`
    pub fn address(&self) -> Address {
        let mut any_key = vec![ANY_KEY_KEYLESS];
        any_key.extend_from_slice(&self.encode());
        account_address(&any_key, SCHEME_SINGLE_KEY)
    }
}

/// Signature of a keyless account: ephemeral signature plus zk proof
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeylessSignature {
    pub proof: Vec<u8>,
    pub expiry_secs: u64,
    pub ephemeral_public_key: [u8; PUBLIC_KEY_LEN],
    pub ephemeral_signature: [u8; SIGNATURE_LEN],
}

impl KeylessSignature {
    pub fn encode_into(&self, w: &mut WireWriter) {
        w.bytes(&self.proof)
            .u64(self.expiry_secs)
            .tag(EPHEMERAL_ED25519)
            .fixed(&self.ephemeral_public_key)
            .fixed(&self.ephemeral_signature);
    }

    pub fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        let proof = r.bytes()?.to_vec();
        let expiry_secs = r.u64()?;
        r.expect_tag(EPHEMERAL_ED25519, "ephemeral key scheme")?;
        Ok(Self {
            proof,
            expiry_secs,
            ephemeral_public_key: r.array()?,
            ephemeral_signature: r.array()?,
        })
    }
}

/// Single-key keyless account authenticator as built by the user's side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeylessAuthenticator {
    pub public_key: KeylessPublicKey,
    pub signature: KeylessSignature,
}

impl KeylessAuthenticator {
    pub fn encode_into(&self, w: &mut WireWriter) {
        w.tag(ACCOUNT_AUTH_SINGLE_KEY).tag(ANY_KEY_KEYLESS);
        self.public_key.encode_into(w);
        w.tag(ANY_KEY_KEYLESS);
        self.signature.encode_into(w);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.encode_into(&mut w);
        w.finish()
    }

    pub fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        r.expect_tag(ACCOUNT_AUTH_SINGLE_KEY, "account authenticator")?;
        r.expect_tag(ANY_KEY_KEYLESS, "keyless public key")?;
        let public_key = KeylessPublicKey::decode_from(r)?;
        r.expect_tag(ANY_KEY_KEYLESS, "keyless signature")?;
        let signature = KeylessSignature::decode_from(r)?;
        Ok(Self {
            public_key,
            signature,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let auth = Self::decode_from(&mut r)?;
        r.finish("keyless authenticator")?;
        Ok(auth)
    }
}

/// Check the two leading tag bytes of a user account authenticator.
pub fn check_keyless_tags(authenticator: &[u8]) -> Result<()> {
    match authenticator {
        [ACCOUNT_AUTH_SINGLE_KEY, ANY_KEY_KEYLESS, ..] => Ok(()),
        [first, second, ..] => Err(GatewayError::UnexpectedAuthenticatorTag(format!(
            "0x{first:02x} 0x{second:02x}"
        ))),
        _ => Err(GatewayError::UnexpectedAuthenticatorTag(format!(
            "{} byte authenticator",
            authenticator.len()
        ))),
    }
}
