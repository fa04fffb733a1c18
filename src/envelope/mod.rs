//! Fee-payer envelope assembly.
//!
//! Converts a user-signed raw transaction plus the user's account
//! authenticator into the ledger's fee-payer transaction, co-signed by the
//! sponsor:
//!
//! ```text
//! fee_payer_form                 0x01 || raw || uleb(0) || sponsor[32]
//! 0x03                           fee-payer transaction authenticator
//! 0x04 || user_authenticator     single-sender wrapped
//! 0x00                           no secondary signer addresses
//! sponsor[32]
//! sponsor_authenticator          99 bytes
//! 0x00                           no secondary signers
//! ```
//!
//! A failed assembly is never submitted.

pub mod authenticator;

use std::sync::Arc;

use tracing::{debug, error};

use crate::crypto::{sha3_256, SponsorSigner};
use crate::ledger::transaction::{RawTransaction, RAW_TXN_FEE_PAYER, RAW_TXN_MULTI_AGENT};
use crate::types::{GatewayError, Result};
use crate::wire::{address_to_hex, Address, WireReader, WireWriter, ADDRESS_LEN};

pub use authenticator::{
    check_keyless_tags, KeylessAuthenticator, KeylessPublicKey, KeylessSignature,
    SponsorAuthenticator, SPONSOR_AUTHENTICATOR_LEN,
};

/// Domain separator hashed in front of every fee-payer signing message
pub const FEE_PAYER_DOMAIN: &[u8] = b"LEDGER::RawTransactionWithData";

/// Transaction authenticator variant: fee payer
pub const TXN_AUTH_FEE_PAYER: u8 = 0x03;

/// Sender authenticator wrapper: single sender
pub const SENDER_SINGLE: u8 = 0x04;

/// Message both the sender and the fee payer sign
pub fn fee_payer_signing_message(fee_payer_form: &[u8]) -> Vec<u8> {
    let prefix = sha3_256(&[FEE_PAYER_DOMAIN]);
    let mut message = Vec::with_capacity(prefix.len() + fee_payer_form.len());
    message.extend_from_slice(&prefix);
    message.extend_from_slice(fee_payer_form);
    message
}

/// Reshape raw transaction bytes into the fee-payer form for `sponsor`.
///
/// Multi-agent input gets its tag switched and the sponsor address appended.
/// Input already in fee-payer form is accepted only if it names `sponsor`.
pub fn to_fee_payer_form(raw: &[u8], sponsor: &Address) -> Result<Vec<u8>> {
    match raw.first() {
        Some(&RAW_TXN_MULTI_AGENT) => {
            let mut out = Vec::with_capacity(raw.len() + ADDRESS_LEN);
            out.push(RAW_TXN_FEE_PAYER);
            out.extend_from_slice(&raw[1..]);
            out.extend_from_slice(sponsor);
            if out.len() != raw.len() + ADDRESS_LEN {
                return Err(GatewayError::EnvelopeSelfCheck(format!(
                    "fee-payer form is {} bytes, expected {}",
                    out.len(),
                    raw.len() + ADDRESS_LEN
                )));
            }
            Ok(out)
        }
        Some(&RAW_TXN_FEE_PAYER) => {
            if raw.len() < 1 + ADDRESS_LEN || &raw[raw.len() - ADDRESS_LEN..] != sponsor {
                return Err(GatewayError::SponsorAddressMismatch {
                    requested: address_to_hex(sponsor),
                    configured: "fee payer named in transaction".into(),
                });
            }
            Ok(raw.to_vec())
        }
        Some(&other) => Err(GatewayError::UnexpectedRawTransactionTag(other)),
        None => Err(GatewayError::Wire("empty raw transaction".into())),
    }
}

/// Builds signed fee-payer envelopes with the configured sponsor key
#[derive(Debug, Clone)]
pub struct FeePayerEnvelopeAssembler {
    signer: Arc<SponsorSigner>,
}

impl FeePayerEnvelopeAssembler {
    pub fn new(signer: Arc<SponsorSigner>) -> Self {
        Self { signer }
    }

    pub fn sponsor_address(&self) -> Address {
        self.signer.address()
    }

    /// Assemble and self-check a signed envelope.
    ///
    /// `sponsor_address` must equal the configured signer's address.
    pub fn assemble(
        &self,
        raw_transaction: &[u8],
        user_authenticator: &[u8],
        sponsor_address: &Address,
    ) -> Result<Vec<u8>> {
        let result = self.assemble_inner(raw_transaction, user_authenticator, sponsor_address);
        match &result {
            Ok(envelope) => debug!(
                raw_len = raw_transaction.len(),
                envelope_len = envelope.len(),
                "Fee-payer envelope assembled"
            ),
            Err(e) => error!(
                error = %e,
                raw_len = raw_transaction.len(),
                "Fee-payer envelope assembly failed"
            ),
        }
        result
    }

    fn assemble_inner(
        &self,
        raw_transaction: &[u8],
        user_authenticator: &[u8],
        sponsor_address: &Address,
    ) -> Result<Vec<u8>> {
        let configured = self.signer.address();
        if *sponsor_address != configured {
            return Err(GatewayError::SponsorAddressMismatch {
                requested: address_to_hex(sponsor_address),
                configured: address_to_hex(&configured),
            });
        }

        let fee_payer_form = to_fee_payer_form(raw_transaction, &configured)?;

        let sponsor_auth = SponsorAuthenticator {
            public_key: self.signer.public_key(),
            signature: self
                .signer
                .sign(&fee_payer_signing_message(&fee_payer_form)),
        };

        check_keyless_tags(user_authenticator)?;

        let mut w = WireWriter::with_capacity(
            fee_payer_form.len() + user_authenticator.len() + SPONSOR_AUTHENTICATOR_LEN + 64,
        );
        w.fixed(&fee_payer_form)
            .tag(TXN_AUTH_FEE_PAYER)
            .tag(SENDER_SINGLE)
            .fixed(user_authenticator)
            .empty_seq()
            .fixed(&configured);
        sponsor_auth.encode_into(&mut w);
        w.empty_seq();
        let envelope = w.finish();

        self_check(&envelope, fee_payer_form.len(), user_authenticator.len())?;
        Ok(envelope)
    }
}

/// Verify total length and the three fixed tag bytes
fn self_check(envelope: &[u8], fee_payer_len: usize, user_auth_len: usize) -> Result<()> {
    let sponsor_auth_offset = fee_payer_len + 2 + user_auth_len + 1 + ADDRESS_LEN;
    let expected_len = sponsor_auth_offset + SPONSOR_AUTHENTICATOR_LEN + 1;
    if envelope.len() != expected_len {
        return Err(GatewayError::EnvelopeSelfCheck(format!(
            "length {} != expected {expected_len}",
            envelope.len()
        )));
    }
    let checks = [
        (0, RAW_TXN_FEE_PAYER, "raw transaction variant"),
        (fee_payer_len, TXN_AUTH_FEE_PAYER, "transaction authenticator"),
        (sponsor_auth_offset, authenticator::ACCOUNT_AUTH_ED25519, "sponsor authenticator"),
    ];
    for (offset, expected, what) in checks {
        if envelope[offset] != expected {
            return Err(GatewayError::EnvelopeSelfCheck(format!(
                "{what} tag at offset {offset} is 0x{:02x}, expected 0x{expected:02x}",
                envelope[offset]
            )));
        }
    }
    Ok(())
}

/// Decoded view of a fee-payer envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEnvelope {
    /// Exact fee-payer form bytes both parties signed over
    pub fee_payer_form: Vec<u8>,
    pub raw_transaction: RawTransaction,
    pub fee_payer_address: Address,
    pub user_authenticator: KeylessAuthenticator,
    /// Exact user authenticator bytes as embedded
    pub user_authenticator_bytes: Vec<u8>,
    pub sponsor_address: Address,
    pub sponsor_authenticator: SponsorAuthenticator,
}

impl ParsedEnvelope {
    pub fn signing_message(&self) -> Vec<u8> {
        fee_payer_signing_message(&self.fee_payer_form)
    }
}

/// Inverse of [`FeePayerEnvelopeAssembler::assemble`]
pub fn parse(envelope: &[u8]) -> Result<ParsedEnvelope> {
    let mut r = WireReader::new(envelope);

    r.expect_tag(RAW_TXN_FEE_PAYER, "fee-payer transaction")?;
    let raw_transaction = RawTransaction::decode_from(&mut r)?;
    if r.uleb128()? != 0 {
        return Err(GatewayError::Wire("unexpected secondary signers".into()));
    }
    let fee_payer_address = r.address()?;
    let fee_payer_form = envelope[..r.position()].to_vec();

    r.expect_tag(TXN_AUTH_FEE_PAYER, "transaction authenticator")?;
    r.expect_tag(SENDER_SINGLE, "sender authenticator")?;
    let user_start = r.position();
    let user_authenticator = KeylessAuthenticator::decode_from(&mut r)?;
    let user_authenticator_bytes = envelope[user_start..r.position()].to_vec();

    if r.uleb128()? != 0 {
        return Err(GatewayError::Wire("unexpected secondary signer addresses".into()));
    }
    let sponsor_address = r.address()?;
    let sponsor_authenticator = SponsorAuthenticator::decode_from(&mut r)?;
    if r.uleb128()? != 0 {
        return Err(GatewayError::Wire("unexpected secondary signer authenticators".into()));
    }
    r.finish("fee-payer envelope")?;

    Ok(ParsedEnvelope {
        fee_payer_form,
        raw_transaction,
        fee_payer_address,
        user_authenticator,
        user_authenticator_bytes,
        sponsor_address,
        sponsor_authenticator,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify_signature;

    fn raw() -> RawTransaction {
        RawTransaction {
            sender: [4u8; 32],
            sequence_number: 9,
            payload: b"bridge:b-7:1200".to_vec(),
            max_gas_amount: 200_000,
            gas_unit_price: 100,
            expiration_secs: 1_700_000_000,
            chain_id: 4,
        }
    }

    fn user_auth() -> Vec<u8> {
        KeylessAuthenticator {
            public_key: KeylessPublicKey {
                issuer: "https://issuer.example".into(),
                identity_commitment: [8u8; 32],
            },
            signature: KeylessSignature {
                proof: vec![0xaa; 16],
                expiry_secs: 1_700_000_600,
                ephemeral_public_key: [1u8; 32],
                ephemeral_signature: [2u8; 64],
            },
        }
        .encode()
    }

    fn assembler() -> FeePayerEnvelopeAssembler {
        FeePayerEnvelopeAssembler::new(Arc::new(SponsorSigner::generate()))
    }

    #[test]
    fn test_fee_payer_form_grows_by_address_width() {
        let input = raw().to_multi_agent_bytes();
        let sponsor = [3u8; 32];
        let form = to_fee_payer_form(&input, &sponsor).unwrap();
        assert_eq!(form.len(), input.len() + ADDRESS_LEN);
        assert_eq!(form[0], RAW_TXN_FEE_PAYER);
        assert_eq!(&form[1..input.len()], &input[1..]);
        assert_eq!(&form[input.len()..], &sponsor);
    }

    #[test]
    fn test_existing_fee_payer_form_must_name_sponsor() {
        let input = raw().to_multi_agent_bytes();
        let form = to_fee_payer_form(&input, &[3u8; 32]).unwrap();
        assert_eq!(to_fee_payer_form(&form, &[3u8; 32]).unwrap(), form);
        assert!(matches!(
            to_fee_payer_form(&form, &[9u8; 32]),
            Err(GatewayError::SponsorAddressMismatch { .. })
        ));
    }

    #[test]
    fn test_envelope_shape() {
        let assembler = assembler();
        let sponsor = assembler.sponsor_address();
        let input = raw().to_multi_agent_bytes();
        let auth = user_auth();
        let n = input.len();

        let envelope = assembler.assemble(&input, &auth, &sponsor).unwrap();

        assert_eq!(envelope[0], 0x01);
        assert_eq!(envelope[n + 32], 0x03);
        assert_eq!(envelope[n + 33], 0x04);
        assert_eq!(&envelope[n + 34..n + 34 + auth.len()], auth.as_slice());
        let sponsor_auth_offset = n + 34 + auth.len() + 1 + 32;
        assert_eq!(envelope[sponsor_auth_offset], 0x00);
        assert_eq!(envelope.len(), sponsor_auth_offset + 99 + 1);
    }

    #[test]
    fn test_parse_inverts_assemble() {
        let assembler = assembler();
        let sponsor = assembler.sponsor_address();
        let input = raw().to_multi_agent_bytes();
        let auth = user_auth();

        let envelope = assembler.assemble(&input, &auth, &sponsor).unwrap();
        let parsed = parse(&envelope).unwrap();

        assert_eq!(parsed.raw_transaction, raw());
        assert_eq!(parsed.fee_payer_address, sponsor);
        assert_eq!(parsed.sponsor_address, sponsor);
        assert_eq!(parsed.user_authenticator_bytes, auth);
        assert_eq!(parsed.fee_payer_form.len(), input.len() + ADDRESS_LEN);
        assert!(verify_signature(
            &parsed.sponsor_authenticator.public_key,
            &parsed.signing_message(),
            &parsed.sponsor_authenticator.signature,
        ));
    }

    #[test]
    fn test_signing_message_is_domain_separated() {
        let form = b"\x01payload";
        let message = fee_payer_signing_message(form);
        assert_eq!(message.len(), 32 + form.len());
        assert_eq!(&message[..32], &sha3_256(&[FEE_PAYER_DOMAIN]));
    }

    #[test]
    fn test_unknown_raw_tag_is_rejected() {
        let assembler = assembler();
        let mut input = raw().to_multi_agent_bytes();
        input[0] = 0x07;
        let err = assembler
            .assemble(&input, &user_auth(), &assembler.sponsor_address())
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnexpectedRawTransactionTag(0x07)));
    }

    #[test]
    fn test_wrong_sponsor_address_is_rejected() {
        let assembler = assembler();
        let err = assembler
            .assemble(&raw().to_multi_agent_bytes(), &user_auth(), &[0u8; 32])
            .unwrap_err();
        assert!(matches!(err, GatewayError::SponsorAddressMismatch { .. }));
    }

    #[test]
    fn test_non_keyless_authenticator_is_rejected() {
        let assembler = assembler();
        let mut auth = user_auth();
        auth[0] = 0x00;
        let err = assembler
            .assemble(&raw().to_multi_agent_bytes(), &auth, &assembler.sponsor_address())
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnexpectedAuthenticatorTag(_)));
    }

    #[test]
    fn test_self_check_catches_bad_layout() {
        let envelope = vec![0x01; 10];
        assert!(matches!(
            self_check(&envelope, 4, 2),
            Err(GatewayError::EnvelopeSelfCheck(_))
        ));
    }
}
