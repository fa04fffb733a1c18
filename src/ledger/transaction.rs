//! Ledger transaction encodings.
//!
//! Two shapes reach the ledger:
//!
//! - atomic groups of [`LedgerTransaction`] slots, each signed over
//!   `"TX" || body` and bound together by a shared group commitment;
//! - a single [`RawTransaction`] wrapped in a fee-payer envelope (see
//!   [`crate::envelope`]).

use crate::crypto::{
    account_address, sha3_256, verify_signature, PUBLIC_KEY_LEN, SCHEME_ED25519, SIGNATURE_LEN,
};
use crate::types::{GatewayError, Result};
use crate::wire::{Address, WireReader, WireWriter};

/// Domain prefix of every slot signing message and slot hash
pub const TX_DOMAIN: &[u8] = b"TX";

/// Domain prefix of the group commitment
pub const GROUP_DOMAIN: &[u8] = b"TXGROUP";

/// Raw transaction variant tag: multi-agent (no fee payer)
pub const RAW_TXN_MULTI_AGENT: u8 = 0x00;

/// Raw transaction variant tag: fee-payer
pub const RAW_TXN_FEE_PAYER: u8 = 0x01;

// =============================================================================
// Group slots
// =============================================================================

/// Kind of a group slot transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxKind {
    Payment = 0,
    AppCall = 1,
    AssetTransfer = 2,
}

impl TryFrom<u8> for TxKind {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Payment),
            1 => Ok(Self::AppCall),
            2 => Ok(Self::AssetTransfer),
            other => Err(GatewayError::Wire(format!("unknown transaction kind {other}"))),
        }
    }
}

/// One slot of an atomic transaction group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTransaction {
    pub kind: TxKind,
    pub sender: Address,
    /// Payee, asset receiver, or application account for app calls
    pub receiver: Address,
    pub amount: u64,
    pub fee: u64,
    pub first_valid: u64,
    pub last_valid: u64,
    pub note: Vec<u8>,
    /// Application method for app calls, empty otherwise
    pub method: Vec<u8>,
    pub group: [u8; 32],
}

impl LedgerTransaction {
    fn new(kind: TxKind, sender: Address, receiver: Address, amount: u64) -> Self {
        Self {
            kind,
            sender,
            receiver,
            amount,
            fee: 0,
            first_valid: 0,
            last_valid: 0,
            note: Vec::new(),
            method: Vec::new(),
            group: [0u8; 32],
        }
    }

    pub fn payment(sender: Address, receiver: Address, amount: u64) -> Self {
        Self::new(TxKind::Payment, sender, receiver, amount)
    }

    pub fn asset_transfer(sender: Address, receiver: Address, amount: u64) -> Self {
        Self::new(TxKind::AssetTransfer, sender, receiver, amount)
    }

    pub fn app_call(sender: Address, application: Address, method: &str) -> Self {
        let mut txn = Self::new(TxKind::AppCall, sender, application, 0);
        txn.method = method.as_bytes().to_vec();
        txn
    }

    pub fn with_fee(mut self, fee: u64) -> Self {
        self.fee = fee;
        self
    }

    pub fn with_validity(mut self, first_valid: u64, last_valid: u64) -> Self {
        self.first_valid = first_valid;
        self.last_valid = last_valid;
        self
    }

    pub fn with_note(mut self, note: impl Into<Vec<u8>>) -> Self {
        self.note = note.into();
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(160 + self.note.len() + self.method.len());
        w.u8(self.kind as u8)
            .fixed(&self.sender)
            .fixed(&self.receiver)
            .u64(self.amount)
            .u64(self.fee)
            .u64(self.first_valid)
            .u64(self.last_valid)
            .bytes(&self.note)
            .bytes(&self.method)
            .fixed(&self.group);
        w.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let txn = Self {
            kind: TxKind::try_from(r.u8()?)?,
            sender: r.address()?,
            receiver: r.address()?,
            amount: r.u64()?,
            fee: r.u64()?,
            first_valid: r.u64()?,
            last_valid: r.u64()?,
            note: r.bytes()?.to_vec(),
            method: r.bytes()?.to_vec(),
            group: r.array()?,
        };
        r.finish("ledger transaction")?;
        Ok(txn)
    }

    /// Hash of the body with the group field zeroed
    fn ungrouped_hash(&self) -> [u8; 32] {
        let mut copy = self.clone();
        copy.group = [0u8; 32];
        sha3_256(&[TX_DOMAIN, &copy.encode()])
    }
}

/// Bytes a slot's signer signs: `"TX" || body`
pub fn slot_signing_message(body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(TX_DOMAIN.len() + body.len());
    message.extend_from_slice(TX_DOMAIN);
    message.extend_from_slice(body);
    message
}

/// Group commitment over the slots in order
pub fn compute_group_id(txns: &[LedgerTransaction]) -> [u8; 32] {
    let hashes: Vec<[u8; 32]> = txns.iter().map(LedgerTransaction::ungrouped_hash).collect();
    let mut parts: Vec<&[u8]> = Vec::with_capacity(hashes.len() + 1);
    parts.push(GROUP_DOMAIN);
    parts.extend(hashes.iter().map(|h| h.as_slice()));
    sha3_256(&parts)
}

/// Stamp the group commitment into every slot and return it
pub fn assign_group(txns: &mut [LedgerTransaction]) -> [u8; 32] {
    let group = compute_group_id(txns);
    for txn in txns.iter_mut() {
        txn.group = group;
    }
    group
}

/// A slot body plus the signer's public key and signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedSlot {
    pub body: Vec<u8>,
    pub public_key: [u8; PUBLIC_KEY_LEN],
    pub signature: [u8; SIGNATURE_LEN],
}

impl SignedSlot {
    /// Sign `body` exactly as given
    pub fn sign_with<F>(body: Vec<u8>, public_key: [u8; PUBLIC_KEY_LEN], sign: F) -> Self
    where
        F: FnOnce(&[u8]) -> [u8; SIGNATURE_LEN],
    {
        let signature = sign(&slot_signing_message(&body));
        Self {
            body,
            public_key,
            signature,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(self.body.len() + 100);
        w.bytes(&self.body)
            .fixed(&self.public_key)
            .fixed(&self.signature);
        w.finish()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        let slot = Self {
            body: r.bytes()?.to_vec(),
            public_key: r.array()?,
            signature: r.array()?,
        };
        r.finish("signed slot")?;
        Ok(slot)
    }

    /// Check signer address and signature; returns the decoded body
    pub fn verify(&self) -> std::result::Result<LedgerTransaction, String> {
        let txn = LedgerTransaction::decode(&self.body).map_err(|e| e.to_string())?;
        if account_address(&self.public_key, SCHEME_ED25519) != txn.sender {
            return Err("signer does not match sender".into());
        }
        if !verify_signature(
            &self.public_key,
            &slot_signing_message(&self.body),
            &self.signature,
        ) {
            return Err("invalid signature".into());
        }
        Ok(txn)
    }
}

/// Verify a complete signed group the way the ledger does: every slot
/// signature, and the group commitment recomputed over all bodies in order.
///
/// Returns the decoded slots and the group id.
pub fn verify_group(
    blobs: &[Vec<u8>],
) -> std::result::Result<(Vec<LedgerTransaction>, [u8; 32]), String> {
    if blobs.is_empty() {
        return Err("empty group".into());
    }
    let mut txns = Vec::with_capacity(blobs.len());
    for (index, blob) in blobs.iter().enumerate() {
        let slot = SignedSlot::decode(blob).map_err(|e| format!("slot {index}: {e}"))?;
        txns.push(slot.verify().map_err(|e| format!("slot {index}: {e}"))?);
    }
    let expected = compute_group_id(&txns);
    if let Some(index) = txns.iter().position(|t| t.group != expected) {
        return Err(format!("slot {index}: group id mismatch"));
    }
    Ok((txns, expected))
}

// =============================================================================
// Raw transactions (fee-payer path)
// =============================================================================

/// Single-sender transaction submitted through a fee-payer envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    pub sender: Address,
    pub sequence_number: u64,
    pub payload: Vec<u8>,
    pub max_gas_amount: u64,
    pub gas_unit_price: u64,
    pub expiration_secs: u64,
    pub chain_id: u8,
}

impl RawTransaction {
    pub fn encode_into(&self, w: &mut WireWriter) {
        w.fixed(&self.sender)
            .u64(self.sequence_number)
            .bytes(&self.payload)
            .u64(self.max_gas_amount)
            .u64(self.gas_unit_price)
            .u64(self.expiration_secs)
            .u8(self.chain_id);
    }

    pub fn decode_from(r: &mut WireReader<'_>) -> Result<Self> {
        Ok(Self {
            sender: r.address()?,
            sequence_number: r.u64()?,
            payload: r.bytes()?.to_vec(),
            max_gas_amount: r.u64()?,
            gas_unit_price: r.u64()?,
            expiration_secs: r.u64()?,
            chain_id: r.u8()?,
        })
    }

    /// Multi-agent form with no secondary signers, as prepared for the user
    pub fn to_multi_agent_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.tag(RAW_TXN_MULTI_AGENT);
        self.encode_into(&mut w);
        w.empty_seq();
        w.finish()
    }

    /// Parse the multi-agent form
    pub fn from_multi_agent_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = WireReader::new(bytes);
        r.expect_tag(RAW_TXN_MULTI_AGENT, "multi-agent transaction")?;
        let raw = Self::decode_from(&mut r)?;
        if r.uleb128()? != 0 {
            return Err(GatewayError::Wire(
                "multi-agent transaction has secondary signers".into(),
            ));
        }
        r.finish("multi-agent transaction")?;
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ed25519_address, generate_keypair, sign_payload};

    fn signed(txn: &LedgerTransaction, key: &ed25519_dalek::SigningKey) -> Vec<u8> {
        SignedSlot::sign_with(txn.encode(), key.verifying_key().to_bytes(), |m| {
            sign_payload(key, m).to_bytes()
        })
        .encode()
    }

    fn sample_group() -> (
        Vec<LedgerTransaction>,
        ed25519_dalek::SigningKey,
        ed25519_dalek::SigningKey,
    ) {
        let (sponsor, _) = generate_keypair();
        let (user, _) = generate_keypair();
        let sponsor_addr = ed25519_address(&sponsor.verifying_key());
        let user_addr = ed25519_address(&user.verifying_key());
        let mut txns = vec![
            LedgerTransaction::payment(sponsor_addr, sponsor_addr, 0)
                .with_fee(2_000)
                .with_validity(10, 1010)
                .with_note("mark_paid:42"),
            LedgerTransaction::app_call(user_addr, [9u8; 32], "mark_paid")
                .with_validity(10, 1010)
                .with_note("mark_paid:42"),
        ];
        assign_group(&mut txns);
        (txns, sponsor, user)
    }

    #[test]
    fn test_transaction_decode_inverts_encode() {
        let (txns, _, _) = sample_group();
        for txn in &txns {
            assert_eq!(&LedgerTransaction::decode(&txn.encode()).unwrap(), txn);
        }
    }

    #[test]
    fn test_group_id_depends_on_order_and_content() {
        let (txns, _, _) = sample_group();
        let id = compute_group_id(&txns);
        assert_eq!(txns[0].group, id);
        assert_eq!(txns[1].group, id);

        let mut reversed = txns.clone();
        reversed.reverse();
        assert_ne!(compute_group_id(&reversed), id);

        let mut changed = txns.clone();
        changed[1].amount = 1;
        assert_ne!(compute_group_id(&changed), id);
    }

    #[test]
    fn test_verify_group_accepts_valid_group() {
        let (txns, sponsor, user) = sample_group();
        let blobs = vec![signed(&txns[0], &sponsor), signed(&txns[1], &user)];
        let (decoded, id) = verify_group(&blobs).unwrap();
        assert_eq!(decoded, txns);
        assert_eq!(id, txns[0].group);
    }

    #[test]
    fn test_verify_group_rejects_wrong_signer() {
        let (txns, sponsor, _) = sample_group();
        let blobs = vec![signed(&txns[0], &sponsor), signed(&txns[1], &sponsor)];
        let err = verify_group(&blobs).unwrap_err();
        assert!(err.contains("slot 1"));
    }

    #[test]
    fn test_verify_group_rejects_mutated_body() {
        let (txns, sponsor, user) = sample_group();
        let mut slot = SignedSlot::decode(&signed(&txns[1], &user)).unwrap();
        let last = slot.body.len() - 40;
        slot.body[last] ^= 0x01;
        let blobs = vec![signed(&txns[0], &sponsor), slot.encode()];
        assert!(verify_group(&blobs).is_err());
    }

    #[test]
    fn test_verify_group_rejects_missing_slot() {
        let (txns, sponsor, _) = sample_group();
        let blobs = vec![signed(&txns[0], &sponsor)];
        assert_eq!(verify_group(&blobs).unwrap_err(), "slot 0: group id mismatch");
    }

    #[test]
    fn test_raw_transaction_multi_agent_form() {
        let raw = RawTransaction {
            sender: [7u8; 32],
            sequence_number: 3,
            payload: b"bridge:b-1:500".to_vec(),
            max_gas_amount: 200_000,
            gas_unit_price: 100,
            expiration_secs: 1_700_000_000,
            chain_id: 4,
        };
        let bytes = raw.to_multi_agent_bytes();
        assert_eq!(bytes[0], RAW_TXN_MULTI_AGENT);
        assert_eq!(*bytes.last().unwrap(), 0x00);
        assert_eq!(RawTransaction::from_multi_agent_bytes(&bytes).unwrap(), raw);

        let mut fee_payer = bytes.clone();
        fee_payer[0] = RAW_TXN_FEE_PAYER;
        assert!(RawTransaction::from_multi_agent_bytes(&fee_payer).is_err());
    }
}
