//! WebAuthn assertion codec for the on-chain P-256 verifier.
//!
//! Authenticators return ECDSA signatures as DER; the verifier wants a fixed
//! 64-byte `r ‖ s` in low-s form, packed next to the authenticator data and
//! the client data JSON together with the offsets of its `"challenge"` and
//! `"type"` keys.

use crate::error::Error;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ethers::abi::Token;
use ethers::types::{Bytes, H256, U256};
use p256::ecdsa::Signature;
use serde::{Deserialize, Serialize};

/// Assertion format version (first packed byte).
pub const VERSION: u8 = 1;
/// `validUntil` packed as uint48; zero means the signature never expires.
pub const VALID_UNTIL: u64 = 0;
/// Offset of `"challenge"` in `{"type":"webauthn.get","challenge":...`.
pub const CHALLENGE_LOCATION: usize = 23;
/// Offset of `"type"` in the client data JSON.
pub const TYPE_LOCATION: usize = 1;

/// ECDSA P-256 signature as two fixed 32-byte big-endian components.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct P256Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl P256Signature {
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(&self.r);
        out[32..].copy_from_slice(&self.s);
        out
    }

    /// Canonical low-s form: `s > n/2` is replaced with `n - s`.
    ///
    /// Fails if either component is zero or not below the curve order.
    pub fn normalize_s(&self) -> Result<P256Signature, Error> {
        let sig = Signature::from_slice(&self.to_bytes())
            .map_err(|e| Error::SignatureDecode(format!("not a valid P-256 signature: {e}")))?;
        Ok(sig.normalize_s().map(Self::from).unwrap_or(*self))
    }
}

impl From<Signature> for P256Signature {
    fn from(sig: Signature) -> Self {
        let (r, s) = sig.split_bytes();
        let mut out = P256Signature {
            r: [0u8; 32],
            s: [0u8; 32],
        };
        out.r.copy_from_slice(&r);
        out.s.copy_from_slice(&s);
        out
    }
}

/// Parses a DER `SEQUENCE { INTEGER r, INTEGER s }` into fixed-width `r ‖ s`.
///
/// The integer sign pad (a single leading zero on a 33-byte integer) is
/// dropped and shorter integers are left-padded to 32 bytes. `s` is returned
/// as signed; see [`P256Signature::normalize_s`].
pub fn parse_signature(der: &[u8]) -> Result<P256Signature, Error> {
    Signature::from_der(der)
        .map(P256Signature::from)
        .map_err(|e| Error::SignatureDecode(format!("bad DER signature: {e}")))
}

/// `collectedClientData` as emitted by the authenticator, in emission order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientData {
    #[serde(rename = "type")]
    pub kind: String,
    /// base64url (unpadded) of the signed message.
    pub challenge: String,
    pub origin: String,
    #[serde(rename = "crossOrigin", default, skip_serializing_if = "Option::is_none")]
    pub cross_origin: Option<bool>,
}

/// Un-decoded output of a credential "get" ceremony.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawAssertion {
    pub raw_id: Bytes,
    pub authenticator_data: Bytes,
    pub client_data_json: Bytes,
    /// DER-encoded ECDSA signature.
    pub signature: Bytes,
}

/// Decoded passkey assertion, ready to be packed for the verifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureAssertion {
    pub credential_id: Bytes,
    pub client_data: ClientData,
    pub authenticator_data: Bytes,
    /// Low-s normalized.
    pub signature: P256Signature,
}

impl SignatureAssertion {
    pub fn from_raw(raw: &RawAssertion) -> Result<Self, Error> {
        let client_data: ClientData = serde_json::from_slice(&raw.client_data_json)
            .map_err(|e| Error::SignatureDecode(format!("bad clientDataJSON: {e}")))?;
        let signature = parse_signature(&raw.signature)?.normalize_s()?;

        Ok(Self {
            credential_id: raw.raw_id.clone(),
            client_data,
            authenticator_data: raw.authenticator_data.clone(),
            signature,
        })
    }

    /// The client data JSON the verifier will hash, re-serialized from the parsed fields.
    pub fn client_data_json(&self) -> Result<String, Error> {
        serde_json::to_string(&self.client_data)
            .map_err(|e| Error::Encoding(format!("failed to serialize clientData: {e}")))
    }
}

/// Rejects an assertion made with a different passkey than the one expected.
pub fn check_credential(raw_id: &Bytes, expected: &Bytes) -> Result<(), Error> {
    if raw_id != expected {
        return Err(Error::CredentialMismatch {
            expected: expected.clone(),
            actual: raw_id.clone(),
        });
    }
    Ok(())
}

fn version_and_validity() -> [u8; 7] {
    let mut out = [0u8; 7];
    out[0] = VERSION;
    out[1..].copy_from_slice(&VALID_UNTIL.to_be_bytes()[2..]);
    out
}

/// Message the passkey signs: `uint8 version ‖ uint48 validUntil ‖ bytes32 userOpHash`.
pub fn signing_message(user_op_hash: H256) -> Bytes {
    let mut out = Vec::with_capacity(7 + 32);
    out.extend_from_slice(&version_and_validity());
    out.extend_from_slice(user_op_hash.as_bytes());
    Bytes::from(out)
}

/// base64url challenge an authenticator reports for `message`.
pub fn challenge_for(message: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(message)
}

/// Packs an assertion into the UserOperation `signature` field:
/// `uint8 version ‖ uint48 validUntil ‖ abi.encode((bytes authenticatorData,
/// string clientDataJSON, uint256 challengeLocation, uint256 typeLocation,
/// bytes32 r, bytes32 s))`.
pub fn encode_assertion(assertion: &SignatureAssertion) -> Result<Bytes, Error> {
    let client_data_json = assertion.client_data_json()?;
    check_key_locations(&client_data_json)?;

    let credentials = ethers::abi::encode(&[Token::Tuple(vec![
        Token::Bytes(assertion.authenticator_data.to_vec()),
        Token::String(client_data_json),
        Token::Uint(U256::from(CHALLENGE_LOCATION)),
        Token::Uint(U256::from(TYPE_LOCATION)),
        Token::FixedBytes(assertion.signature.r.to_vec()),
        Token::FixedBytes(assertion.signature.s.to_vec()),
    ])]);

    let mut out = Vec::with_capacity(7 + credentials.len());
    out.extend_from_slice(&version_and_validity());
    out.extend_from_slice(&credentials);
    Ok(Bytes::from(out))
}

/// The verifier trusts the fixed offsets; make sure this JSON really has them.
fn check_key_locations(json: &str) -> Result<(), Error> {
    let at = |offset: usize, key: &str| json.get(offset..).is_some_and(|t| t.starts_with(key));
    if !at(TYPE_LOCATION, "\"type\"") || !at(CHALLENGE_LOCATION, "\"challenge\"") {
        return Err(Error::Encoding(format!(
            "clientDataJSON does not have \"type\" at {TYPE_LOCATION} and \"challenge\" at {CHALLENGE_LOCATION}: {json}"
        )));
    }
    Ok(())
}
