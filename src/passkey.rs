use crate::error::Error;
use crate::types::PublicKey;
use crate::webauthn::{challenge_for, ClientData, RawAssertion};
use async_trait::async_trait;
use ethers::types::{Bytes, H256};
use ethers::utils::keccak256;
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, Ordering};

/// authenticatorData flags: user present | user verified.
const FLAGS_UP_UV: u8 = 0x05;

/// A credential "get" ceremony: sign `challenge` with a passkey.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn get_assertion(&self, challenge: &[u8]) -> Result<RawAssertion, Error>;
}

/// A passkey whose P-256 key lives in this process.
///
/// Emits the same artifacts a platform authenticator does: authenticator
/// data (`sha256(rpId) ‖ flags ‖ counter`), client data JSON and a DER
/// signature over `authenticatorData ‖ sha256(clientDataJSON)`.
pub struct SoftwarePasskey {
    signing_key: SigningKey,
    credential_id: Bytes,
    rp_id: String,
    origin: String,
    counter: AtomicU32,
}

impl SoftwarePasskey {
    /// The credential id defaults to `keccak256(x ‖ y)`, which fits the registry's uint256 ids.
    pub fn new(signing_key: SigningKey, origin: &str) -> Self {
        let public_key = public_key_of(signing_key.verifying_key());
        let mut xy = Vec::with_capacity(64);
        xy.extend_from_slice(public_key.x.as_bytes());
        xy.extend_from_slice(public_key.y.as_bytes());
        let credential_id = Bytes::from(keccak256(xy).to_vec());

        let rp_id = origin
            .split_once("://")
            .map(|(_, host)| host)
            .unwrap_or(origin)
            .split([':', '/'])
            .next()
            .unwrap_or_default()
            .to_string();

        Self {
            signing_key,
            credential_id,
            rp_id,
            origin: origin.to_string(),
            counter: AtomicU32::new(0),
        }
    }

    pub fn from_hex(private_key: &str, origin: &str) -> Result<Self, Error> {
        let raw = hex::decode(private_key.trim().trim_start_matches("0x"))
            .map_err(|e| Error::Ceremony(format!("passkey private key is not hex: {e}")))?;
        let signing_key = SigningKey::from_slice(&raw)
            .map_err(|e| Error::Ceremony(format!("invalid P-256 private key: {e}")))?;
        Ok(Self::new(signing_key, origin))
    }

    pub fn with_credential_id(mut self, credential_id: Bytes) -> Self {
        self.credential_id = credential_id;
        self
    }

    pub fn credential_id(&self) -> &Bytes {
        &self.credential_id
    }

    pub fn public_key(&self) -> PublicKey {
        public_key_of(self.signing_key.verifying_key())
    }

    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    fn authenticator_data(&self) -> Vec<u8> {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut data = Vec::with_capacity(37);
        data.extend_from_slice(&Sha256::digest(self.rp_id.as_bytes()));
        data.push(FLAGS_UP_UV);
        data.extend_from_slice(&counter.to_be_bytes());
        data
    }
}

#[async_trait]
impl Authenticator for SoftwarePasskey {
    async fn get_assertion(&self, challenge: &[u8]) -> Result<RawAssertion, Error> {
        let client_data = ClientData {
            kind: "webauthn.get".to_string(),
            challenge: challenge_for(challenge),
            origin: self.origin.clone(),
            cross_origin: Some(false),
        };
        let client_data_json = serde_json::to_vec(&client_data)
            .map_err(|e| Error::Ceremony(format!("failed to serialize clientData: {e}")))?;
        let authenticator_data = self.authenticator_data();

        let mut signed = authenticator_data.clone();
        signed.extend_from_slice(&Sha256::digest(&client_data_json));
        let signature: Signature = self.signing_key.sign(&signed);

        Ok(RawAssertion {
            raw_id: self.credential_id.clone(),
            authenticator_data: Bytes::from(authenticator_data),
            client_data_json: Bytes::from(client_data_json),
            signature: Bytes::from(signature.to_der().as_bytes().to_vec()),
        })
    }
}

pub fn public_key_of(key: &VerifyingKey) -> PublicKey {
    let point = key.to_encoded_point(false);
    // uncompressed points always carry both coordinates
    let x = point.x().map(|x| H256::from_slice(x)).unwrap_or_default();
    let y = point.y().map(|y| H256::from_slice(y)).unwrap_or_default();
    PublicKey { x, y }
}
