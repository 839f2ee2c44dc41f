//! Binding a new passkey to a wallet in the factory's registry.
//!
//! The relayer pays for this: it stores `(id, publicKey)` with `saveUser` and
//! then sends the counterfactual wallet a token amount of ether so the
//! address exists before the first UserOperation.

use crate::calldata::save_user_call_data;
use crate::chain::{ChainReader, ChainWriter};
use crate::config::Network;
use crate::error::Error;
use crate::resolver::{counterfactual_address, key_id_to_u256};
use crate::types::PublicKey;
use ethers::types::{Address, Bytes, H256, U256};

/// Wei sent to a freshly registered wallet.
pub const DEFAULT_FUNDING_WEI: u64 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    pub id: U256,
    pub public_key: PublicKey,
    pub account: Address,
    pub save_tx: H256,
    /// `None` when funding was skipped.
    pub funding_tx: Option<H256>,
}

pub async fn register_user(
    chain: &dyn ChainReader,
    writer: &dyn ChainWriter,
    network: &Network,
    key_id: &Bytes,
    public_key: &PublicKey,
    funding: U256,
) -> Result<Registration, Error> {
    if public_key.is_zero() {
        return Err(Error::Registration("refusing to register the zero public key".into()));
    }
    let id = key_id_to_u256(key_id)?;

    let existing = chain.get_user(network.factory, id).await?;
    if !existing.account.is_zero() || !existing.public_key.is_zero() {
        return Err(Error::Registration(format!(
            "user already exists for key id {key_id} (account {:?})",
            existing.account
        )));
    }

    tracing::info!(key_id = %key_id, registry = %network.factory, "saving user");
    let save_tx = writer
        .send_transaction(network.factory, save_user_call_data(id, public_key), U256::zero())
        .await?;

    let account = counterfactual_address(chain, network, public_key).await?;

    let funding_tx = if funding.is_zero() {
        None
    } else {
        let tx = writer
            .send_transaction(account, Bytes::default(), funding)
            .await?;
        tracing::info!(account = %account, wei = %funding, "funded smart account");
        Some(tx)
    };

    Ok(Registration {
        id,
        public_key: *public_key,
        account,
        save_tx,
        funding_tx,
    })
}
