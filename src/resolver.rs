use crate::chain::ChainReader;
use crate::config::Network;
use crate::error::Error;
use crate::types::PublicKey;
use ethers::types::{Address, Bytes, U256};

/// Sender-side state of a passkey wallet, as read from the chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedAccount {
    pub address: Address,
    pub public_key: PublicKey,
    pub deployed: bool,
    pub nonce: U256,
}

/// Registry ids are uint256; credential ids longer than a word cannot be registered.
pub fn key_id_to_u256(key_id: &Bytes) -> Result<U256, Error> {
    if key_id.is_empty() || key_id.len() > 32 {
        return Err(Error::Resolution(format!(
            "key id must be 1..=32 bytes, got {}",
            key_id.len()
        )));
    }
    Ok(U256::from_big_endian(key_id))
}

/// Resolves the wallet bound to `key_id`: address (existing or
/// counterfactual), deployment status and the entry-point nonce for key 0.
pub async fn resolve_account(
    chain: &dyn ChainReader,
    network: &Network,
    key_id: &Bytes,
) -> Result<ResolvedAccount, Error> {
    let id = key_id_to_u256(key_id)?;
    let user = chain.get_user(network.factory, id).await?;
    if user.public_key.is_zero() {
        return Err(Error::Resolution(format!(
            "no public key registered for key id {key_id}"
        )));
    }

    let address = if user.account.is_zero() {
        counterfactual_address(chain, network, &user.public_key).await?
    } else {
        user.account
    };

    let (code, nonce) = tokio::try_join!(
        chain.get_code(address),
        chain.get_nonce(network.entry_point, address, U256::zero()),
    )?;

    let resolved = ResolvedAccount {
        address,
        public_key: user.public_key,
        deployed: !code.as_ref().is_empty(),
        nonce,
    };
    tracing::debug!(
        sender = %resolved.address,
        deployed = resolved.deployed,
        nonce = %resolved.nonce,
        "resolved account"
    );
    Ok(resolved)
}

/// Address for a bare public key, plus whether code is already deployed there.
pub async fn account_for_key(
    chain: &dyn ChainReader,
    network: &Network,
    public_key: &PublicKey,
) -> Result<(Address, bool), Error> {
    let address = counterfactual_address(chain, network, public_key).await?;
    let code = chain.get_code(address).await?;
    Ok((address, !code.as_ref().is_empty()))
}

pub async fn counterfactual_address(
    chain: &dyn ChainReader,
    network: &Network,
    public_key: &PublicKey,
) -> Result<Address, Error> {
    let address = chain.get_address(network.factory, public_key).await?;
    if address.is_zero() {
        return Err(Error::Resolution(
            "registry returned the zero address for getAddress".into(),
        ));
    }
    Ok(address)
}
