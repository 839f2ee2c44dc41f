//! Call data for the passkey wallet, its factory/registry and the entry point.
//!
//! Selectors are the first four bytes of keccak256 over the canonical
//! signature; arguments use standard ABI encoding.

use crate::chain::ChainReader;
use crate::config::Network;
use crate::error::Error;
use crate::types::{Calls, NativeCall, PublicKey, TokenCall};
use ethers::abi::Token;
use ethers::types::{Address, Bytes, U256};
use ethers::utils::id;

pub const EXECUTE_BATCH: &str = "executeBatch((address,uint256,bytes)[])";
pub const TRANSFER_ERC20: &str = "transferERC20(address,address,uint256)";
pub const CREATE_ACCOUNT: &str = "createAccount(bytes32[2])";
pub const GET_ADDRESS: &str = "getAddress(bytes32[2])";
pub const GET_USER: &str = "getUser(uint256)";
pub const SAVE_USER: &str = "saveUser(uint256,bytes32[2])";
pub const BALANCE_OF: &str = "balanceOf(address)";

fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let selector = id(signature);
    let encoded = ethers::abi::encode(args);
    let mut v = Vec::with_capacity(4 + encoded.len());
    v.extend_from_slice(&selector);
    v.extend_from_slice(&encoded);
    Bytes::from(v)
}

fn public_key_token(public_key: &PublicKey) -> Token {
    Token::FixedArray(vec![
        Token::FixedBytes(public_key.x.as_bytes().to_vec()),
        Token::FixedBytes(public_key.y.as_bytes().to_vec()),
    ])
}

/// `callData` for the wallet's dispatch function.
pub fn encode_call_data(calls: &Calls) -> Result<Bytes, Error> {
    match calls {
        Calls::Native(batch) => encode_execute_batch(batch),
        Calls::Token(call) => Ok(encode_transfer_erc20(call)),
    }
}

fn encode_execute_batch(batch: &[NativeCall]) -> Result<Bytes, Error> {
    if batch.is_empty() {
        return Err(Error::Encoding("executeBatch needs at least one call".into()));
    }
    let calls = batch
        .iter()
        .map(|c| {
            Token::Tuple(vec![
                Token::Address(c.destination),
                Token::Uint(c.value),
                Token::Bytes(c.data.to_vec()),
            ])
        })
        .collect();
    Ok(encode_call(EXECUTE_BATCH, &[Token::Array(calls)]))
}

fn encode_transfer_erc20(call: &TokenCall) -> Bytes {
    encode_call(
        TRANSFER_ERC20,
        &[
            Token::Address(call.token),
            Token::Address(call.to),
            Token::Uint(call.amount),
        ],
    )
}

pub fn create_account_call_data(public_key: &PublicKey) -> Bytes {
    encode_call(CREATE_ACCOUNT, &[public_key_token(public_key)])
}

pub fn get_address_call_data(public_key: &PublicKey) -> Bytes {
    encode_call(GET_ADDRESS, &[public_key_token(public_key)])
}

pub fn get_user_call_data(id: U256) -> Bytes {
    encode_call(GET_USER, &[Token::Uint(id)])
}

/// Registry `saveUser(id, publicKey)`, sent by the relayer.
pub fn save_user_call_data(id: U256, public_key: &PublicKey) -> Bytes {
    encode_call(SAVE_USER, &[Token::Uint(id), public_key_token(public_key)])
}

pub fn balance_of_call_data(owner: Address) -> Bytes {
    encode_call(BALANCE_OF, &[Token::Address(owner)])
}

/// Deployment data for a wallet that does not exist yet.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InitCode {
    /// `factory ‖ createAccount(publicKey)`, empty for deployed wallets.
    pub code: Bytes,
    /// Gas the factory call is estimated to use; zero for deployed wallets.
    pub gas: U256,
}

/// Builds `initCode` for an undeployed wallet and dry-runs the factory call
/// from the relayer to estimate its gas.
pub async fn build_init_code(
    chain: &dyn ChainReader,
    network: &Network,
    public_key: &PublicKey,
    deployed: bool,
) -> Result<InitCode, Error> {
    if deployed {
        return Ok(InitCode::default());
    }

    let create_calldata = create_account_call_data(public_key);
    let gas = chain
        .estimate_gas(network.relayer, network.factory, create_calldata.clone())
        .await?;

    let mut v = Vec::with_capacity(20 + create_calldata.len());
    v.extend_from_slice(network.factory.as_bytes());
    v.extend_from_slice(create_calldata.as_ref());

    tracing::debug!(factory = %network.factory, init_code_gas = %gas, "built initCode");

    Ok(InitCode {
        code: Bytes::from(v),
        gas,
    })
}
