use crate::calldata::{balance_of_call_data, get_address_call_data, get_user_call_data};
use crate::error::Error;
use crate::types::{PublicKey, RegisteredUser, UserOperation};
use async_trait::async_trait;
use ethers::abi::{Abi, AbiParser, ParamType, Token};
use ethers::prelude::*;
use ethers::providers::Middleware;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;

/// Read-only view of the chain the wallet lives on.
///
/// Contract addresses are passed on every call; implementations hold no
/// notion of a "current network".
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Registry `getUser(id)`.
    async fn get_user(&self, registry: Address, id: U256) -> Result<RegisteredUser, Error>;

    /// Registry `getAddress(publicKey)`: counterfactual wallet address.
    async fn get_address(&self, registry: Address, public_key: &PublicKey)
        -> Result<Address, Error>;

    /// `eth_getCode`; empty means nothing is deployed at `account`.
    async fn get_code(&self, account: Address) -> Result<Bytes, Error>;

    /// EntryPoint `getNonce(account, key)`.
    async fn get_nonce(&self, entry_point: Address, account: Address, key: U256)
        -> Result<U256, Error>;

    async fn estimate_gas(&self, from: Address, to: Address, data: Bytes) -> Result<U256, Error>;

    /// EntryPoint `getUserOpHash(op)`.
    async fn get_user_op_hash(&self, entry_point: Address, op: &UserOperation)
        -> Result<H256, Error>;

    /// Native balance in wei.
    async fn get_balance(&self, account: Address) -> Result<U256, Error>;

    /// ERC-20 `balanceOf(owner)` in the token's base units.
    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256, Error>;
}

/// State-changing transactions sent from the relayer key.
#[async_trait]
pub trait ChainWriter: Send + Sync {
    /// Sends the transaction and waits until it is mined; returns its hash.
    async fn send_transaction(&self, to: Address, data: Bytes, value: U256)
        -> Result<H256, Error>;
}

const GET_USER_OP_HASH_ABI: &str = r#"[{"inputs":[{"components":[{"internalType":"address","name":"sender","type":"address"},{"internalType":"uint256","name":"nonce","type":"uint256"},{"internalType":"bytes","name":"initCode","type":"bytes"},{"internalType":"bytes","name":"callData","type":"bytes"},{"internalType":"uint256","name":"callGasLimit","type":"uint256"},{"internalType":"uint256","name":"verificationGasLimit","type":"uint256"},{"internalType":"uint256","name":"preVerificationGas","type":"uint256"},{"internalType":"uint256","name":"maxFeePerGas","type":"uint256"},{"internalType":"uint256","name":"maxPriorityFeePerGas","type":"uint256"},{"internalType":"bytes","name":"paymasterAndData","type":"bytes"},{"internalType":"bytes","name":"signature","type":"bytes"}],"internalType":"struct UserOperation","name":"userOp","type":"tuple"}],"name":"getUserOpHash","outputs":[{"internalType":"bytes32","name":"","type":"bytes32"}],"stateMutability":"view","type":"function"}]"#;

/// `ChainReader` over any ethers middleware (usually `Provider<Http>`).
#[derive(Debug, Clone)]
pub struct EthersChain<M> {
    client: Arc<M>,
}

impl<M: Middleware + 'static> EthersChain<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }

    async fn eth_call(&self, to: Address, data: Bytes, what: &str) -> Result<Bytes, Error> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.client
            .call(&tx, None)
            .await
            .map_err(|e| Error::Resolution(format!("{what} failed: {e}")))
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainReader for EthersChain<M> {
    async fn get_user(&self, registry: Address, id: U256) -> Result<RegisteredUser, Error> {
        let out = self
            .eth_call(registry, get_user_call_data(id), "registry.getUser")
            .await?;
        decode_registered_user(&out)
    }

    async fn get_address(
        &self,
        registry: Address,
        public_key: &PublicKey,
    ) -> Result<Address, Error> {
        let out = self
            .eth_call(registry, get_address_call_data(public_key), "registry.getAddress")
            .await?;
        let tokens = ethers::abi::decode(&[ParamType::Address], &out)
            .map_err(|e| Error::Resolution(format!("bad getAddress return data: {e}")))?;
        match tokens.as_slice() {
            [Token::Address(a)] => Ok(*a),
            _ => Err(Error::Resolution("bad getAddress return data".into())),
        }
    }

    async fn get_code(&self, account: Address) -> Result<Bytes, Error> {
        self.client
            .get_code(account, None)
            .await
            .map_err(|e| Error::Resolution(format!("eth_getCode failed: {e}")))
    }

    async fn get_nonce(
        &self,
        entry_point: Address,
        account: Address,
        key: U256,
    ) -> Result<U256, Error> {
        let entrypoint_abi = AbiParser::default()
            .parse(&["function getNonce(address sender, uint192 key) view returns (uint256)"])
            .map_err(|e| Error::Resolution(format!("bad getNonce ABI: {e}")))?;
        let entrypoint_c = Contract::new(entry_point, entrypoint_abi, self.client.clone());

        entrypoint_c
            .method::<_, U256>("getNonce", (account, key))
            .map_err(|e| Error::Resolution(e.to_string()))?
            .call()
            .await
            .map_err(|e| Error::Resolution(format!("entryPoint.getNonce failed: {e}")))
    }

    async fn estimate_gas(&self, from: Address, to: Address, data: Bytes) -> Result<U256, Error> {
        let tx: TypedTransaction = TransactionRequest::new()
            .from(from)
            .to(to)
            .data(data)
            .into();
        self.client
            .estimate_gas(&tx, None)
            .await
            .map_err(|e| Error::Resolution(format!("eth_estimateGas failed: {e}")))
    }

    async fn get_user_op_hash(
        &self,
        entry_point: Address,
        op: &UserOperation,
    ) -> Result<H256, Error> {
        let entrypoint_abi: Abi = serde_json::from_str(GET_USER_OP_HASH_ABI)
            .map_err(|e| Error::Resolution(format!("failed to parse EntryPoint ABI: {e}")))?;
        let entrypoint_c = Contract::new(entry_point, entrypoint_abi, self.client.clone());

        entrypoint_c
            .method::<_, H256>("getUserOpHash", (op.as_abi_tuple(),))
            .map_err(|e| Error::Resolution(e.to_string()))?
            .call()
            .await
            .map_err(|e| Error::Resolution(format!("entryPoint.getUserOpHash failed: {e}")))
    }

    async fn get_balance(&self, account: Address) -> Result<U256, Error> {
        self.client
            .get_balance(account, None)
            .await
            .map_err(|e| Error::Resolution(format!("eth_getBalance failed: {e}")))
    }

    async fn token_balance(&self, token: Address, owner: Address) -> Result<U256, Error> {
        let out = self
            .eth_call(token, balance_of_call_data(owner), "token.balanceOf")
            .await?;
        decode_uint(&out, "balanceOf")
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainWriter for EthersChain<M> {
    async fn send_transaction(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> Result<H256, Error> {
        let tx = TransactionRequest::new().to(to).data(data).value(value);
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|e| Error::Registration(format!("failed to send tx to {to:?}: {e}")))?;
        let tx_hash = pending.tx_hash();

        let receipt = pending
            .await
            .map_err(|e| Error::Registration(format!("failed waiting for tx {tx_hash:?}: {e}")))?
            .ok_or_else(|| Error::Registration(format!("tx {tx_hash:?} dropped from mempool")))?;
        if receipt.status == Some(U64::zero()) {
            return Err(Error::Registration(format!("tx {tx_hash:?} reverted")));
        }
        Ok(receipt.transaction_hash)
    }
}

/// Decodes a single `uint256` return value.
pub fn decode_uint(out: &[u8], what: &str) -> Result<U256, Error> {
    match ethers::abi::decode(&[ParamType::Uint(256)], out) {
        Ok(tokens) => match tokens.as_slice() {
            [Token::Uint(v)] => Ok(*v),
            _ => Err(Error::Resolution(format!("bad {what} return data"))),
        },
        Err(e) => Err(Error::Resolution(format!("bad {what} return data: {e}"))),
    }
}

/// Decodes `getUser` return data: `(uint256 id, bytes32[2] publicKey, address account)`.
pub fn decode_registered_user(out: &[u8]) -> Result<RegisteredUser, Error> {
    let shape = ParamType::Tuple(vec![
        ParamType::Uint(256),
        ParamType::FixedArray(Box::new(ParamType::FixedBytes(32)), 2),
        ParamType::Address,
    ]);
    let bad = |detail: String| Error::Resolution(format!("bad getUser return data: {detail}"));

    let mut tokens = ethers::abi::decode(&[shape], out).map_err(|e| bad(e.to_string()))?;
    let fields = match tokens.pop() {
        Some(Token::Tuple(fields)) => fields,
        _ => return Err(bad("expected a tuple".into())),
    };

    match fields.as_slice() {
        [Token::Uint(id), Token::FixedArray(key), Token::Address(account)] => {
            let (x, y) = match key.as_slice() {
                [Token::FixedBytes(x), Token::FixedBytes(y)] if x.len() == 32 && y.len() == 32 => {
                    (H256::from_slice(x), H256::from_slice(y))
                }
                _ => return Err(bad("publicKey is not bytes32[2]".into())),
            };
            Ok(RegisteredUser {
                id: *id,
                public_key: PublicKey { x, y },
                account: *account,
            })
        }
        _ => Err(bad(format!("unexpected field layout ({} fields)", fields.len()))),
    }
}
