//! In-memory collaborators for unit tests.

use crate::bundler::{GasEstimates, GasPrice, Relay};
use crate::chain::{ChainReader, ChainWriter};
use crate::config::Network;
use crate::error::Error;
use crate::passkey::{Authenticator, SoftwarePasskey};
use crate::types::{PublicKey, RegisteredUser, UserOperation};
use crate::webauthn::RawAssertion;
use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256, U256};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn network() -> Network {
    Network {
        name: "testnet".into(),
        chain_id: 31337,
        rpc_url: "http://127.0.0.1:8545".into(),
        bundler_url: "http://127.0.0.1:4337".into(),
        entry_point: "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789"
            .parse()
            .unwrap(),
        factory: Address::from([0xfa; 20]),
        relayer: "0x061060a65146b3265C62fC8f3AE977c9B27260fF"
            .parse()
            .unwrap(),
        origin: "https://localhost".into(),
    }
}

/// Registry + entry point answering from fixed values. `getUser` answers for any id.
pub struct FakeChain {
    pub user: RegisteredUser,
    pub counterfactual: Address,
    pub code: Bytes,
    pub nonce: U256,
    pub init_gas: U256,
    pub op_hash: H256,
    pub fail_nonce: bool,
    log: Mutex<Vec<String>>,
    hashed: Mutex<Vec<UserOperation>>,
}

impl FakeChain {
    pub fn undeployed() -> Self {
        Self {
            user: RegisteredUser {
                id: U256::from_big_endian(&[0xab; 32]),
                public_key: PublicKey {
                    x: H256([0x11; 32]),
                    y: H256([0x22; 32]),
                },
                account: Address::zero(),
            },
            counterfactual: Address::from([0xcf; 20]),
            code: Bytes::default(),
            nonce: U256::zero(),
            init_gas: U256::from(310_000u64),
            op_hash: H256([0x5e; 32]),
            fail_nonce: false,
            log: Mutex::new(Vec::new()),
            hashed: Mutex::new(Vec::new()),
        }
    }

    /// Nothing stored for any id yet.
    pub fn unregistered() -> Self {
        let mut chain = Self::undeployed();
        chain.user.public_key = PublicKey::default();
        chain
    }

    pub fn deployed() -> Self {
        let mut chain = Self::undeployed();
        chain.user.account = Address::from([0xac; 20]);
        chain.code = Bytes::from(vec![0x60, 0x80, 0x60, 0x40]);
        chain.nonce = U256::from(7u64);
        chain
    }

    pub fn key_id(&self) -> Bytes {
        let mut id = [0u8; 32];
        self.user.id.to_big_endian(&mut id);
        Bytes::from(id.to_vec())
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn hashed_ops(&self) -> Vec<UserOperation> {
        self.hashed.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.log.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl ChainReader for FakeChain {
    async fn get_user(&self, _registry: Address, _id: U256) -> Result<RegisteredUser, Error> {
        self.record("getUser");
        Ok(self.user.clone())
    }

    async fn get_address(
        &self,
        _registry: Address,
        _public_key: &PublicKey,
    ) -> Result<Address, Error> {
        self.record("getAddress");
        Ok(self.counterfactual)
    }

    async fn get_code(&self, _account: Address) -> Result<Bytes, Error> {
        self.record("getCode");
        Ok(self.code.clone())
    }

    async fn get_nonce(
        &self,
        _entry_point: Address,
        _account: Address,
        _key: U256,
    ) -> Result<U256, Error> {
        self.record("getNonce");
        if self.fail_nonce {
            return Err(Error::Resolution("entryPoint.getNonce failed: execution reverted".into()));
        }
        Ok(self.nonce)
    }

    async fn estimate_gas(&self, _from: Address, _to: Address, _data: Bytes) -> Result<U256, Error> {
        self.record("estimateGas");
        Ok(self.init_gas)
    }

    async fn get_user_op_hash(
        &self,
        _entry_point: Address,
        op: &UserOperation,
    ) -> Result<H256, Error> {
        self.record("getUserOpHash");
        self.hashed.lock().unwrap().push(op.clone());
        Ok(self.op_hash)
    }

    async fn get_balance(&self, _account: Address) -> Result<U256, Error> {
        self.record("getBalance");
        Ok(U256::from(1u64))
    }

    async fn token_balance(&self, _token: Address, _owner: Address) -> Result<U256, Error> {
        self.record("balanceOf");
        Ok(U256::zero())
    }
}

/// Records relayer transactions instead of sending them.
#[derive(Default)]
pub struct FakeWriter {
    revert_value_transfers: bool,
    sent: Mutex<Vec<(Address, Bytes, U256)>>,
}

impl FakeWriter {
    /// Contract calls go through; ether transfers revert.
    pub fn reverting_transfers() -> Self {
        Self {
            revert_value_transfers: true,
            ..Default::default()
        }
    }

    pub fn sent(&self) -> Vec<(Address, Bytes, U256)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChainWriter for FakeWriter {
    async fn send_transaction(
        &self,
        to: Address,
        data: Bytes,
        value: U256,
    ) -> Result<H256, Error> {
        if self.revert_value_transfers && !value.is_zero() {
            return Err(Error::Registration(format!("tx to {to:?} reverted")));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push((to, data, value));
        Ok(H256::from_low_u64_be(sent.len() as u64))
    }
}

pub struct FakeRelay {
    pub price: GasPrice,
    pub estimates: GasEstimates,
    pub op_hash: H256,
    estimate_error: Mutex<Option<String>>,
    send_error: Mutex<Option<String>>,
    sent: Mutex<Vec<UserOperation>>,
    gas_price_calls: AtomicUsize,
}

impl Default for FakeRelay {
    fn default() -> Self {
        Self {
            price: GasPrice {
                max_fee_per_gas: U256::from(1_500_000_000u64),
                max_priority_fee_per_gas: U256::from(1_000_000_000u64),
            },
            estimates: GasEstimates {
                call_gas_limit: U256::from(35_000u64),
                verification_gas_limit: U256::from(70_000u64),
                pre_verification_gas: U256::from(48_000u64),
            },
            op_hash: H256([0x0b; 32]),
            estimate_error: Mutex::new(None),
            send_error: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            gas_price_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeRelay {
    pub fn fail_estimate(&self, message: &str) {
        *self.estimate_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn reject_send(&self, message: &str) {
        *self.send_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn sent(&self) -> Vec<UserOperation> {
        self.sent.lock().unwrap().clone()
    }

    pub fn gas_price_calls(&self) -> usize {
        self.gas_price_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Relay for FakeRelay {
    async fn gas_price(&self) -> Result<GasPrice, Error> {
        self.gas_price_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.price)
    }

    async fn estimate_user_operation_gas(
        &self,
        user_op: &UserOperation,
        _entrypoint: Address,
    ) -> Result<GasEstimates, Error> {
        assert!(user_op.signature.is_empty(), "estimation draft must be unsigned");
        let failure = self.estimate_error.lock().unwrap().clone();
        if let Some(message) = failure {
            return Err(Error::Relay(message));
        }
        Ok(self.estimates)
    }

    async fn send_user_operation(
        &self,
        user_op: &UserOperation,
        _entrypoint: Address,
    ) -> Result<H256, Error> {
        let failure = self.send_error.lock().unwrap().clone();
        if let Some(message) = failure {
            return Err(Error::Relay(format!("eth_sendUserOperation: RPC error: {message}")));
        }
        self.sent.lock().unwrap().push(user_op.clone());
        Ok(self.op_hash)
    }

    async fn get_user_operation_receipt(
        &self,
        _user_op_hash: H256,
    ) -> Result<Option<Value>, Error> {
        Ok(None)
    }
}

/// Wraps a software passkey and counts ceremonies.
pub struct CountingAuthenticator {
    inner: SoftwarePasskey,
    count: AtomicUsize,
}

impl CountingAuthenticator {
    pub fn new(inner: SoftwarePasskey) -> Self {
        Self {
            inner,
            count: AtomicUsize::new(0),
        }
    }

    pub fn ceremonies(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for CountingAuthenticator {
    async fn get_assertion(&self, challenge: &[u8]) -> Result<RawAssertion, Error> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.inner.get_assertion(challenge).await
    }
}

/// Authenticators that misbehave in a fixed way.
pub enum ScriptedAuthenticator {
    /// Signs a challenge other than the one it was asked for.
    SignsOtherChallenge(SoftwarePasskey),
    /// The user dismisses the prompt.
    Cancelled,
}

#[async_trait]
impl Authenticator for ScriptedAuthenticator {
    async fn get_assertion(&self, challenge: &[u8]) -> Result<RawAssertion, Error> {
        match self {
            Self::SignsOtherChallenge(passkey) => {
                let mut other = challenge.to_vec();
                if let Some(last) = other.last_mut() {
                    *last ^= 0xff;
                }
                passkey.get_assertion(&other).await
            }
            Self::Cancelled => Err(Error::Ceremony(
                "NotAllowedError: the operation was cancelled".into(),
            )),
        }
    }
}
