use ethers::types::{Address, Bytes, H256, U256};

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// Starts out as `UserOperation::default()` and is filled in strictly in order:
/// sender, nonce/initCode, callData, gas, signature. An empty
/// `paymaster_and_data` means no paymaster.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// Returns a tuple matching the Solidity struct layout, suitable for
    /// calling `EntryPoint.getUserOpHash((...))`.
    pub fn as_abi_tuple(
        &self,
    ) -> (
        Address,
        U256,
        Bytes,
        Bytes,
        U256,
        U256,
        U256,
        U256,
        U256,
        Bytes,
        Bytes,
    ) {
        (
            self.sender,
            self.nonce,
            self.init_code.clone(),
            self.call_data.clone(),
            self.call_gas_limit,
            self.verification_gas_limit,
            self.pre_verification_gas,
            self.max_fee_per_gas,
            self.max_priority_fee_per_gas,
            self.paymaster_and_data.clone(),
            self.signature.clone(),
        )
    }
}

/// P-256 public key of a passkey, stored on-chain as `bytes32[2]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublicKey {
    pub x: H256,
    pub y: H256,
}

impl PublicKey {
    pub fn is_zero(&self) -> bool {
        self.x.is_zero() && self.y.is_zero()
    }
}

/// Registry record returned by `getUser(id)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredUser {
    pub id: U256,
    pub public_key: PublicKey,
    /// Zero until a wallet has been bound to the key.
    pub account: Address,
}

/// One element of an `executeBatch` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NativeCall {
    pub destination: Address,
    pub value: U256,
    pub data: Bytes,
}

/// A single `transferERC20(token, to, amount)` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenCall {
    pub token: Address,
    pub to: Address,
    pub amount: U256,
}

/// The action a UserOperation performs. Exactly one shape per operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Calls {
    Native(Vec<NativeCall>),
    Token(TokenCall),
}
