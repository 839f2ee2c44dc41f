//! UserOperation builder.
//!
//! One build walks `Resolving → Encoding → GasEstimating → Hashing →
//! AwaitingSignature → Submitting → Submitted`. Each state consumes the
//! previous state's output and produces a new immutable value; any failure
//! ends the attempt with a [`BuildError`] naming the state it happened in.
//! Nothing is retried here: a retry is a fresh build, which re-reads the
//! nonce and gas.

use crate::bundler::Relay;
use crate::calldata::{build_init_code, encode_call_data, InitCode};
use crate::chain::ChainReader;
use crate::config::Network;
use crate::error::{at, BuildError, BuildState, Error};
use crate::passkey::Authenticator;
use crate::resolver::{resolve_account, ResolvedAccount};
use crate::types::{Calls, UserOperation};
use crate::webauthn::{
    challenge_for, check_credential, encode_assertion, signing_message, SignatureAssertion,
};
use ethers::types::{Address, Bytes, H256};
use std::sync::Arc;

/// What to execute, and with which passkey.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    /// Credential id of the passkey that owns the wallet.
    pub key_id: Bytes,
    pub calls: Calls,
}

#[derive(Clone, Debug)]
pub struct Encoded {
    pub account: ResolvedAccount,
    pub call_data: Bytes,
    pub init_code: InitCode,
}

/// Priced and gas-estimated operation with an empty signature.
#[derive(Clone, Debug)]
pub struct Draft {
    pub op: UserOperation,
}

#[derive(Clone, Debug)]
pub struct Hashed {
    pub op: UserOperation,
    pub user_op_hash: H256,
}

/// A fully populated operation, ready for the relay.
#[derive(Clone, Debug)]
pub struct SignedOperation {
    pub op: UserOperation,
    pub user_op_hash: H256,
    pub assertion: SignatureAssertion,
}

#[derive(Clone, Debug)]
pub struct Submission {
    pub op: UserOperation,
    /// Relay-issued identifier; inclusion is not guaranteed yet.
    pub user_op_hash: H256,
}

pub struct UserOpBuilder {
    chain: Arc<dyn ChainReader>,
    relay: Arc<dyn Relay>,
    authenticator: Arc<dyn Authenticator>,
    network: Network,
}

impl UserOpBuilder {
    pub fn new(
        chain: Arc<dyn ChainReader>,
        relay: Arc<dyn Relay>,
        authenticator: Arc<dyn Authenticator>,
        network: Network,
    ) -> Self {
        Self {
            chain,
            relay,
            authenticator,
            network,
        }
    }

    pub fn entry_point(&self) -> Address {
        self.network.entry_point
    }

    /// Runs every state up to and including `AwaitingSignature`.
    pub async fn build(&self, req: &BuildRequest) -> Result<SignedOperation, BuildError> {
        let account = self.resolve(req).await.map_err(at(BuildState::Resolving))?;
        let encoded = self
            .encode(req, account)
            .await
            .map_err(at(BuildState::Encoding))?;
        let draft = self
            .estimate_gas(encoded)
            .await
            .map_err(at(BuildState::GasEstimating))?;
        let hashed = self.hash(draft).await.map_err(at(BuildState::Hashing))?;
        self.sign(hashed, &req.key_id)
            .await
            .map_err(at(BuildState::AwaitingSignature))
    }

    /// Builds, signs and hands the operation to the relay.
    pub async fn submit(&self, req: &BuildRequest) -> Result<Submission, BuildError> {
        let signed = self.build(req).await?;
        self.send(signed).await.map_err(at(BuildState::Submitting))
    }

    async fn resolve(&self, req: &BuildRequest) -> Result<ResolvedAccount, Error> {
        tracing::info!(state = %BuildState::Resolving, key_id = %req.key_id, "resolving account");
        resolve_account(self.chain.as_ref(), &self.network, &req.key_id).await
    }

    async fn encode(&self, req: &BuildRequest, account: ResolvedAccount) -> Result<Encoded, Error> {
        tracing::info!(
            state = %BuildState::Encoding,
            sender = %account.address,
            deployed = account.deployed,
            "encoding call data"
        );
        let call_data = encode_call_data(&req.calls)?;
        let init_code = build_init_code(
            self.chain.as_ref(),
            &self.network,
            &account.public_key,
            account.deployed,
        )
        .await?;
        Ok(Encoded {
            account,
            call_data,
            init_code,
        })
    }

    async fn estimate_gas(&self, encoded: Encoded) -> Result<Draft, Error> {
        tracing::info!(state = %BuildState::GasEstimating, "estimating gas");
        let price = self.relay.gas_price().await?;

        let mut op = UserOperation {
            sender: encoded.account.address,
            nonce: encoded.account.nonce,
            init_code: encoded.init_code.code,
            call_data: encoded.call_data,
            max_fee_per_gas: price.max_fee_per_gas,
            max_priority_fee_per_gas: price.max_priority_fee_per_gas,
            ..Default::default()
        };

        let raw = self
            .relay
            .estimate_user_operation_gas(&op, self.network.entry_point)
            .await?;
        let gas = raw.with_safety_margin(encoded.init_code.gas)?;
        tracing::debug!(
            call_gas_limit = %gas.call_gas_limit,
            verification_gas_limit = %gas.verification_gas_limit,
            pre_verification_gas = %gas.pre_verification_gas,
            "gas limits after safety margin"
        );

        op.call_gas_limit = gas.call_gas_limit;
        op.verification_gas_limit = gas.verification_gas_limit;
        op.pre_verification_gas = gas.pre_verification_gas;
        Ok(Draft { op })
    }

    async fn hash(&self, draft: Draft) -> Result<Hashed, Error> {
        tracing::info!(state = %BuildState::Hashing, "computing userOpHash");
        if !draft.op.signature.is_empty() {
            return Err(Error::HashMismatch(
                "draft operations must be hashed with an empty signature".into(),
            ));
        }
        let user_op_hash = self
            .chain
            .get_user_op_hash(self.network.entry_point, &draft.op)
            .await?;
        Ok(Hashed {
            op: draft.op,
            user_op_hash,
        })
    }

    async fn sign(&self, hashed: Hashed, key_id: &Bytes) -> Result<SignedOperation, Error> {
        tracing::info!(
            state = %BuildState::AwaitingSignature,
            user_op_hash = %crate::encoding::fmt_h256(hashed.user_op_hash),
            "requesting passkey assertion"
        );
        let message = signing_message(hashed.user_op_hash);
        let raw = self.authenticator.get_assertion(&message).await?;
        check_credential(&raw.raw_id, key_id)?;

        let assertion = SignatureAssertion::from_raw(&raw)?;
        if assertion.client_data.challenge != challenge_for(&message) {
            return Err(Error::HashMismatch(format!(
                "passkey signed challenge {} but the operation needs {}",
                assertion.client_data.challenge,
                challenge_for(&message)
            )));
        }
        if assertion.client_data_json()?.as_bytes() != raw.client_data_json.as_ref() {
            tracing::warn!(
                "authenticator clientDataJSON differs from its canonical re-serialization; \
                 on-chain verification may fail"
            );
        }

        let op = UserOperation {
            signature: encode_assertion(&assertion)?,
            ..hashed.op
        };
        Ok(SignedOperation {
            op,
            user_op_hash: hashed.user_op_hash,
            assertion,
        })
    }

    async fn send(&self, signed: SignedOperation) -> Result<Submission, Error> {
        tracing::info!(state = %BuildState::Submitting, sender = %signed.op.sender, "submitting");
        let user_op_hash = self
            .relay
            .send_user_operation(&signed.op, self.network.entry_point)
            .await?;
        tracing::info!(
            state = %BuildState::Submitted,
            user_op_hash = %crate::encoding::fmt_h256(user_op_hash),
            "relay accepted userOp"
        );
        Ok(Submission {
            op: signed.op,
            user_op_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::GasEstimates;
    use crate::passkey::SoftwarePasskey;
    use crate::testing::{network, CountingAuthenticator, FakeChain, FakeRelay, ScriptedAuthenticator};
    use crate::types::{NativeCall, TokenCall};
    use ethers::types::U256;

    fn native_transfer(key_id: Bytes) -> BuildRequest {
        BuildRequest {
            key_id,
            calls: Calls::Native(vec![NativeCall {
                destination: Address::from([0xde; 20]),
                value: U256::from(1_000u64),
                data: Bytes::default(),
            }]),
        }
    }

    struct Fixture {
        chain: Arc<FakeChain>,
        relay: Arc<FakeRelay>,
        authenticator: Arc<CountingAuthenticator>,
    }

    impl Fixture {
        fn new(chain: FakeChain) -> Self {
            let passkey = passkey_for(&chain);
            Self {
                chain: Arc::new(chain),
                relay: Arc::new(FakeRelay::default()),
                authenticator: Arc::new(CountingAuthenticator::new(passkey)),
            }
        }

        fn builder(&self) -> UserOpBuilder {
            UserOpBuilder::new(
                self.chain.clone(),
                self.relay.clone(),
                self.authenticator.clone(),
                network(),
            )
        }
    }

    #[tokio::test]
    async fn undeployed_wallet_is_created_and_submitted() {
        let fx = Fixture::new(FakeChain::undeployed());
        let key_id = fx.chain.key_id();

        let submission = fx.builder().submit(&native_transfer(key_id)).await.unwrap();
        let op = &submission.op;

        assert_eq!(submission.user_op_hash, fx.relay.op_hash);
        assert_eq!(op.sender, fx.chain.counterfactual);
        assert_eq!(op.nonce, fx.chain.nonce);
        assert!(!op.init_code.is_empty());
        assert_eq!(&op.init_code[..20], network().factory.as_bytes());

        let est = fx.relay.estimates;
        assert_eq!(
            op.verification_gas_limit,
            est.verification_gas_limit
                + U256::from(150_000u64)
                + fx.chain.init_gas
                + U256::from(1_000_000u64)
        );
        assert_eq!(op.pre_verification_gas, est.pre_verification_gas * U256::from(2u64));
        assert_eq!(op.call_gas_limit, est.call_gas_limit);
        assert_eq!(op.max_fee_per_gas, fx.relay.price.max_fee_per_gas);
        assert_eq!(&op.signature[..7], &[1, 0, 0, 0, 0, 0, 0]);

        let sent = fx.relay.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0], op);
    }

    #[tokio::test]
    async fn deployed_wallet_has_empty_init_code() {
        let fx = Fixture::new(FakeChain::deployed());
        let key_id = fx.chain.key_id();
        let signed = fx
            .builder()
            .build(&BuildRequest {
                key_id,
                calls: Calls::Token(TokenCall {
                    token: Address::from([0x70; 20]),
                    to: Address::from([0x71; 20]),
                    amount: U256::from(5u64),
                }),
            })
            .await
            .unwrap();

        assert!(signed.op.init_code.is_empty());
        assert_eq!(signed.op.sender, fx.chain.user.account);
        assert_eq!(
            signed.op.verification_gas_limit,
            fx.relay.estimates.verification_gas_limit + U256::from(1_150_000u64)
        );
        assert!(!fx.chain.calls().contains(&"estimateGas".to_string()));
        // build() is a dry run
        assert!(fx.relay.sent().is_empty());
    }

    #[tokio::test]
    async fn hash_is_taken_over_the_unsigned_draft() {
        let fx = Fixture::new(FakeChain::undeployed());
        let signed = fx
            .builder()
            .build(&native_transfer(fx.chain.key_id()))
            .await
            .unwrap();

        let hashed = fx.chain.hashed_ops();
        assert_eq!(hashed.len(), 1);
        assert!(hashed[0].signature.is_empty());
        assert_eq!(
            UserOperation {
                signature: Bytes::default(),
                ..signed.op.clone()
            },
            hashed[0]
        );
        assert_eq!(
            signed.assertion.client_data.challenge,
            challenge_for(&signing_message(fx.chain.op_hash))
        );
    }

    #[tokio::test]
    async fn hashing_refuses_a_signed_draft() {
        let fx = Fixture::new(FakeChain::undeployed());
        let draft = Draft {
            op: UserOperation {
                signature: Bytes::from(vec![1u8]),
                ..Default::default()
            },
        };
        let err = fx.builder().hash(draft).await.unwrap_err();
        assert!(matches!(err, Error::HashMismatch(_)));
        assert!(fx.chain.hashed_ops().is_empty());
    }

    #[tokio::test]
    async fn wrong_passkey_fails_before_submit() {
        let fx = Fixture::new(FakeChain::undeployed());
        // the fake registry answers for any id, so resolution succeeds
        let req = native_transfer(Bytes::from(vec![0x99; 32]));

        let err = fx.builder().submit(&req).await.unwrap_err();
        assert_eq!(err.state, BuildState::AwaitingSignature);
        assert!(matches!(err.source, Error::CredentialMismatch { .. }));
        assert!(!err.requires_fresh_attempt());
        assert!(fx.relay.sent().is_empty());
    }

    fn passkey_for(chain: &FakeChain) -> SoftwarePasskey {
        SoftwarePasskey::from_hex(&"42".repeat(32), "https://localhost")
            .unwrap()
            .with_credential_id(chain.key_id())
    }

    #[tokio::test]
    async fn assertion_over_another_challenge_is_a_hash_mismatch() {
        let chain = Arc::new(FakeChain::deployed());
        let relay = Arc::new(FakeRelay::default());
        let authenticator = Arc::new(ScriptedAuthenticator::SignsOtherChallenge(passkey_for(
            &chain,
        )));
        let builder = UserOpBuilder::new(chain.clone(), relay.clone(), authenticator, network());

        let err = builder
            .submit(&native_transfer(chain.key_id()))
            .await
            .unwrap_err();
        assert_eq!(err.state, BuildState::AwaitingSignature);
        assert!(matches!(err.source, Error::HashMismatch(_)));
        assert!(err.requires_fresh_attempt());
        assert!(relay.sent().is_empty());
    }

    #[tokio::test]
    async fn cancelled_ceremony_can_be_prompted_again() {
        let chain = Arc::new(FakeChain::deployed());
        let relay = Arc::new(FakeRelay::default());
        let builder = UserOpBuilder::new(
            chain.clone(),
            relay.clone(),
            Arc::new(ScriptedAuthenticator::Cancelled),
            network(),
        );

        let err = builder
            .submit(&native_transfer(chain.key_id()))
            .await
            .unwrap_err();
        assert_eq!(err.state, BuildState::AwaitingSignature);
        assert!(matches!(err.source, Error::Ceremony(_)));
        assert!(!err.requires_fresh_attempt());
        assert_eq!(chain.hashed_ops().len(), 1);
        assert!(relay.sent().is_empty());
    }

    #[tokio::test]
    async fn malformed_estimate_never_reaches_the_passkey() {
        let fx = Fixture::new(FakeChain::undeployed());
        fx.relay.fail_estimate("eth_estimateUserOperationGas: failed to decode JSON");

        let err = fx
            .builder()
            .submit(&native_transfer(fx.chain.key_id()))
            .await
            .unwrap_err();
        assert_eq!(err.state, BuildState::GasEstimating);
        assert!(matches!(err.source, Error::Relay(_)));
        assert!(err.requires_fresh_attempt());
        assert_eq!(fx.authenticator.ceremonies(), 0);
        assert!(fx.chain.hashed_ops().is_empty());
    }

    #[tokio::test]
    async fn empty_batch_fails_in_encoding() {
        let fx = Fixture::new(FakeChain::deployed());
        let err = fx
            .builder()
            .submit(&BuildRequest {
                key_id: fx.chain.key_id(),
                calls: Calls::Native(vec![]),
            })
            .await
            .unwrap_err();
        assert_eq!(err.state, BuildState::Encoding);
        assert!(matches!(err.source, Error::Encoding(_)));
    }

    #[tokio::test]
    async fn resolution_failure_is_tagged() {
        let mut chain = FakeChain::undeployed();
        chain.fail_nonce = true;
        let fx = Fixture::new(chain);
        let err = fx
            .builder()
            .submit(&native_transfer(fx.chain.key_id()))
            .await
            .unwrap_err();
        assert_eq!(err.state, BuildState::Resolving);
        assert_eq!(fx.relay.gas_price_calls(), 0);
    }

    #[tokio::test]
    async fn relay_rejection_fails_in_submitting() {
        let fx = Fixture::new(FakeChain::deployed());
        fx.relay.reject_send("AA23 reverted");
        let err = fx
            .builder()
            .submit(&native_transfer(fx.chain.key_id()))
            .await
            .unwrap_err();
        assert_eq!(err.state, BuildState::Submitting);
        assert!(err.to_string().contains("AA23 reverted"));
    }

    #[test]
    fn safety_margin_matches_builder_policy() {
        let est = GasEstimates {
            call_gas_limit: U256::from(1u64),
            verification_gas_limit: U256::from(2u64),
            pre_verification_gas: U256::from(3u64),
        };
        let padded = est.with_safety_margin(U256::from(4u64)).unwrap();
        assert_eq!(padded.verification_gas_limit, U256::from(1_150_006u64));
        assert_eq!(padded.pre_verification_gas, U256::from(6u64));
    }
}
