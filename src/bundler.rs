use crate::encoding::{fmt_address, fmt_h256, parse_h256, parse_u256_quantity, user_op_to_json};
use crate::error::Error;
use crate::types::UserOperation;
use async_trait::async_trait;
use ethers::types::{Address, H256, U256};
use serde_json::Value;
use std::time::Duration;

/// Fixed pad added to `verificationGasLimit` on top of the bundler estimate.
pub const VERIFICATION_GAS_PAD: u64 = 150_000;
/// Extra verification budget for on-chain P-256/WebAuthn signature checks.
pub const PASSKEY_VERIFICATION_GAS: u64 = 1_000_000;
/// `preVerificationGas` multiplier.
pub const PRE_VERIFICATION_GAS_MULTIPLIER: u64 = 2;
/// Per-request timeout for bundler JSON-RPC calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasPrice {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

impl GasEstimates {
    /// Applies the safety margins:
    /// `preVerificationGas * 2` and
    /// `verificationGasLimit + 150_000 + init_code_gas + 1_000_000`.
    pub fn with_safety_margin(&self, init_code_gas: U256) -> Result<GasEstimates, Error> {
        let overflow = || Error::Relay("gas estimate overflows uint256".into());

        let verification_gas_limit = self
            .verification_gas_limit
            .checked_add(U256::from(VERIFICATION_GAS_PAD))
            .and_then(|v| v.checked_add(init_code_gas))
            .and_then(|v| v.checked_add(U256::from(PASSKEY_VERIFICATION_GAS)))
            .ok_or_else(overflow)?;
        let pre_verification_gas = self
            .pre_verification_gas
            .checked_mul(U256::from(PRE_VERIFICATION_GAS_MULTIPLIER))
            .ok_or_else(overflow)?;

        Ok(GasEstimates {
            call_gas_limit: self.call_gas_limit,
            verification_gas_limit,
            pre_verification_gas,
        })
    }
}

/// The relay/bundler as seen by the UserOperation builder.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Suggested fees for the "slow" tier.
    async fn gas_price(&self) -> Result<GasPrice, Error>;

    async fn estimate_user_operation_gas(
        &self,
        user_op: &UserOperation,
        entrypoint: Address,
    ) -> Result<GasEstimates, Error>;

    /// Returns the userOpHash once the relay accepted the operation.
    /// Acceptance does not imply inclusion.
    async fn send_user_operation(
        &self,
        user_op: &UserOperation,
        entrypoint: Address,
    ) -> Result<H256, Error>;

    /// `None` while the operation is still pending.
    async fn get_user_operation_receipt(&self, user_op_hash: H256)
        -> Result<Option<Value>, Error>;
}

/// JSON-RPC client for an ERC-4337 bundler (Pimlico-compatible).
#[derive(Debug, Clone)]
pub struct BundlerClient {
    url: String,
    http: reqwest::Client,
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self::with_timeout(url, REQUEST_TIMEOUT)
    }

    /// `timeout` bounds each JSON-RPC request, not the receipt wait.
    pub fn with_timeout(url: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self { url, http }
    }

    /// Poll for a receipt until timeout. A zero timeout waits forever.
    pub async fn wait_user_operation_receipt(
        &self,
        user_op_hash: H256,
        timeout: Duration,
    ) -> Result<Value, Error> {
        let start = std::time::Instant::now();
        loop {
            if !timeout.is_zero() && start.elapsed() > timeout {
                return Err(Error::Relay(format!(
                    "timed out waiting for userOp receipt after {:?}",
                    timeout
                )));
            }

            match self.get_user_operation_receipt(user_op_hash).await {
                Ok(Some(v)) => return Ok(v),
                Ok(None) => {}
                Err(e) => {
                    // transient errors are common on free-tier bundlers; keep polling
                    tracing::warn!(error = %e, "bundler receipt poll error");
                }
            }

            tokio::time::sleep(Duration::from_millis(1500)).await;
        }
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, Error> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        tracing::debug!(method, url = %self.url, "bundler rpc");

        let resp = self
            .http
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&req)
            .send()
            .await
            .map_err(|e| Error::Relay(format!("{method}: POST {} failed: {e}", self.url)))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| Error::Relay(format!("{method}: failed to read response body: {e}")))?;

        parse_rpc_response(method, status, &text)
    }
}

#[async_trait]
impl Relay for BundlerClient {
    async fn gas_price(&self) -> Result<GasPrice, Error> {
        let res = self
            .rpc("pimlico_getUserOperationGasPrice", serde_json::json!([]))
            .await?;
        parse_gas_price(&res, "slow")
    }

    async fn estimate_user_operation_gas(
        &self,
        user_op: &UserOperation,
        entrypoint: Address,
    ) -> Result<GasEstimates, Error> {
        let params = serde_json::json!([user_op_to_json(user_op), fmt_address(entrypoint)]);
        let res = self.rpc("eth_estimateUserOperationGas", params).await?;
        parse_gas_estimates(&res)
    }

    async fn send_user_operation(
        &self,
        user_op: &UserOperation,
        entrypoint: Address,
    ) -> Result<H256, Error> {
        let params = serde_json::json!([user_op_to_json(user_op), fmt_address(entrypoint)]);
        let res = self.rpc("eth_sendUserOperation", params).await?;
        parse_userop_hash(&res)
    }

    async fn get_user_operation_receipt(
        &self,
        user_op_hash: H256,
    ) -> Result<Option<Value>, Error> {
        let params = serde_json::json!([fmt_h256(user_op_hash)]);
        let res = self.rpc("eth_getUserOperationReceipt", params).await?;
        Ok((!res.is_null()).then_some(res))
    }
}

fn parse_rpc_response(method: &str, status: reqwest::StatusCode, text: &str) -> Result<Value, Error> {
    if !status.is_success() {
        return Err(Error::Relay(format!("{method}: HTTP {status}: {}", text.trim())));
    }

    let body: Value = serde_json::from_str(text)
        .map_err(|e| Error::Relay(format!("{method}: failed to decode JSON: {e}")))?;

    if let Some(err) = body.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return Err(Error::Relay(format!("{method}: RPC error: {message}")));
    }

    body.get("result")
        .cloned()
        .ok_or_else(|| Error::Relay(format!("{method}: missing result field")))
}

fn parse_u256_field(v: &Value, key: &str) -> Result<U256, Error> {
    let s = v
        .get(key)
        .and_then(|x| x.as_str())
        .ok_or_else(|| Error::Relay(format!("missing or invalid field {key}")))?;
    parse_u256_quantity(s).map_err(|e| Error::Relay(format!("field {key}: {e}")))
}

fn parse_gas_price(res: &Value, tier: &str) -> Result<GasPrice, Error> {
    let tier_v = res
        .get(tier)
        .ok_or_else(|| Error::Relay(format!("gas price response has no {tier:?} tier: {res}")))?;
    Ok(GasPrice {
        max_fee_per_gas: parse_u256_field(tier_v, "maxFeePerGas")?,
        max_priority_fee_per_gas: parse_u256_field(tier_v, "maxPriorityFeePerGas")?,
    })
}

fn parse_gas_estimates(res: &Value) -> Result<GasEstimates, Error> {
    Ok(GasEstimates {
        call_gas_limit: parse_u256_field(res, "callGasLimit")?,
        verification_gas_limit: parse_u256_field(res, "verificationGasLimit")?,
        pre_verification_gas: parse_u256_field(res, "preVerificationGas")?,
    })
}

fn parse_userop_hash(res: &Value) -> Result<H256, Error> {
    // Most bundlers return the userOpHash directly as a JSON string.
    // Some wrap it in an object: { "result": "0x..." }.
    let hash_str = if let Some(s) = res.as_str() {
        s
    } else if let Some(s) = res.get("result").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOpHash").and_then(|v| v.as_str()) {
        s
    } else if let Some(s) = res.get("userOperationHash").and_then(|v| v.as_str()) {
        s
    } else {
        return Err(Error::Relay(format!(
            "unexpected eth_sendUserOperation result shape (expected string or {{result: ...}}): {}",
            res
        )));
    };

    parse_h256(hash_str).map_err(|e| Error::Relay(format!("bad userOpHash {hash_str}: {e}")))
}
