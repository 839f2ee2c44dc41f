use anyhow::{anyhow, Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::{env, fs, path::Path};

/// One entry of the networks table, e.g. `deployments/networks.json`:
///
/// ```json
/// {
///   "sepolia": {
///     "chainId": 11155111,
///     "rpc": "https://rpc.sepolia.org",
///     "bundler": "https://api.pimlico.io/v2/11155111/rpc",
///     "bundlerEnvVar": "PASSKEY_AA_SEPOLIA_BUNDLER",
///     "entryPoint": "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789",
///     "factory": "0x...",
///     "relayer": "0x061060a65146b3265C62fC8f3AE977c9B27260fF"
///   }
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRaw {
    pub chain_id: u64,
    pub rpc: String,
    #[serde(default)]
    pub rpc_env_var: Option<String>,
    pub bundler: String,
    /// Bundler URLs usually embed an API key; prefer keeping them in the environment.
    #[serde(default)]
    pub bundler_env_var: Option<String>,
    pub entry_point: String,
    pub factory: String,
    pub relayer: String,
    #[serde(default)]
    pub origin: Option<String>,
}

/// Everything the pipeline needs to know about one chain.
///
/// Passed explicitly to the resolver, encoder and clients.
#[derive(Debug, Clone)]
pub struct Network {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    pub bundler_url: String,
    pub entry_point: Address,
    /// Account registry and factory contract.
    pub factory: Address,
    /// Sender used to dry-run `createAccount` for the init-code gas estimate.
    pub relayer: Address,
    /// WebAuthn origin reported by the software passkey.
    pub origin: String,
}

#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub rpc: Option<String>,
    pub bundler: Option<String>,
}

pub const DEFAULT_ORIGIN: &str = "https://localhost";

pub fn load_network(path: &Path, name: &str, overrides: Overrides) -> Result<Network> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read networks json at {}", path.display()))?;
    parse_network(&raw, name, overrides)
        .with_context(|| format!("invalid networks json at {}", path.display()))
}

pub fn parse_network(raw: &str, name: &str, overrides: Overrides) -> Result<Network> {
    let table: BTreeMap<String, NetworkRaw> =
        serde_json::from_str(raw).context("failed to parse networks table")?;
    let raw = table.get(name).ok_or_else(|| {
        let known: Vec<&str> = table.keys().map(String::as_str).collect();
        anyhow!("unknown network {name:?} (known: {})", known.join(", "))
    })?;

    let rpc_url = pick_url(overrides.rpc, raw.rpc_env_var.as_deref(), &raw.rpc);
    let bundler_url = pick_url(overrides.bundler, raw.bundler_env_var.as_deref(), &raw.bundler);

    Ok(Network {
        name: name.to_string(),
        chain_id: raw.chain_id,
        rpc_url,
        bundler_url,
        entry_point: parse_addr(&raw.entry_point).context("invalid entryPoint address")?,
        factory: parse_addr(&raw.factory).context("invalid factory address")?,
        relayer: parse_addr(&raw.relayer).context("invalid relayer address")?,
        origin: raw
            .origin
            .clone()
            .unwrap_or_else(|| DEFAULT_ORIGIN.to_string()),
    })
}

fn pick_url(cli: Option<String>, env_var: Option<&str>, fallback: &str) -> String {
    if let Some(url) = cli {
        url
    } else if let Some(env_var) = env_var {
        env::var(env_var).unwrap_or_else(|_| fallback.to_string())
    } else {
        fallback.to_string()
    }
}

fn parse_addr(s: &str) -> Result<Address> {
    s.parse::<Address>().map_err(|e| anyhow!("{e}"))
}
