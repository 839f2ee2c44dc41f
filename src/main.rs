mod builder;
mod bundler;
mod calldata;
mod chain;
mod config;
mod encoding;
mod error;
mod passkey;
mod registration;
mod resolver;
#[cfg(test)]
mod testing;
mod types;
mod webauthn;

use anyhow::{anyhow, bail, Context, Result};
use builder::{BuildRequest, UserOpBuilder};
use bundler::{BundlerClient, Relay};
use chain::{ChainReader, EthersChain};
use clap::{Args, Parser, Subcommand};
use config::{load_network, Network, Overrides};
use ethers::prelude::*;
use passkey::SoftwarePasskey;
use rand::rngs::OsRng;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use types::{Calls, NativeCall, PublicKey, TokenCall};

#[derive(Parser, Debug)]
#[command(name = "passkey-aa", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the smart wallet address for a passkey (and deployment status / nonce).
    Account(AccountArgs),

    /// Create a software passkey and save its private key under .secrets/.
    Keygen(KeygenArgs),

    /// Register a passkey in the account registry (relayer-paid) and fund its wallet.
    Register(RegisterArgs),

    /// Print the native (and optionally ERC-20) balance of a passkey wallet.
    Balance(BalanceArgs),

    /// Build + send a UserOperation executing a batch of native calls.
    SendNative(SendNativeArgs),

    /// Build + send a UserOperation transferring an ERC-20 token.
    SendToken(SendTokenArgs),

    /// Decode a DER ECDSA signature into normalized (r, s).
    DecodeSignature(DecodeSignatureArgs),

    /// Wait for a UserOperation receipt.
    Receipt(ReceiptArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Networks table (chain-keyed deployment addresses and endpoints).
    #[arg(long, default_value = "deployments/networks.json")]
    deployments: PathBuf,

    /// Network name inside the networks table.
    #[arg(long, env = "PASSKEY_AA_NETWORK", default_value = "sepolia")]
    network: String,

    /// Override the chain RPC URL.
    #[arg(long, env = "PASSKEY_AA_RPC_URL")]
    rpc: Option<String>,

    /// Override the bundler RPC URL.
    #[arg(long, env = "PASSKEY_AA_BUNDLER_URL")]
    bundler: Option<String>,
}

#[derive(Args, Debug)]
struct PasskeyArgs {
    /// Software passkey P-256 private key (hex).
    ///
    /// Recommended: set via env var PASSKEY_AA_PRIVATE_KEY.
    #[arg(long, env = "PASSKEY_AA_PRIVATE_KEY", hide_env_values = true)]
    passkey_private_key: String,

    /// Credential id registered for the passkey (hex). Defaults to keccak256(x ‖ y).
    #[arg(long)]
    key_id: Option<String>,
}

#[derive(Args, Debug)]
struct AccountArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Credential id registered in the account registry (hex).
    #[arg(long, conflicts_with_all = ["pubkey_x", "pubkey_y"])]
    key_id: Option<String>,

    /// Public key x coordinate (bytes32 hex), for keys not registered yet.
    #[arg(long, requires = "pubkey_y")]
    pubkey_x: Option<String>,

    #[arg(long, requires = "pubkey_x")]
    pubkey_y: Option<String>,
}

#[derive(Args, Debug)]
struct KeygenArgs {
    /// Origin the software passkey reports in its client data.
    #[arg(long, default_value = config::DEFAULT_ORIGIN)]
    origin: String,
}

#[derive(Args, Debug)]
struct RegisterArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    passkey: PasskeyArgs,

    /// Relayer EOA private key; pays for saveUser and the funding transfer.
    ///
    /// Recommended: set via env var PASSKEY_AA_RELAYER_PRIVATE_KEY.
    #[arg(long, env = "PASSKEY_AA_RELAYER_PRIVATE_KEY", hide_env_values = true)]
    relayer_private_key: String,

    /// Wei sent to the new wallet after registration (0 skips funding).
    #[arg(long, default_value_t = registration::DEFAULT_FUNDING_WEI)]
    fund_wei: u64,
}

#[derive(Args, Debug)]
struct BalanceArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Credential id registered in the account registry (hex).
    #[arg(long, conflicts_with = "address", required_unless_present = "address")]
    key_id: Option<String>,

    /// Wallet address, if already known.
    #[arg(long)]
    address: Option<String>,

    /// Also print the balance of this ERC-20 token.
    #[arg(long)]
    token: Option<String>,
}

#[derive(Args, Debug)]
struct TxArgs {
    /// Build and sign, print the UserOperation, but do not send it.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Do not wait for the receipt after sending.
    #[arg(long, default_value_t = false)]
    no_wait: bool,

    /// Receipt wait timeout; 0 waits forever.
    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,
}

#[derive(Args, Debug)]
struct SendNativeArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    passkey: PasskeyArgs,
    #[command(flatten)]
    tx: TxArgs,

    /// `dest:valueWei[:0xdata]`; repeat for a batch.
    #[arg(long = "call", required = true)]
    calls: Vec<String>,
}

#[derive(Args, Debug)]
struct SendTokenArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[command(flatten)]
    passkey: PasskeyArgs,
    #[command(flatten)]
    tx: TxArgs,

    #[arg(long)]
    token: String,

    #[arg(long)]
    to: String,

    /// Amount in the token's base units.
    #[arg(long)]
    amount: String,
}

#[derive(Args, Debug)]
struct DecodeSignatureArgs {
    /// DER signature as hex.
    der: String,
}

#[derive(Args, Debug)]
struct ReceiptArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// userOpHash returned by send-native / send-token.
    user_op_hash: String,

    #[arg(long, default_value_t = 180)]
    max_wait_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Always write logs to stderr so stdout can be used for script-friendly outputs.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Account(args) => cmd_account(args).await,
        Command::Keygen(args) => cmd_keygen(args),
        Command::Register(args) => cmd_register(args).await,
        Command::Balance(args) => cmd_balance(args).await,
        Command::SendNative(args) => cmd_send_native(args).await,
        Command::SendToken(args) => cmd_send_token(args).await,
        Command::DecodeSignature(args) => cmd_decode_signature(args),
        Command::Receipt(args) => cmd_receipt(args).await,
    }
}

fn load(common: &CommonArgs) -> Result<Network> {
    load_network(
        &common.deployments,
        &common.network,
        Overrides {
            rpc: common.rpc.clone(),
            bundler: common.bundler.clone(),
        },
    )
}

async fn connect(net: &Network) -> Result<Arc<Provider<Http>>> {
    let provider =
        Provider::<Http>::try_from(net.rpc_url.as_str())?.interval(Duration::from_millis(350));

    let chain_id = provider.get_chainid().await?.as_u64();
    if chain_id != net.chain_id {
        return Err(anyhow!(
            "chainId mismatch: network {} has {}, RPC returned {}",
            net.name,
            net.chain_id,
            chain_id
        ));
    }
    Ok(Arc::new(provider))
}

async fn cmd_account(args: AccountArgs) -> Result<()> {
    let net = load(&args.common)?;
    let chain = EthersChain::new(connect(&net).await?);

    println!("chainId:        {}", net.chain_id);
    println!("entryPoint:     {}", net.entry_point);
    println!("factory:        {}", net.factory);

    if let (Some(x), Some(y)) = (args.pubkey_x.as_deref(), args.pubkey_y.as_deref()) {
        let public_key = PublicKey {
            x: encoding::parse_h256(x).context("invalid --pubkey-x")?,
            y: encoding::parse_h256(y).context("invalid --pubkey-y")?,
        };
        let (account, deployed) = resolver::account_for_key(&chain, &net, &public_key).await?;
        println!("smartAccount:   {}", account);
        println!("isDeployed:     {}", deployed);
        return Ok(());
    }

    let key_id = args
        .key_id
        .as_deref()
        .ok_or_else(|| anyhow!("pass --key-id or --pubkey-x/--pubkey-y"))?;
    let key_id = encoding::parse_hex_bytes(key_id).context("invalid --key-id")?;
    let resolved = resolver::resolve_account(&chain, &net, &key_id).await?;

    println!("smartAccount:   {}", resolved.address);
    println!("isDeployed:     {}", resolved.deployed);
    println!("nonce:          {}", resolved.nonce);
    println!("publicKey.x:    {}", encoding::fmt_h256(resolved.public_key.x));
    println!("publicKey.y:    {}", encoding::fmt_h256(resolved.public_key.y));
    Ok(())
}

fn choose_secrets_dir() -> Result<PathBuf> {
    let cwd = std::env::current_dir().context("failed to read current dir")?;
    let dir = cwd.join(".secrets");
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    Ok(dir)
}

fn cmd_keygen(args: KeygenArgs) -> Result<()> {
    let passkey = SoftwarePasskey::new(p256::ecdsa::SigningKey::random(&mut OsRng), &args.origin);
    let public_key = passkey.public_key();
    let key_id = encoding::fmt_bytes(passkey.credential_id());

    let path = choose_secrets_dir()?.join(format!("passkey_{}.env", &key_id[2..10]));
    let body = format!(
        "# Software passkey for passkey-aa. KEEP THIS FILE PRIVATE.\n\
         # keyId={key_id}\n\
         export PASSKEY_AA_PRIVATE_KEY=0x{}\n",
        passkey.private_key_hex()
    );
    fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;

    // The private key never goes to stdout.
    eprintln!("saved software passkey to {}", path.display());
    println!(
        "{}",
        serde_json::json!({
            "keyId": key_id,
            "publicKey": {
                "x": encoding::fmt_h256(public_key.x),
                "y": encoding::fmt_h256(public_key.y),
            },
            "envPath": path.display().to_string(),
        })
    );
    Ok(())
}

fn load_passkey(pk: &PasskeyArgs, origin: &str) -> Result<SoftwarePasskey> {
    let passkey = SoftwarePasskey::from_hex(&pk.passkey_private_key, origin)?;
    match pk.key_id.as_deref() {
        Some(key_id) => Ok(passkey
            .with_credential_id(encoding::parse_hex_bytes(key_id).context("invalid --key-id")?)),
        None => Ok(passkey),
    }
}

async fn cmd_register(args: RegisterArgs) -> Result<()> {
    let net = load(&args.common)?;
    let provider = connect(&net).await?;
    let passkey = load_passkey(&args.passkey, &net.origin)?;

    let wallet = LocalWallet::from_str(&args.relayer_private_key)
        .context("invalid relayer private key")?
        .with_chain_id(net.chain_id);
    if wallet.address() != net.relayer {
        tracing::warn!(
            signer = %wallet.address(),
            configured = %net.relayer,
            "relayer key does not match the network's relayer address"
        );
    }
    let client = Arc::new(SignerMiddleware::new((*provider).clone(), wallet));

    let reg = registration::register_user(
        &EthersChain::new(provider),
        &EthersChain::new(client),
        &net,
        passkey.credential_id(),
        &passkey.public_key(),
        U256::from(args.fund_wei),
    )
    .await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "keyId": encoding::fmt_bytes(passkey.credential_id()),
            "id": encoding::fmt_u256(reg.id),
            "account": encoding::fmt_address(reg.account),
            "publicKey": {
                "x": encoding::fmt_h256(reg.public_key.x),
                "y": encoding::fmt_h256(reg.public_key.y),
            },
            "saveUserTx": encoding::fmt_h256(reg.save_tx),
            "fundingTx": reg.funding_tx.map(encoding::fmt_h256),
        }))?
    );
    Ok(())
}

async fn cmd_balance(args: BalanceArgs) -> Result<()> {
    let net = load(&args.common)?;
    let chain = EthersChain::new(connect(&net).await?);

    let account = match (args.address.as_deref(), args.key_id.as_deref()) {
        (Some(address), _) => Address::from_str(address).context("invalid --address")?,
        (None, Some(key_id)) => {
            let key_id = encoding::parse_hex_bytes(key_id).context("invalid --key-id")?;
            resolver::resolve_account(&chain, &net, &key_id).await?.address
        }
        (None, None) => bail!("pass --key-id or --address"),
    };

    println!("smartAccount:   {}", account);
    println!("balanceWei:     {}", chain.get_balance(account).await?);
    if let Some(token) = args.token.as_deref() {
        let token = Address::from_str(token).context("invalid --token address")?;
        println!("token:          {}", token);
        println!("tokenBalance:   {}", chain.token_balance(token, account).await?);
    }
    Ok(())
}

fn parse_native_call(spec: &str) -> Result<NativeCall> {
    let mut parts = spec.splitn(3, ':');
    let destination = parts.next().unwrap_or_default();
    let value = parts
        .next()
        .ok_or_else(|| anyhow!("--call {spec:?}: expected dest:valueWei[:0xdata]"))?;
    let data = parts.next().unwrap_or("0x");

    Ok(NativeCall {
        destination: Address::from_str(destination)
            .with_context(|| format!("--call {spec:?}: invalid destination"))?,
        value: U256::from_dec_str(value)
            .with_context(|| format!("--call {spec:?}: invalid value (expected integer wei)"))?,
        data: encoding::parse_hex_bytes(data)
            .with_context(|| format!("--call {spec:?}: invalid data"))?,
    })
}

async fn cmd_send_native(args: SendNativeArgs) -> Result<()> {
    let calls = args
        .calls
        .iter()
        .map(|c| parse_native_call(c))
        .collect::<Result<Vec<_>>>()?;
    send(&args.common, &args.passkey, &args.tx, Calls::Native(calls)).await
}

async fn cmd_send_token(args: SendTokenArgs) -> Result<()> {
    let call = TokenCall {
        token: Address::from_str(&args.token).context("invalid --token address")?,
        to: Address::from_str(&args.to).context("invalid --to address")?,
        amount: U256::from_dec_str(&args.amount)
            .with_context(|| format!("invalid --amount (expected integer): {}", args.amount))?,
    };
    send(&args.common, &args.passkey, &args.tx, Calls::Token(call)).await
}

async fn send(common: &CommonArgs, pk: &PasskeyArgs, tx: &TxArgs, calls: Calls) -> Result<()> {
    let net = load(common)?;
    let provider = connect(&net).await?;

    let passkey = load_passkey(pk, &net.origin)?;
    let key_id = passkey.credential_id().clone();

    let bundler = Arc::new(BundlerClient::new(net.bundler_url.clone()));
    let builder = UserOpBuilder::new(
        Arc::new(EthersChain::new(provider)),
        bundler.clone(),
        Arc::new(passkey),
        net,
    );
    let req = BuildRequest { key_id, calls };

    if tx.dry_run {
        let signed = builder.build(&req).await.map_err(explain)?;
        println!(
            "UserOperation (signed):\n{}",
            serde_json::to_string_pretty(&encoding::user_op_to_json(&signed.op))?
        );
        println!(
            "userOpHash (entryPoint {}): {}",
            builder.entry_point(),
            encoding::fmt_h256(signed.user_op_hash)
        );
        println!("\n--dry-run set: not sending user operation.");
        return Ok(());
    }

    let submission = builder.submit(&req).await.map_err(explain)?;
    println!(
        "UserOperation (sent):\n{}",
        serde_json::to_string_pretty(&encoding::user_op_to_json(&submission.op))?
    );
    println!("\nuserOpHash: {}", encoding::fmt_h256(submission.user_op_hash));

    if tx.no_wait {
        println!("--no-wait set: not waiting for receipt.");
        return Ok(());
    }

    let receipt = bundler
        .wait_user_operation_receipt(
            submission.user_op_hash,
            Duration::from_secs(tx.max_wait_seconds),
        )
        .await
        .context("failed waiting for userOp receipt")?;
    println!("\nUserOp receipt:\n{}", serde_json::to_string_pretty(&receipt)?);

    if receipt.get("success").and_then(|v| v.as_bool()) == Some(false) {
        bail!("userOp {} was included but reverted", encoding::fmt_h256(submission.user_op_hash));
    }
    Ok(())
}

fn explain(err: error::BuildError) -> anyhow::Error {
    if err.requires_fresh_attempt() {
        anyhow::Error::new(err).context("userOp not accepted; rerun to rebuild it from fresh chain state")
    } else {
        anyhow::Error::new(err).context("passkey assertion rejected; check --key-id and the passkey")
    }
}

fn cmd_decode_signature(args: DecodeSignatureArgs) -> Result<()> {
    let der = encoding::parse_hex_bytes(&args.der).context("signature is not hex")?;
    let parsed = webauthn::parse_signature(&der)?;
    let normalized = parsed.normalize_s()?;
    println!("r: 0x{}", hex::encode(normalized.r));
    println!("s: 0x{}", hex::encode(normalized.s));
    if normalized != parsed {
        println!("(s was high; normalized to n - s)");
    }
    Ok(())
}

async fn cmd_receipt(args: ReceiptArgs) -> Result<()> {
    let net = load(&args.common)?;
    let hash = encoding::parse_h256(&args.user_op_hash).context("invalid userOpHash")?;
    let bundler = BundlerClient::new(net.bundler_url);

    // One immediate check, then keep polling.
    let receipt = match bundler.get_user_operation_receipt(hash).await? {
        Some(r) => r,
        None => {
            bundler
                .wait_user_operation_receipt(hash, Duration::from_secs(args.max_wait_seconds))
                .await?
        }
    };
    println!("{}", serde_json::to_string_pretty(&receipt)?);
    Ok(())
}
