use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use light_aa::bundler::BundlerClient;
use light_aa::config::{load_deployment, Deployment};
use light_aa::configuration::{Configuration, Owner};
use light_aa::contracts::{factory_get_address, wallet_image_hash, RpcChain};
use light_aa::encoding::{
    self, parse_address, parse_bytes, parse_h256, user_op_from_json, user_op_to_json, user_op_to_wire,
};
use light_aa::paymaster::{decode_paymaster_and_data, PaymasterClient, PaymasterMode};
use light_aa::pipeline::Pipeline;
use light_aa::signature::{dummy_signature, encode_merkle_signature, sign_subdigest, SignatureCollector};
use light_aa::recover::recover_with_subdigest;
use light_aa::store::{DetailItem, DevInfo, OperationStore, SubmissionOutcome};
use light_aa::subdigest::{operations_subdigest, operations_tree};
use light_aa::types::{UserOperation, UserOperationRequest};
use light_aa::wallet::{execute_calldata, Wallet};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

// With --json, stdout carries a single JSON document and everything human-readable goes to
// stderr.
macro_rules! outln {
    ($machine_mode:expr, $($arg:tt)*) => {{
        if $machine_mode {
            eprintln!($($arg)*);
        } else {
            println!($($arg)*);
        }
    }};
}

#[derive(Parser, Debug)]
#[command(name = "light-aa", version)]
struct Cli {
    /// Print a single JSON object to stdout; logs go to stderr.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the image hash of a wallet configuration.
    ImageHash(ConfigArgs),

    /// Print the counterfactual wallet address for a configuration on a deployment.
    Address(AddressArgs),

    /// Hash a wire-format user operation for an entry point and chain.
    Hash(HashArgs),

    /// Assemble a user operation on each deployment and store it.
    Build(BuildArgs),

    /// Print the subdigest owners sign for the stored operations.
    Subdigest(StoreArgs),

    /// Sign the stored operations' subdigest with an owner key.
    Sign(SignArgs),

    /// Encode the collected signatures and submit every stored operation.
    Send(SendArgs),

    /// Generate a new owner key and write it under .secrets/.
    NewOwner,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Wallet owner as ADDRESS[:WEIGHT] (weight defaults to 1). Repeat for each owner, in order.
    #[arg(long = "owner", required = true, value_parser = parse_owner)]
    owners: Vec<Owner>,

    #[arg(long, default_value_t = 1)]
    threshold: u16,

    #[arg(long, default_value_t = 1)]
    checkpoint: u32,

    /// CREATE2 salt: 32-byte hex, or a decimal number.
    #[arg(long, env = "LIGHT_AA_SALT", default_value = "0")]
    salt: String,
}

impl ConfigArgs {
    fn configuration(&self) -> Result<Configuration> {
        let cfg = Configuration::new(self.threshold, self.checkpoint, self.owners.clone());
        cfg.validate()?;
        Ok(cfg)
    }

    fn salt(&self) -> Result<H256> {
        if self.salt.starts_with("0x") {
            return parse_h256(&self.salt).context("invalid --salt");
        }
        let n = self.salt.parse::<u64>().context("invalid --salt")?;
        Ok(H256::from_low_u64_be(n))
    }
}

#[derive(Args, Debug)]
struct AddressArgs {
    #[command(flatten)]
    config: ConfigArgs,

    /// Deployment artifact (factory, implementation, entry point).
    #[arg(long, default_value = "deployments/base.json")]
    deployment: PathBuf,

    /// Override the chain RPC URL (otherwise uses deployment JSON).
    #[arg(long, env = "LIGHT_AA_RPC_URL")]
    rpc: Option<String>,

    /// Ask the factory for the address and report whether the wallet is deployed.
    #[arg(long, default_value_t = false)]
    check: bool,
}

#[derive(Args, Debug)]
struct HashArgs {
    /// JSON file holding the operation in bundler wire format.
    #[arg(long)]
    op: PathBuf,

    #[arg(long)]
    chain_id: u64,

    #[arg(long, env = "LIGHT_AA_ENTRYPOINT")]
    entry_point: String,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// Operation store file.
    #[arg(long, env = "LIGHT_AA_STORE", default_value = ".light-aa/operations.json")]
    store: PathBuf,
}

#[derive(Args, Debug)]
struct BuildArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(flatten)]
    store: StoreArgs,

    /// Deployment artifact; repeat to build the same call on several chains.
    #[arg(long = "deployment", required = true)]
    deployments: Vec<PathBuf>,

    /// Override the chain RPC URL (only with a single --deployment).
    #[arg(long, env = "LIGHT_AA_RPC_URL")]
    rpc: Option<String>,

    /// Bundler RPC URL, when the deployment does not name one.
    #[arg(long, env = "LIGHT_AA_BUNDLER_URL")]
    bundler: Option<String>,

    /// Raw wallet calldata. Mutually exclusive with --to.
    #[arg(long, conflicts_with = "to")]
    call_data: Option<String>,

    /// Call target; the wallet calls `execute(to, value, data)`.
    #[arg(long)]
    to: Option<String>,

    /// Wei sent with the call.
    #[arg(long, default_value = "0")]
    value: String,

    /// Calldata for the target.
    #[arg(long, default_value = "0x")]
    data: String,

    /// Lower bound for the nonce; the entry point's nonce wins when higher.
    #[arg(long)]
    nonce: Option<u64>,

    #[arg(long)]
    call_gas_limit: Option<u64>,

    #[arg(long)]
    verification_gas_limit: Option<u64>,

    #[arg(long)]
    pre_verification_gas: Option<u64>,

    #[arg(long)]
    max_fee_per_gas: Option<u64>,

    #[arg(long)]
    max_priority_fee_per_gas: Option<u64>,

    /// Request sponsorship from the deployment's paymaster (or --paymaster-url).
    #[arg(long, default_value_t = false)]
    sponsor_gas: bool,

    #[arg(long, env = "LIGHT_AA_PAYMASTER_URL")]
    paymaster_url: Option<String>,

    /// Gas manager policy id. With it the paymaster is spoken to over ERC-7677, without it
    /// over `paymaster_requestGasAndPaymasterAndData`.
    #[arg(long, env = "LIGHT_AA_GAS_MANAGER_POLICY_ID")]
    policy_id: Option<String>,

    #[arg(long, env = "LIGHT_AA_GAS_MANAGER_WEBHOOK_DATA")]
    webhook_data: Option<String>,
}

#[derive(Args, Debug)]
struct SignArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Owner private key.
    ///
    /// Recommended: set via env var LIGHT_AA_OWNER_PRIVATE_KEY.
    #[arg(long, env = "LIGHT_AA_OWNER_PRIVATE_KEY")]
    owner_private_key: Option<String>,
}

#[derive(Args, Debug)]
struct SendArgs {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(flatten)]
    store: StoreArgs,

    /// Deployment artifact of every chain with a stored operation.
    #[arg(long = "deployment", required = true)]
    deployments: Vec<PathBuf>,

    #[arg(long, env = "LIGHT_AA_BUNDLER_URL")]
    bundler: Option<String>,

    /// Return after submission without waiting for receipts.
    #[arg(long, default_value_t = false)]
    no_wait: bool,

    /// Max seconds to wait for each receipt (0 = wait forever).
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
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json = cli.json;

    match cli.cmd {
        Command::ImageHash(args) => cmd_image_hash(args, json),
        Command::Address(args) => cmd_address(args, json).await,
        Command::Hash(args) => cmd_hash(args, json),
        Command::Build(args) => cmd_build(args, json).await,
        Command::Subdigest(args) => cmd_subdigest(args, json),
        Command::Sign(args) => cmd_sign(args, json).await,
        Command::Send(args) => cmd_send(args, json).await,
        Command::NewOwner => cmd_new_owner(json),
    }
}

fn cmd_image_hash(args: ConfigArgs, json: bool) -> Result<()> {
    let cfg = args.configuration()?;
    let tree = cfg.signer_tree()?;
    let image_hash = cfg.image_hash()?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "imageHash": encoding::fmt_h256(image_hash),
                "root": encoding::fmt_h256(tree.hash()),
                "threshold": cfg.threshold,
                "checkpoint": cfg.checkpoint,
                "totalWeight": cfg.total_weight(),
            })
        );
    }
    outln!(json, "owners:      {}", cfg.owners.len());
    outln!(json, "totalWeight: {}", cfg.total_weight());
    outln!(json, "threshold:   {}", cfg.threshold);
    outln!(json, "checkpoint:  {}", cfg.checkpoint);
    outln!(json, "root:        {:?}", tree.hash());
    outln!(json, "imageHash:   {:?}", image_hash);
    Ok(())
}

async fn cmd_address(args: AddressArgs, json: bool) -> Result<()> {
    let dep = load_deployment(&args.deployment, args.rpc.clone())?;
    let cfg = args.config.configuration()?;
    let image_hash = cfg.image_hash()?;
    let wallet = Wallet::derive(&dep.factory, image_hash, args.config.salt()?)?;

    let mut deployed = None;
    let mut current_image_hash = None;
    if args.check {
        let provider = connect(&dep).await?;
        let client = Arc::new(provider);

        let on_chain = factory_get_address(client.clone(), dep.factory.address, image_hash, wallet.salt)
            .await?;
        if on_chain != wallet.address {
            return Err(anyhow!(
                "factory.getAddress returned {:?}, derived {:?} (check implementation and factoryVersion)",
                on_chain,
                wallet.address
            ));
        }
        let code = client
            .get_code(wallet.address, None)
            .await
            .context("eth_getCode failed")?;
        let is_deployed = !code.as_ref().is_empty();
        if is_deployed {
            current_image_hash = Some(wallet_image_hash(client.clone(), wallet.address).await?);
        }
        deployed = Some(is_deployed);
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "wallet": encoding::fmt_address(wallet.address),
                "factory": encoding::fmt_address(wallet.factory),
                "salt": encoding::fmt_h256(wallet.salt),
                "imageHash": encoding::fmt_h256(image_hash),
                "isDeployed": deployed,
                "currentImageHash": current_image_hash.map(encoding::fmt_h256),
            })
        );
    }

    outln!(json, "chainId:      {}", dep.chain_id);
    outln!(json, "factory:      {:?} ({})", wallet.factory, dep.factory.version);
    outln!(json, "imageHash:    {:?}", image_hash);
    outln!(json, "salt:         {:?}", wallet.salt);
    outln!(json, "wallet:       {:?}", wallet.address);
    if let Some(d) = deployed {
        outln!(json, "isDeployed:   {}", d);
    }
    if let Some(h) = current_image_hash {
        outln!(json, "onChainImage: {:?}", h);
    }
    Ok(())
}

fn cmd_hash(args: HashArgs, json: bool) -> Result<()> {
    let raw = fs::read_to_string(&args.op)
        .with_context(|| format!("failed to read {}", args.op.display()))?;
    let v: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", args.op.display()))?;
    let entry_point = parse_address(&args.entry_point).context("invalid --entry-point")?;
    let op = user_op_from_json(&v, args.chain_id)?;
    let hash = op.hash_for(entry_point);

    if json {
        println!(
            "{}",
            serde_json::json!({
                "hash": encoding::fmt_h256(hash),
                "abiSize": op.abi_encoded_size(),
            })
        );
    } else {
        println!("{:?}", hash);
    }
    Ok(())
}

async fn cmd_build(args: BuildArgs, json: bool) -> Result<()> {
    if args.rpc.is_some() && args.deployments.len() > 1 {
        bail!("--rpc can only be used with a single --deployment");
    }
    let cfg = args.config.configuration()?;
    let image_hash = cfg.image_hash()?;
    let salt = args.config.salt()?;
    let dummy = dummy_signature(&cfg)?;
    let call_data = build_call_data(&args)?;

    // A build starts a new batch.
    let mut store = OperationStore::load_or_default(&args.store.store)?;
    for stale in store.operations() {
        store.remove(stale.chain_id());
    }
    store.reset_all();

    let mut built = Vec::new();
    // Chains are assembled one after another; each one is stored as soon as it is done.
    for path in &args.deployments {
        let dep = load_deployment(path, args.rpc.clone())?;
        let op = build_one(&args, &dep, image_hash, salt, &dummy, &call_data, &mut store).await?;
        store.save(&args.store.store)?;
        built.push(op);
    }

    if json {
        let out: Vec<_> = built
            .iter()
            .map(|op| {
                serde_json::json!({
                    "chainId": op.chain_id(),
                    "hash": op.hash().map(encoding::fmt_h256),
                    "userOperation": user_op_to_json(op),
                })
            })
            .collect();
        println!("{}", serde_json::Value::Array(out));
    }
    for op in &built {
        outln!(json, "");
        outln!(json, "chain {}", op.chain_id());
        for row in store.details(op.chain_id()).unwrap_or(&[]) {
            outln!(json, "  {:<22} {}", row.title, row.value);
        }
    }
    outln!(json, "");
    outln!(json, "stored in {}", args.store.store.display());
    Ok(())
}

async fn build_one(
    args: &BuildArgs,
    dep: &Deployment,
    image_hash: H256,
    salt: H256,
    dummy: &Bytes,
    call_data: &Bytes,
    store: &mut OperationStore,
) -> Result<UserOperation> {
    let provider = connect(dep).await?;
    let chain = RpcChain::new(Arc::new(provider));
    let wallet = Wallet::derive(&dep.factory, image_hash, salt)?;

    let bundler_url = dep
        .bundler_url
        .clone()
        .or_else(|| args.bundler.clone())
        .ok_or_else(|| anyhow!("chain {}: no bundler in deployment and no --bundler", dep.chain_id))?;
    let bundler = BundlerClient::new(bundler_url);
    bundler.ensure_entry_point(dep.entry_point).await?;

    let paymaster = if args.sponsor_gas {
        let url = dep
            .paymaster_url
            .clone()
            .or_else(|| args.paymaster_url.clone())
            .ok_or_else(|| {
                anyhow!(
                    "--sponsor-gas requires a paymaster in the deployment or --paymaster-url (or LIGHT_AA_PAYMASTER_URL)"
                )
            })?;
        let mode = match &args.policy_id {
            Some(policy_id) => PaymasterMode::Erc7677 {
                policy_id: policy_id.clone(),
                webhook_data: args.webhook_data.clone(),
            },
            None => PaymasterMode::Light,
        };
        Some(PaymasterClient::new(url, mode, dep.chain_id))
    } else {
        None
    };

    let mut req = UserOperationRequest::new(wallet.address, dep.chain_id, call_data.clone());
    req.nonce = args.nonce.map(U256::from);
    req.call_gas_limit = args.call_gas_limit.map(U256::from);
    req.verification_gas_limit = args.verification_gas_limit.map(U256::from);
    req.pre_verification_gas = args.pre_verification_gas.map(U256::from);
    req.max_fee_per_gas = args.max_fee_per_gas.map(U256::from);
    req.max_priority_fee_per_gas = args.max_priority_fee_per_gas.map(U256::from);

    let mut pipeline = Pipeline::new(dep.entry_point, &chain, &bundler, dummy.clone()).with_wallet(&wallet);
    if let Some(pm) = paymaster.as_ref() {
        pipeline = pipeline.with_sponsor(pm);
    }

    tracing::info!(chain_id = dep.chain_id, sender = ?wallet.address, "assembling user operation");
    let op = pipeline.assemble(&req).await?;
    match op.hash() {
        Some(hash) => tracing::info!(chain_id = dep.chain_id, hash = ?hash, abi_size = op.abi_encoded_size(), "user operation sealed"),
        None => tracing::warn!(
            chain_id = dep.chain_id,
            "user operation left unsealed (missing gas values or paymaster data); it cannot be signed yet"
        ),
    }

    store.set_details(dep.chain_id, details_of(&op, dep));
    store.set_dev_info(
        dep.chain_id,
        vec![
            DevInfo {
                title: "request".into(),
                data: serde_json::to_value(&req).context("failed to serialize request")?,
            },
            DevInfo {
                title: "userOperation".into(),
                data: user_op_to_json(&op),
            },
        ],
    );
    store.set_by_chain_id(op.clone());
    Ok(op)
}

fn build_call_data(args: &BuildArgs) -> Result<Bytes> {
    if let Some(raw) = &args.call_data {
        return parse_bytes(raw).context("invalid --call-data");
    }
    let to = args
        .to
        .as_deref()
        .ok_or_else(|| anyhow!("either --call-data or --to is required"))?;
    let to = parse_address(to).context("invalid --to")?;
    let value = U256::from_dec_str(&args.value).context("invalid --value")?;
    let data = parse_bytes(&args.data).context("invalid --data")?;
    Ok(execute_calldata(to, value, &data))
}

fn details_of(op: &UserOperation, dep: &Deployment) -> Vec<DetailItem> {
    let mut rows = vec![
        DetailItem::new("sender", format!("{:?}", op.sender())),
        DetailItem::new("nonce", op.nonce()),
        DetailItem::new("entryPoint", format!("{:?}", dep.entry_point)),
        DetailItem::new("deploys wallet", op.factory().is_some()),
        DetailItem::new("callGasLimit", op.call_gas_limit()),
        DetailItem::new("verificationGasLimit", op.verification_gas_limit()),
        DetailItem::new("preVerificationGas", op.pre_verification_gas()),
        DetailItem::new("maxFeePerGas", op.max_fee_per_gas()),
        DetailItem::new("maxPriorityFeePerGas", op.max_priority_fee_per_gas()),
        DetailItem::new("abi size", op.abi_encoded_size()),
    ];
    if !op.paymaster_and_data().is_empty() {
        match decode_paymaster_and_data(op.paymaster_and_data()) {
            Ok(pm) => {
                rows.push(DetailItem::new("paymaster", format!("{:?}", pm.paymaster)));
                rows.push(DetailItem::new("validUntil", pm.valid_until));
                rows.push(DetailItem::new("validAfter", pm.valid_after));
            }
            Err(e) => {
                tracing::debug!(error = %e, "paymasterAndData does not follow the verifying paymaster layout");
                if let Some(pm) = op.paymaster() {
                    rows.push(DetailItem::new("paymaster", format!("{:?}", pm)));
                }
            }
        }
    }
    rows.push(DetailItem::new(
        "hash",
        op.hash().map_or_else(|| "unsealed".to_string(), |h| format!("{:?}", h)),
    ));
    rows
}

fn cmd_subdigest(args: StoreArgs, json: bool) -> Result<()> {
    let store = OperationStore::load_or_default(&args.store)?;
    let ops = store.operations();
    let wallet = sender_of(&ops)?;
    let subdigest = operations_subdigest(wallet, &ops)?;
    let root = if ops.len() > 1 {
        Some(operations_tree(&ops)?.root())
    } else {
        None
    };

    if json {
        println!(
            "{}",
            serde_json::json!({
                "wallet": encoding::fmt_address(wallet),
                "subdigest": encoding::fmt_h256(subdigest),
                "merkleRoot": root.map(encoding::fmt_h256),
                "operations": ops
                    .iter()
                    .map(|op| serde_json::json!({
                        "chainId": op.chain_id(),
                        "hash": op.hash().map(encoding::fmt_h256),
                    }))
                    .collect::<Vec<_>>(),
                "signatures": store.signatures(subdigest).len(),
            })
        );
    }

    outln!(json, "wallet:     {:?}", wallet);
    for op in &ops {
        outln!(json, "  chain {:<8} {:?}", op.chain_id(), op.hash().unwrap_or_default());
    }
    if let Some(root) = root {
        outln!(json, "merkleRoot: {:?}", root);
    }
    outln!(json, "subdigest:  {:?}", subdigest);
    outln!(json, "signatures: {}", store.signatures(subdigest).len());
    Ok(())
}

async fn cmd_sign(args: SignArgs, json: bool) -> Result<()> {
    let mut store = OperationStore::load_or_default(&args.store.store)?;
    let ops = store.operations();
    let wallet = sender_of(&ops)?;
    let subdigest = operations_subdigest(wallet, &ops)?;

    let pk = args.owner_private_key.clone().ok_or_else(|| {
        anyhow!("missing LIGHT_AA_OWNER_PRIVATE_KEY (or --owner-private-key)")
    })?;
    let owner = LocalWallet::from_str(&pk).context("invalid owner private key")?;

    let sig = sign_subdigest(&owner, subdigest).await?;
    let added = store.add_signature(subdigest, Bytes::from(sig));
    store.save(&args.store.store)?;

    if added {
        tracing::info!(owner = ?owner.address(), subdigest = ?subdigest, "signature stored");
    } else {
        tracing::info!(owner = ?owner.address(), "signature already stored");
    }

    if json {
        println!(
            "{}",
            serde_json::json!({
                "owner": encoding::fmt_address(owner.address()),
                "subdigest": encoding::fmt_h256(subdigest),
                "added": added,
            })
        );
    }
    outln!(json, "owner:      {:?}", owner.address());
    outln!(json, "subdigest:  {:?}", subdigest);
    outln!(json, "signatures: {}", store.signatures(subdigest).len());
    Ok(())
}

async fn cmd_send(args: SendArgs, json: bool) -> Result<()> {
    let mut store = OperationStore::load_or_default(&args.store.store)?;
    let ops = store.operations();
    let wallet = sender_of(&ops)?;
    let subdigest = operations_subdigest(wallet, &ops)?;

    let cfg = args.config.configuration()?;
    let mut collector = SignatureCollector::new(cfg.clone(), subdigest)?;
    for sig in store.signatures(subdigest) {
        match collector.add(sig) {
            Ok(signer) => tracing::info!(signer = ?signer, "owner signature accepted"),
            Err(e) => tracing::warn!(error = %e, "stored signature ignored"),
        }
    }
    if !collector.is_submittable() {
        bail!(
            "collected weight {} is below threshold {}; more owners need to sign {:?}",
            collector.collected_weight(),
            cfg.threshold,
            subdigest
        );
    }
    let wallet_signature = collector.encode()?;
    let decoded = recover_with_subdigest(&wallet_signature, subdigest, 0)?;
    if decoded.image_hash != cfg.image_hash()? || !decoded.meets_threshold() {
        bail!(
            "encoded signature does not prove the configuration (image hash {:?}, weight {})",
            decoded.image_hash,
            decoded.weight
        );
    }

    let mut deployments = BTreeMap::new();
    for path in &args.deployments {
        let dep = load_deployment(path, None)?;
        deployments.insert(dep.chain_id, dep);
    }

    let tree = if ops.len() > 1 {
        Some(operations_tree(&ops)?)
    } else {
        None
    };

    let mut submitted = Vec::new();
    for mut op in ops {
        let chain_id = op.chain_id();
        let seal = op
            .sealed()
            .ok_or_else(|| anyhow!("chain {chain_id}: operation is not sealed"))?;
        let dep = deployments
            .get(&chain_id)
            .ok_or_else(|| anyhow!("chain {chain_id}: no --deployment given"))?;
        if dep.entry_point != seal.entry_point {
            bail!(
                "chain {chain_id}: operation was sealed for entry point {:?}, deployment uses {:?}",
                seal.entry_point,
                dep.entry_point
            );
        }

        let signature = match &tree {
            None => wallet_signature.clone(),
            Some(tree) => {
                let proof = tree
                    .create_proof(&seal.hash)
                    .ok_or_else(|| anyhow!("chain {chain_id}: hash missing from merkle tree"))?;
                encode_merkle_signature(&proof, &wallet_signature)
            }
        };
        op.set_signature(signature);

        let bundler_url = dep
            .bundler_url
            .clone()
            .or_else(|| args.bundler.clone())
            .ok_or_else(|| anyhow!("chain {chain_id}: no bundler in deployment and no --bundler"))?;
        let bundler = BundlerClient::new(bundler_url);

        let user_op_hash = bundler
            .send_user_operation(user_op_to_wire(&op, seal.entry_point), seal.entry_point)
            .await
            .with_context(|| format!("chain {chain_id}: submission failed"))?;
        tracing::info!(chain_id, user_op_hash = ?user_op_hash, "user operation submitted");

        store.set_by_chain_id(op);
        store.add_pending_hash(user_op_hash);
        store.save(&args.store.store)?;
        submitted.push((chain_id, user_op_hash, bundler));
    }

    let mut results = Vec::new();
    let mut outcomes = Vec::new();
    for (chain_id, user_op_hash, bundler) in submitted {
        let outcome = if args.no_wait {
            SubmissionOutcome::Pending
        } else {
            match bundler
                .wait_user_operation_receipt(user_op_hash, Duration::from_secs(args.max_wait_seconds))
                .await
            {
                Ok(receipt) if receipt.success => SubmissionOutcome::Succeeded,
                Ok(receipt) => {
                    tracing::warn!(
                        chain_id,
                        user_op_hash = ?user_op_hash,
                        tx = ?receipt.transaction_hash,
                        reason = receipt.reason.as_deref().unwrap_or("-"),
                        "user operation reverted"
                    );
                    SubmissionOutcome::Reverted
                }
                Err(e) => {
                    tracing::warn!(chain_id, user_op_hash = ?user_op_hash, error = %e, "no receipt");
                    SubmissionOutcome::WaitFailed(format!("{e:#}"))
                }
            }
        };
        let error = match &outcome {
            SubmissionOutcome::WaitFailed(e) => Some(e.clone()),
            _ => None,
        };
        results.push(serde_json::json!({
            "chainId": chain_id,
            "userOpHash": encoding::fmt_h256(user_op_hash),
            "success": outcome.success(),
            "status": outcome.label(),
            "error": error,
        }));
        outln!(json, "chain {:<8} {:?} {}", chain_id, user_op_hash, outcome.label());
        outcomes.push((chain_id, outcome));
    }
    store.settle(subdigest, &outcomes);
    store.save(&args.store.store)?;

    if json {
        println!("{}", serde_json::Value::Array(results));
    }
    let unconfirmed = outcomes
        .iter()
        .filter(|(_, o)| matches!(o, SubmissionOutcome::WaitFailed(_)))
        .count();
    if unconfirmed > 0 {
        bail!(
            "{unconfirmed} of {} submitted operations could not be confirmed; they stay in the store",
            outcomes.len()
        );
    }
    Ok(())
}

fn cmd_new_owner(json: bool) -> Result<()> {
    let (_wallet, owner, pk_hex) = generate_random_wallet()?;
    let secrets_dir = choose_secrets_dir()?;
    let path = secrets_dir.join(format!("light_owner_{}.env", hex::encode(owner.as_bytes())));
    write_owner_env_file(&path, owner, &pk_hex)?;
    let path = path.canonicalize().unwrap_or(path);

    if json {
        println!(
            "{}",
            serde_json::json!({
                "owner": encoding::fmt_address(owner),
                "envPath": path.display().to_string(),
            })
        );
    }
    outln!(json, "owner:   {:?}", owner);
    outln!(json, "envPath: {}", path.display());
    Ok(())
}

async fn connect(dep: &Deployment) -> Result<Provider<Http>> {
    let provider =
        Provider::<Http>::try_from(dep.rpc_url.as_str())?.interval(Duration::from_millis(350));
    let chain_id = provider.get_chainid().await?.as_u64();
    if chain_id != dep.chain_id {
        return Err(anyhow!(
            "chainId mismatch: deployment has {}, RPC returned {}",
            dep.chain_id,
            chain_id
        ));
    }
    Ok(provider)
}

fn sender_of(ops: &[UserOperation]) -> Result<Address> {
    ops.first()
        .map(UserOperation::sender)
        .ok_or_else(|| anyhow!("no stored operations; run `light-aa build` first"))
}

fn parse_owner(s: &str) -> Result<Owner, String> {
    let (addr, weight) = match s.split_once(':') {
        Some((a, w)) => (a, w.parse::<u8>().map_err(|e| format!("invalid weight '{w}': {e}"))?),
        None => (s, 1),
    };
    let address = parse_address(addr).map_err(|e| e.to_string())?;
    Ok(Owner { address, weight })
}

fn choose_secrets_dir() -> Result<PathBuf> {
    // Repo root `.secrets/` even when run from a subdirectory.
    let mut dir = std::env::current_dir().context("failed to read current dir")?;

    for _ in 0..6 {
        if dir.join(".git").exists() || dir.join("deployments").is_dir() {
            return Ok(dir.join(".secrets"));
        }
        if !dir.pop() {
            break;
        }
    }

    let cwd = std::env::current_dir().context("failed to read current dir")?;
    Ok(cwd.join(".secrets"))
}

fn write_owner_env_file(path: &Path, owner: Address, private_key_hex: &str) -> Result<()> {
    let contents = format!(
        "# Generated by light-aa new-owner\n# DO NOT COMMIT THIS FILE.\nexport LIGHT_AA_OWNER_PRIVATE_KEY={}\nexport LIGHT_AA_OWNER_ADDRESS={:?}\n",
        private_key_hex, owner
    );

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("failed to create .secrets dir")?;
    }

    fs::write(path, contents).with_context(|| format!("failed to write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perm = fs::Permissions::from_mode(0o600);
        let _ = fs::set_permissions(path, perm);
    }

    Ok(())
}

fn generate_random_wallet() -> Result<(LocalWallet, Address, String)> {
    let mut rng = OsRng;
    // Out-of-range scalars are rejected by LocalWallet; draw again.
    for _ in 0..64 {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        if bytes.iter().all(|b| *b == 0) {
            continue;
        }
        let pk_hex = format!("0x{}", hex::encode(bytes));
        if let Ok(wallet) = LocalWallet::from_str(&pk_hex) {
            let owner = wallet.address();
            return Ok((wallet, owner, pk_hex));
        }
    }
    Err(anyhow!(
        "failed to generate a valid random private key after multiple attempts"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_argument_parsing() {
        let o = parse_owner("0x1111111111111111111111111111111111111111:3").unwrap();
        assert_eq!(o.address, Address::repeat_byte(0x11));
        assert_eq!(o.weight, 3);

        let o = parse_owner("0x2222222222222222222222222222222222222222").unwrap();
        assert_eq!(o.weight, 1);

        assert!(parse_owner("0x22:1").is_err());
        assert!(parse_owner("0x2222222222222222222222222222222222222222:300").is_err());
    }

    #[test]
    fn salt_accepts_hex_and_decimal() {
        let mut args = ConfigArgs {
            owners: vec![],
            threshold: 1,
            checkpoint: 1,
            salt: "5".into(),
        };
        assert_eq!(args.salt().unwrap(), H256::from_low_u64_be(5));

        args.salt = format!("0x{}", "ab".repeat(32));
        assert_eq!(args.salt().unwrap(), H256::repeat_byte(0xab));

        args.salt = "0x12".into();
        assert!(args.salt().is_err());
    }

    #[test]
    fn random_wallet_key_matches_address() {
        let (wallet, owner, pk_hex) = generate_random_wallet().unwrap();
        assert_eq!(wallet.address(), owner);
        assert_eq!(LocalWallet::from_str(&pk_hex).unwrap().address(), owner);
    }

    #[test]
    fn cli_parses_repeated_owners_and_deployments() {
        let cli = Cli::try_parse_from([
            "light-aa",
            "build",
            "--owner",
            "0x1111111111111111111111111111111111111111:2",
            "--owner",
            "0x2222222222222222222222222222222222222222",
            "--threshold",
            "2",
            "--deployment",
            "deployments/base.json",
            "--deployment",
            "deployments/optimism.json",
            "--to",
            "0x3333333333333333333333333333333333333333",
        ])
        .unwrap();
        let Command::Build(args) = cli.cmd else {
            panic!("expected build");
        };
        assert_eq!(args.config.owners.len(), 2);
        assert_eq!(args.deployments.len(), 2);
        let cd = build_call_data(&args).unwrap();
        assert_eq!(&cd[..4], &[0xb6, 0x1d, 0x27, 0xf6]);
    }
}
