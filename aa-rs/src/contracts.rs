use crate::pipeline::{ChainSource, FeeQuote};
use anyhow::{Context, Result};
use async_trait::async_trait;
use ethers::abi::AbiParser;
use ethers::prelude::*;
use std::sync::Arc;

/// Chain reads over any ethers middleware (usually `Provider<Http>`).
#[derive(Debug, Clone)]
pub struct RpcChain<M> {
    client: Arc<M>,
}

impl<M: Middleware + 'static> RpcChain<M> {
    pub fn new(client: Arc<M>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> Arc<M> {
        self.client.clone()
    }
}

#[async_trait]
impl<M: Middleware + 'static> ChainSource for RpcChain<M> {
    async fn chain_id(&self) -> Result<u64> {
        let id = self
            .client
            .get_chainid()
            .await
            .context("eth_chainId failed")?;
        Ok(id.as_u64())
    }

    async fn entry_point_nonce(&self, entry_point: Address, sender: Address) -> Result<U256> {
        fetch_entrypoint_nonce(self.client.clone(), entry_point, sender).await
    }

    async fn has_code(&self, address: Address) -> Result<bool> {
        let code = self
            .client
            .get_code(address, None)
            .await
            .context("eth_getCode failed")?;
        Ok(!code.as_ref().is_empty())
    }

    async fn fee_quote(&self) -> Result<FeeQuote> {
        let (max_fee_per_gas, _) = self
            .client
            .estimate_eip1559_fees(None)
            .await
            .context("EIP-1559 fee estimation failed")?;
        let max_priority_fee_per_gas: U256 = self
            .client
            .provider()
            .request("eth_maxPriorityFeePerGas", ())
            .await
            .context("eth_maxPriorityFeePerGas failed")?;
        Ok(FeeQuote {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        })
    }
}

pub async fn fetch_entrypoint_nonce<M: Middleware + 'static>(
    client: Arc<M>,
    entrypoint: Address,
    account: Address,
) -> Result<U256> {
    let entrypoint_abi = AbiParser::default()
        .parse(&["function getNonce(address sender, uint192 key) view returns (uint256)"])?;
    let entrypoint_c = Contract::new(entrypoint, entrypoint_abi, client);

    let nonce: U256 = entrypoint_c
        .method("getNonce", (account, U256::zero()))?
        .call()
        .await
        .context("entryPoint.getNonce failed")?;
    Ok(nonce)
}

/// `LightWalletFactory.getAddress(hash, salt)`, for cross-checking the local derivation.
pub async fn factory_get_address<M: Middleware + 'static>(
    client: Arc<M>,
    factory: Address,
    image_hash: H256,
    salt: H256,
) -> Result<Address> {
    let factory_abi = AbiParser::default()
        .parse(&["function getAddress(bytes32 hash, bytes32 salt) view returns (address)"])?;
    let factory_c = Contract::new(factory, factory_abi, client);

    let account: Address = factory_c
        .method("getAddress", (image_hash, salt))?
        .call()
        .await
        .context("factory.getAddress failed")?;
    Ok(account)
}

/// Current image hash of a deployed light wallet.
pub async fn wallet_image_hash<M: Middleware + 'static>(
    client: Arc<M>,
    wallet: Address,
) -> Result<H256> {
    let wallet_abi =
        AbiParser::default().parse(&["function imageHash() view returns (bytes32)"])?;
    let wallet_c = Contract::new(wallet, wallet_abi, client);

    let hash: H256 = wallet_c
        .method("imageHash", ())?
        .call()
        .await
        .context("wallet.imageHash failed")?;
    Ok(hash)
}
