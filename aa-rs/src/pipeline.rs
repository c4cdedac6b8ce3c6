//! Assembly of a user operation from a request, one stage at a time.
//!
//! Stages run in a fixed order and each one only fills in what the later ones need:
//! `Nonce → InitCode → Fees → GasEstimate → Paymaster → Hash`. A failure stops the run and
//! reports the stage it happened in.

use crate::bundler::GasEstimates;
use crate::paymaster::Sponsorship;
use crate::types::{EntryPointVersion, UserOperation, UserOperationRequest};
use crate::wallet::Wallet;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};
use std::fmt;
use thiserror::Error;

pub const CELO_CHAIN_ID: u64 = 42220;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeQuote {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Reads from the chain the operation targets.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn chain_id(&self) -> Result<u64>;
    /// `EntryPoint.getNonce(sender, 0)`.
    async fn entry_point_nonce(&self, entry_point: Address, sender: Address) -> Result<U256>;
    async fn has_code(&self, address: Address) -> Result<bool>;
    async fn fee_quote(&self) -> Result<FeeQuote>;
}

#[async_trait]
pub trait GasEstimator: Send + Sync {
    async fn estimate_gas(&self, op: &UserOperation, entry_point: Address) -> Result<GasEstimates>;
}

#[async_trait]
pub trait Sponsor: Send + Sync {
    /// Placeholder `paymasterAndData` to estimate gas with, if the paymaster hands one out.
    async fn stub_data(&self, _op: &UserOperation, _entry_point: Address) -> Result<Option<Bytes>> {
        Ok(None)
    }

    async fn sponsor(&self, op: &UserOperation, entry_point: Address) -> Result<Sponsorship>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Nonce,
    InitCode,
    Fees,
    GasEstimate,
    Paymaster,
    Hash,
}

impl Stage {
    pub const FIRST: Stage = Stage::Nonce;

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Nonce => Some(Stage::InitCode),
            Stage::InitCode => Some(Stage::Fees),
            Stage::Fees => Some(Stage::GasEstimate),
            Stage::GasEstimate => Some(Stage::Paymaster),
            Stage::Paymaster => Some(Stage::Hash),
            Stage::Hash => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Nonce => "nonce",
            Stage::InitCode => "init code",
            Stage::Fees => "fees",
            Stage::GasEstimate => "gas estimate",
            Stage::Paymaster => "paymaster",
            Stage::Hash => "hash",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("{stage} stage failed: {source:#}")]
pub struct AssemblyError {
    pub stage: Stage,
    #[source]
    pub source: anyhow::Error,
}

pub struct Pipeline<'a> {
    entry_point: Address,
    chain: &'a dyn ChainSource,
    estimator: &'a dyn GasEstimator,
    sponsor: Option<&'a dyn Sponsor>,
    wallet: Option<&'a Wallet>,
    dummy_signature: Bytes,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        entry_point: Address,
        chain: &'a dyn ChainSource,
        estimator: &'a dyn GasEstimator,
        dummy_signature: Bytes,
    ) -> Self {
        Self {
            entry_point,
            chain,
            estimator,
            sponsor: None,
            wallet: None,
            dummy_signature,
        }
    }

    pub fn with_sponsor(mut self, sponsor: &'a dyn Sponsor) -> Self {
        self.sponsor = Some(sponsor);
        self
    }

    /// Genesis wallet; its init code deploys the sender when it has no code yet.
    pub fn with_wallet(mut self, wallet: &'a Wallet) -> Self {
        self.wallet = Some(wallet);
        self
    }

    /// Runs every stage. The result is sealed unless the hash stage found it incomplete.
    pub async fn assemble(&self, req: &UserOperationRequest) -> Result<UserOperation, AssemblyError> {
        let mut op = req.to_user_operation();
        let mut stage = Some(Stage::FIRST);
        while let Some(current) = stage {
            self.run_stage(current, req, &mut op)
                .await
                .map_err(|source| AssemblyError {
                    stage: current,
                    source,
                })?;
            tracing::debug!(chain_id = req.chain_id, stage = %current, "stage done");
            stage = current.next();
        }
        Ok(op)
    }

    async fn run_stage(
        &self,
        stage: Stage,
        req: &UserOperationRequest,
        op: &mut UserOperation,
    ) -> Result<()> {
        match stage {
            Stage::Nonce => self.nonce(req, op).await,
            Stage::InitCode => self.init_code(req, op).await,
            Stage::Fees => self.fees(req, op).await,
            Stage::GasEstimate => self.gas_estimate(req, op).await,
            Stage::Paymaster => self.paymaster(op).await,
            Stage::Hash => {
                self.hash(op);
                Ok(())
            }
        }
    }

    async fn nonce(&self, req: &UserOperationRequest, op: &mut UserOperation) -> Result<()> {
        let chain_id = self.chain.chain_id().await?;
        if chain_id != req.chain_id {
            return Err(anyhow!(
                "rpc chainId mismatch: request is for {}, rpc serves {}",
                req.chain_id,
                chain_id
            ));
        }
        let on_chain = self
            .chain
            .entry_point_nonce(self.entry_point, req.sender)
            .await?;
        let nonce = req.nonce.map_or(on_chain, |n| n.max(on_chain));
        op.set_nonce(nonce);
        Ok(())
    }

    async fn init_code(&self, req: &UserOperationRequest, op: &mut UserOperation) -> Result<()> {
        if self.chain.has_code(req.sender).await? {
            return Ok(());
        }
        if req.init_code.as_ref().is_some_and(|c| !c.is_empty()) {
            return Ok(());
        }
        let wallet = self
            .wallet
            .ok_or_else(|| anyhow!("wallet {:?} is not deployed and no init code is known", req.sender))?;
        if wallet.address != req.sender {
            return Err(anyhow!(
                "genesis wallet {:?} does not match sender {:?}",
                wallet.address,
                req.sender
            ));
        }
        op.set_init_code(wallet.init_code());
        tracing::info!(chain_id = req.chain_id, sender = ?req.sender, "wallet not deployed; using init code");
        Ok(())
    }

    async fn fees(&self, req: &UserOperationRequest, op: &mut UserOperation) -> Result<()> {
        let quote = self.chain.fee_quote().await?;
        let max_fee = req.max_fee_per_gas.unwrap_or(quote.max_fee_per_gas);
        let mut priority = req
            .max_priority_fee_per_gas
            .unwrap_or(quote.max_priority_fee_per_gas);
        if req.chain_id == CELO_CHAIN_ID {
            priority = max_fee;
        }
        if priority.is_zero() {
            priority = U256::one();
        }
        op.set_max_fee_per_gas(max_fee);
        op.set_max_priority_fee_per_gas(priority);
        Ok(())
    }

    async fn gas_estimate(&self, req: &UserOperationRequest, op: &mut UserOperation) -> Result<()> {
        let mut draft = op.clone();
        draft.set_signature(self.dummy_signature.clone());
        if let Some(sponsor) = self.sponsor {
            if let Some(stub) = sponsor.stub_data(&draft, self.entry_point).await? {
                draft.set_paymaster_and_data(stub);
            }
        }
        let est = self.estimator.estimate_gas(&draft, self.entry_point).await?;

        op.set_call_gas_limit(req.call_gas_limit.unwrap_or(est.call_gas_limit));
        op.set_verification_gas_limit(
            req.verification_gas_limit
                .unwrap_or(est.verification_gas_limit),
        );
        op.set_pre_verification_gas(req.pre_verification_gas.unwrap_or(est.pre_verification_gas));
        Ok(())
    }

    async fn paymaster(&self, op: &mut UserOperation) -> Result<()> {
        let Some(sponsor) = self.sponsor else {
            return Ok(());
        };
        let mut draft = op.clone();
        draft.set_signature(self.dummy_signature.clone());
        let sponsorship = sponsor.sponsor(&draft, self.entry_point).await?;
        sponsorship.apply(op);
        Ok(())
    }

    fn hash(&self, op: &mut UserOperation) {
        let incomplete = [
            op.call_gas_limit(),
            op.verification_gas_limit(),
            op.pre_verification_gas(),
            op.max_fee_per_gas(),
            op.max_priority_fee_per_gas(),
        ]
        .iter()
        .any(|v| v.is_zero())
            || op.paymaster_and_data().is_empty();

        if incomplete {
            tracing::warn!(
                chain_id = op.chain_id(),
                sender = ?op.sender(),
                "operation incomplete (zero gas/fee or no paymasterAndData); not sealing"
            );
            return;
        }
        let hash = op.seal(self.entry_point);
        tracing::info!(
            chain_id = op.chain_id(),
            hash = ?hash,
            entry_point = ?EntryPointVersion::of(self.entry_point),
            size = op.abi_encoded_size(),
            "operation sealed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ENTRY_POINT_V07;
    use crate::wallet::{Factory, FactoryVersion};
    use ethers::types::H256;
    use std::sync::Mutex;

    struct FakeChain {
        chain_id: u64,
        nonce: U256,
        deployed: bool,
        fees: FeeQuote,
    }

    #[async_trait]
    impl ChainSource for FakeChain {
        async fn chain_id(&self) -> Result<u64> {
            Ok(self.chain_id)
        }
        async fn entry_point_nonce(&self, _ep: Address, _sender: Address) -> Result<U256> {
            Ok(self.nonce)
        }
        async fn has_code(&self, _address: Address) -> Result<bool> {
            Ok(self.deployed)
        }
        async fn fee_quote(&self) -> Result<FeeQuote> {
            Ok(self.fees)
        }
    }

    #[derive(Default)]
    struct FakeEstimator {
        fail: bool,
        seen: Mutex<Vec<UserOperation>>,
    }

    #[async_trait]
    impl GasEstimator for FakeEstimator {
        async fn estimate_gas(&self, op: &UserOperation, _ep: Address) -> Result<GasEstimates> {
            if self.fail {
                return Err(anyhow!("AA23 reverted"));
            }
            self.seen.lock().unwrap().push(op.clone());
            Ok(GasEstimates {
                call_gas_limit: U256::from(50_000),
                verification_gas_limit: U256::from(150_000),
                pre_verification_gas: U256::from(45_000),
            })
        }
    }

    struct FakeSponsor {
        sponsorship: Sponsorship,
    }

    #[async_trait]
    impl Sponsor for FakeSponsor {
        async fn stub_data(&self, _op: &UserOperation, _ep: Address) -> Result<Option<Bytes>> {
            Ok(Some(Bytes::from(vec![0x51; 20])))
        }
        async fn sponsor(&self, _op: &UserOperation, _ep: Address) -> Result<Sponsorship> {
            Ok(self.sponsorship.clone())
        }
    }

    fn entry_point() -> Address {
        "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789".parse().unwrap()
    }

    fn wallet() -> Wallet {
        let factory = Factory {
            address: Address::repeat_byte(0xfa),
            implementation: Address::repeat_byte(0x1e),
            version: FactoryVersion::V030,
        };
        Wallet::derive(&factory, H256::repeat_byte(3), H256::zero()).unwrap()
    }

    fn chain(chain_id: u64, deployed: bool) -> FakeChain {
        FakeChain {
            chain_id,
            nonce: U256::from(4),
            deployed,
            fees: FeeQuote {
                max_fee_per_gas: U256::from(2_000_000_000u64),
                max_priority_fee_per_gas: U256::from(100_000_000u64),
            },
        }
    }

    fn sponsor() -> FakeSponsor {
        FakeSponsor {
            sponsorship: Sponsorship {
                paymaster_and_data: Bytes::from(vec![0xaa; 84]),
                call_gas_limit: Some(U256::from(60_000)),
                ..Default::default()
            },
        }
    }

    fn dummy() -> Bytes {
        Bytes::from(vec![0xd0; 74])
    }

    #[tokio::test]
    async fn undeployed_sponsored_operation_is_sealed() {
        let w = wallet();
        let chain = chain(8453, false);
        let estimator = FakeEstimator::default();
        let sponsor = sponsor();
        let pipeline = Pipeline::new(entry_point(), &chain, &estimator, dummy())
            .with_sponsor(&sponsor)
            .with_wallet(&w);

        let req = UserOperationRequest::new(w.address, 8453, Bytes::from(vec![1, 2, 3]));
        let op = pipeline.assemble(&req).await.unwrap();

        assert_eq!(op.nonce(), U256::from(4));
        assert_eq!(op.init_code(), &w.init_code());
        assert_eq!(op.call_gas_limit(), U256::from(60_000));
        assert_eq!(op.verification_gas_limit(), U256::from(150_000));
        assert_eq!(op.max_priority_fee_per_gas(), U256::from(100_000_000u64));
        assert!(op.signature().is_empty());
        assert!(op.is_sealed_for(entry_point()));
        assert_eq!(op.hash(), Some(op.hash_for(entry_point())));

        // estimation saw the dummy signature and the paymaster stub
        let seen = estimator.seen.lock().unwrap();
        assert_eq!(seen[0].signature(), &dummy());
        assert_eq!(seen[0].paymaster_and_data().len(), 20);
    }

    #[tokio::test]
    async fn v07_entry_point_seals_with_packed_digest() {
        let w = wallet();
        let chain = chain(8453, false);
        let estimator = FakeEstimator::default();
        let sponsor = sponsor();
        let pipeline = Pipeline::new(ENTRY_POINT_V07, &chain, &estimator, dummy())
            .with_sponsor(&sponsor)
            .with_wallet(&w);

        let req = UserOperationRequest::new(w.address, 8453, Bytes::from(vec![1, 2, 3]));
        let op = pipeline.assemble(&req).await.unwrap();

        let packed = ethers::utils::keccak256(op.pack_for_hash_v07());
        let expected = H256(ethers::utils::keccak256(ethers::abi::encode(&[
            ethers::abi::Token::FixedBytes(packed.to_vec()),
            ethers::abi::Token::Address(ENTRY_POINT_V07),
            ethers::abi::Token::Uint(U256::from(8453)),
        ])));
        assert_eq!(op.hash(), Some(expected));
        assert!(op.is_sealed_for(ENTRY_POINT_V07));
    }

    #[tokio::test]
    async fn request_nonce_wins_when_ahead() {
        let w = wallet();
        let chain = chain(1, true);
        let estimator = FakeEstimator::default();
        let pipeline = Pipeline::new(entry_point(), &chain, &estimator, dummy());
        let mut req = UserOperationRequest::new(w.address, 1, Bytes::default());
        req.nonce = Some(U256::from(9));
        let op = pipeline.assemble(&req).await.unwrap();
        assert_eq!(op.nonce(), U256::from(9));
        // deployed: no init code
        assert!(op.init_code().is_empty());
    }

    #[tokio::test]
    async fn unsponsored_operation_stays_unsealed() {
        let w = wallet();
        let chain = chain(1, true);
        let estimator = FakeEstimator::default();
        let pipeline = Pipeline::new(entry_point(), &chain, &estimator, dummy());
        let req = UserOperationRequest::new(w.address, 1, Bytes::default());
        let op = pipeline.assemble(&req).await.unwrap();
        assert_eq!(op.hash(), None);
        assert_eq!(op.call_gas_limit(), U256::from(50_000));
    }

    #[tokio::test]
    async fn celo_and_zero_priority_fees() {
        let w = wallet();
        let estimator = FakeEstimator::default();

        let celo = chain(CELO_CHAIN_ID, true);
        let pipeline = Pipeline::new(entry_point(), &celo, &estimator, dummy());
        let op = pipeline
            .assemble(&UserOperationRequest::new(w.address, CELO_CHAIN_ID, Bytes::default()))
            .await
            .unwrap();
        assert_eq!(op.max_priority_fee_per_gas(), op.max_fee_per_gas());

        let mut zero = chain(10, true);
        zero.fees.max_priority_fee_per_gas = U256::zero();
        let pipeline = Pipeline::new(entry_point(), &zero, &estimator, dummy());
        let op = pipeline
            .assemble(&UserOperationRequest::new(w.address, 10, Bytes::default()))
            .await
            .unwrap();
        assert_eq!(op.max_priority_fee_per_gas(), U256::one());
    }

    #[tokio::test]
    async fn failures_carry_their_stage() {
        let w = wallet();
        let estimator = FakeEstimator {
            fail: true,
            ..Default::default()
        };
        let chain = chain(1, true);
        let pipeline = Pipeline::new(entry_point(), &chain, &estimator, dummy());
        let err = pipeline
            .assemble(&UserOperationRequest::new(w.address, 1, Bytes::default()))
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::GasEstimate);
        assert!(err.to_string().contains("AA23"));

        let estimator = FakeEstimator::default();
        let pipeline = Pipeline::new(entry_point(), &chain, &estimator, dummy());
        let err = pipeline
            .assemble(&UserOperationRequest::new(w.address, 5, Bytes::default()))
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::Nonce);

        // undeployed without a known genesis wallet
        let undeployed = self::chain(1, false);
        let pipeline = Pipeline::new(entry_point(), &undeployed, &estimator, dummy());
        let err = pipeline
            .assemble(&UserOperationRequest::new(w.address, 1, Bytes::default()))
            .await
            .unwrap_err();
        assert_eq!(err.stage, Stage::InitCode);
    }

    #[test]
    fn stages_run_in_order() {
        let mut order = vec![Stage::FIRST];
        while let Some(next) = order[order.len() - 1].next() {
            order.push(next);
        }
        assert_eq!(
            order,
            vec![
                Stage::Nonce,
                Stage::InitCode,
                Stage::Fees,
                Stage::GasEstimate,
                Stage::Paymaster,
                Stage::Hash
            ]
        );
    }
}
