use crate::proxy::{creation_code, PROXY_CREATION_CODE_V1, PROXY_CREATION_CODE_V2};
use anyhow::{anyhow, Context, Result};
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::{get_create2_address_from_hash, keccak256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// `initialize(bytes32)` selector, called by the proxy constructor.
pub const INITIALIZE_SELECTOR: [u8; 4] = [0x94, 0x98, 0xbd, 0x71];

/// Light wallet factory release; decides which proxy the factory deploys.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FactoryVersion {
    #[serde(rename = "v0.1.0")]
    V010,
    #[serde(rename = "v0.2.0")]
    V020,
    #[serde(rename = "v0.3.0")]
    V030,
}

impl FactoryVersion {
    pub fn proxy_creation_code(self) -> &'static [&'static str] {
        match self {
            FactoryVersion::V010 | FactoryVersion::V020 => PROXY_CREATION_CODE_V1,
            FactoryVersion::V030 => PROXY_CREATION_CODE_V2,
        }
    }
}

impl FromStr for FactoryVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().trim_start_matches('v') {
            "0.1.0" => Ok(FactoryVersion::V010),
            "0.2.0" => Ok(FactoryVersion::V020),
            "0.3.0" => Ok(FactoryVersion::V030),
            other => Err(anyhow!("unknown factory version '{other}' (expected v0.1.0, v0.2.0 or v0.3.0)")),
        }
    }
}

impl fmt::Display for FactoryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FactoryVersion::V010 => "v0.1.0",
            FactoryVersion::V020 => "v0.2.0",
            FactoryVersion::V030 => "v0.3.0",
        };
        f.write_str(s)
    }
}

/// A deployed light wallet factory and the implementation its proxies point to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Factory {
    pub address: Address,
    pub implementation: Address,
    pub version: FactoryVersion,
}

/// A wallet as seen before (or after) deployment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub address: Address,
    pub factory: Address,
    pub salt: H256,
    /// Image hash of the genesis configuration, used for deployment.
    pub image_hash: H256,
}

impl Wallet {
    pub fn derive(factory: &Factory, image_hash: H256, salt: H256) -> Result<Self> {
        let address = counterfactual_address(factory, image_hash, salt)?;
        Ok(Self {
            address,
            factory: factory.address,
            salt,
            image_hash,
        })
    }

    pub fn init_code(&self) -> Bytes {
        init_code(self.factory, self.image_hash, self.salt)
    }
}

/// `LightWalletFactory.createAccount(bytes32 hash, bytes32 salt)` calldata.
pub fn create_account_calldata(image_hash: H256, salt: H256) -> Bytes {
    let selector = &keccak256("createAccount(bytes32,bytes32)")[..4];
    let args = encode(&[
        Token::FixedBytes(image_hash.as_bytes().to_vec()),
        Token::FixedBytes(salt.as_bytes().to_vec()),
    ]);
    let mut v = Vec::with_capacity(4 + args.len());
    v.extend_from_slice(selector);
    v.extend_from_slice(&args);
    Bytes::from(v)
}

/// `LightWallet.execute(address dest, uint256 value, bytes func)` calldata.
pub fn execute_calldata(dest: Address, value: U256, func: &Bytes) -> Bytes {
    let selector = &keccak256("execute(address,uint256,bytes)")[..4];
    let args = encode(&[
        Token::Address(dest),
        Token::Uint(value),
        Token::Bytes(func.to_vec()),
    ]);
    let mut v = Vec::with_capacity(4 + args.len());
    v.extend_from_slice(selector);
    v.extend_from_slice(&args);
    Bytes::from(v)
}

/// Factory address followed by the `createAccount` calldata.
pub fn init_code(factory: Address, image_hash: H256, salt: H256) -> Bytes {
    let create_calldata = create_account_calldata(image_hash, salt);
    let mut v = Vec::with_capacity(20 + create_calldata.len());
    v.extend_from_slice(factory.as_bytes());
    v.extend_from_slice(create_calldata.as_ref());
    Bytes::from(v)
}

pub fn initialize_calldata(image_hash: H256) -> Vec<u8> {
    let mut v = Vec::with_capacity(36);
    v.extend_from_slice(&INITIALIZE_SELECTOR);
    v.extend_from_slice(image_hash.as_bytes());
    v
}

/// keccak of the proxy creation code followed by its constructor arguments
/// `(implementation, initialize(imageHash))`.
pub fn proxy_init_code_hash(
    version: FactoryVersion,
    implementation: Address,
    image_hash: H256,
) -> Result<H256> {
    let mut code = creation_code(version.proxy_creation_code())
        .context("proxy creation code is not valid hex")?;
    code.extend(encode(&[
        Token::Address(implementation),
        Token::Bytes(initialize_calldata(image_hash)),
    ]));
    Ok(H256(keccak256(code)))
}

/// CREATE2 address the factory will deploy the wallet to.
pub fn counterfactual_address(factory: &Factory, image_hash: H256, salt: H256) -> Result<Address> {
    let init_code_hash = proxy_init_code_hash(factory.version, factory.implementation, image_hash)?;
    Ok(get_create2_address_from_hash(
        factory.address,
        salt.as_bytes().to_vec(),
        init_code_hash.as_bytes().to_vec(),
    ))
}
