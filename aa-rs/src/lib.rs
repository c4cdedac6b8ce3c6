//! Light wallet ERC-4337 toolkit.
//!
//! Builds v0.6 user operations for multi-owner light wallets, seals them with their
//! entry-point hash, collects owner signatures over the (possibly cross-chain) subdigest and
//! hands the result to a bundler.

pub mod bundler;
pub mod config;
pub mod configuration;
pub mod contracts;
pub mod encoding;
pub mod merkle;
pub mod paymaster;
pub mod pipeline;
pub mod proxy;
pub mod recover;
pub mod rpc;
pub mod signature;
pub mod signer_tree;
pub mod store;
pub mod subdigest;
pub mod types;
pub mod wallet;
