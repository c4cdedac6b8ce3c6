use ethers::abi::{decode, ParamType, Token};
use ethers::types::{Address, Bytes, Log, H256, U256};
use ethers::utils::keccak256;
use eyre::{eyre, Result};
use light_aa::types::UserOperation;
use serde::{Deserialize, Serialize};

/// `handleOps(UserOperation[] ops, address beneficiary)` as called by bundlers.
pub const HANDLE_OPS_SIGNATURE: &str =
    "handleOps((address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes)[],address)";

/// Entry point (v0.6) events the indexer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    AccountDeployed,
    BeforeExecution,
    Deposited,
    SignatureAggregatorChanged,
    StakeLocked,
    StakeUnlocked,
    StakeWithdrawn,
    UserOperationEvent,
    UserOperationRevertReason,
    Withdrawn,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::AccountDeployed,
        EventKind::BeforeExecution,
        EventKind::Deposited,
        EventKind::SignatureAggregatorChanged,
        EventKind::StakeLocked,
        EventKind::StakeUnlocked,
        EventKind::StakeWithdrawn,
        EventKind::UserOperationEvent,
        EventKind::UserOperationRevertReason,
        EventKind::Withdrawn,
    ];

    pub fn signature(self) -> &'static str {
        match self {
            EventKind::AccountDeployed => "AccountDeployed(bytes32,address,address,address)",
            EventKind::BeforeExecution => "BeforeExecution()",
            EventKind::Deposited => "Deposited(address,uint256)",
            EventKind::SignatureAggregatorChanged => "SignatureAggregatorChanged(address)",
            EventKind::StakeLocked => "StakeLocked(address,uint256,uint256)",
            EventKind::StakeUnlocked => "StakeUnlocked(address,uint256)",
            EventKind::StakeWithdrawn => "StakeWithdrawn(address,address,uint256)",
            EventKind::UserOperationEvent => {
                "UserOperationEvent(bytes32,address,address,uint256,bool,uint256,uint256)"
            }
            EventKind::UserOperationRevertReason => {
                "UserOperationRevertReason(bytes32,address,uint256,bytes)"
            }
            EventKind::Withdrawn => "Withdrawn(address,address,uint256)",
        }
    }

    pub fn topic0(self) -> H256 {
        H256(keccak256(self.signature()))
    }

    pub fn from_topic0(topic: &H256) -> Option<EventKind> {
        EventKind::ALL.into_iter().find(|k| k.topic0() == *topic)
    }

    pub fn all_topics() -> Vec<H256> {
        EventKind::ALL.iter().map(|k| k.topic0()).collect()
    }
}

/// A decoded entry point log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum EntryPointEvent {
    AccountDeployed {
        user_op_hash: H256,
        sender: Address,
        factory: Address,
        paymaster: Address,
    },
    BeforeExecution,
    Deposited {
        account: Address,
        total_deposit: U256,
    },
    SignatureAggregatorChanged {
        aggregator: Address,
    },
    StakeLocked {
        account: Address,
        total_staked: U256,
        unstake_delay_sec: U256,
    },
    StakeUnlocked {
        account: Address,
        withdraw_time: U256,
    },
    StakeWithdrawn {
        account: Address,
        withdraw_address: Address,
        amount: U256,
    },
    UserOperationEvent {
        user_op_hash: H256,
        sender: Address,
        paymaster: Address,
        nonce: U256,
        success: bool,
        actual_gas_cost: U256,
        actual_gas_used: U256,
    },
    UserOperationRevertReason {
        user_op_hash: H256,
        sender: Address,
        nonce: U256,
        revert_reason: Bytes,
    },
    Withdrawn {
        account: Address,
        withdraw_address: Address,
        amount: U256,
    },
}

impl EntryPointEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EntryPointEvent::AccountDeployed { .. } => EventKind::AccountDeployed,
            EntryPointEvent::BeforeExecution => EventKind::BeforeExecution,
            EntryPointEvent::Deposited { .. } => EventKind::Deposited,
            EntryPointEvent::SignatureAggregatorChanged { .. } => EventKind::SignatureAggregatorChanged,
            EntryPointEvent::StakeLocked { .. } => EventKind::StakeLocked,
            EntryPointEvent::StakeUnlocked { .. } => EventKind::StakeUnlocked,
            EntryPointEvent::StakeWithdrawn { .. } => EventKind::StakeWithdrawn,
            EntryPointEvent::UserOperationEvent { .. } => EventKind::UserOperationEvent,
            EntryPointEvent::UserOperationRevertReason { .. } => EventKind::UserOperationRevertReason,
            EntryPointEvent::Withdrawn { .. } => EventKind::Withdrawn,
        }
    }
}

/// Decodes an entry point log. `Ok(None)` for topics this indexer does not know.
pub fn decode_log(log: &Log) -> Result<Option<EntryPointEvent>> {
    let Some(kind) = log.topics.first().and_then(EventKind::from_topic0) else {
        return Ok(None);
    };
    let t = Topics(&log.topics);
    let data = log.data.as_ref();

    let event = match kind {
        EventKind::AccountDeployed => {
            let mut d = decode_data(data, &[ParamType::Address, ParamType::Address])?;
            EntryPointEvent::AccountDeployed {
                user_op_hash: t.hash(1)?,
                sender: t.address(2)?,
                factory: take_address(&mut d)?,
                paymaster: take_address(&mut d)?,
            }
        }
        EventKind::BeforeExecution => EntryPointEvent::BeforeExecution,
        EventKind::Deposited => {
            let mut d = decode_data(data, &[ParamType::Uint(256)])?;
            EntryPointEvent::Deposited {
                account: t.address(1)?,
                total_deposit: take_uint(&mut d)?,
            }
        }
        EventKind::SignatureAggregatorChanged => EntryPointEvent::SignatureAggregatorChanged {
            aggregator: t.address(1)?,
        },
        EventKind::StakeLocked => {
            let mut d = decode_data(data, &[ParamType::Uint(256), ParamType::Uint(256)])?;
            EntryPointEvent::StakeLocked {
                account: t.address(1)?,
                total_staked: take_uint(&mut d)?,
                unstake_delay_sec: take_uint(&mut d)?,
            }
        }
        EventKind::StakeUnlocked => {
            let mut d = decode_data(data, &[ParamType::Uint(256)])?;
            EntryPointEvent::StakeUnlocked {
                account: t.address(1)?,
                withdraw_time: take_uint(&mut d)?,
            }
        }
        EventKind::StakeWithdrawn | EventKind::Withdrawn => {
            let mut d = decode_data(data, &[ParamType::Address, ParamType::Uint(256)])?;
            let account = t.address(1)?;
            let withdraw_address = take_address(&mut d)?;
            let amount = take_uint(&mut d)?;
            if kind == EventKind::Withdrawn {
                EntryPointEvent::Withdrawn {
                    account,
                    withdraw_address,
                    amount,
                }
            } else {
                EntryPointEvent::StakeWithdrawn {
                    account,
                    withdraw_address,
                    amount,
                }
            }
        }
        EventKind::UserOperationEvent => {
            let mut d = decode_data(
                data,
                &[
                    ParamType::Uint(256),
                    ParamType::Bool,
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                ],
            )?;
            EntryPointEvent::UserOperationEvent {
                user_op_hash: t.hash(1)?,
                sender: t.address(2)?,
                paymaster: t.address(3)?,
                nonce: take_uint(&mut d)?,
                success: take(&mut d)?
                    .into_bool()
                    .ok_or_else(|| eyre!("expected bool"))?,
                actual_gas_cost: take_uint(&mut d)?,
                actual_gas_used: take_uint(&mut d)?,
            }
        }
        EventKind::UserOperationRevertReason => {
            let mut d = decode_data(data, &[ParamType::Uint(256), ParamType::Bytes])?;
            EntryPointEvent::UserOperationRevertReason {
                user_op_hash: t.hash(1)?,
                sender: t.address(2)?,
                nonce: take_uint(&mut d)?,
                revert_reason: Bytes::from(
                    take(&mut d)?
                        .into_bytes()
                        .ok_or_else(|| eyre!("expected bytes"))?,
                ),
            }
        }
    };
    Ok(Some(event))
}

/// Operations passed to `handleOps`, hashed for `chain_id` on demand by the caller.
pub fn decode_handle_ops(input: &[u8], chain_id: u64) -> Result<Vec<UserOperation>> {
    let selector = &keccak256(HANDLE_OPS_SIGNATURE)[..4];
    if input.len() < 4 || &input[..4] != selector {
        return Err(eyre!("calldata is not a handleOps call"));
    }
    let mut tokens = decode(
        &[
            ParamType::Array(Box::new(UserOperation::abi_param_type())),
            ParamType::Address,
        ],
        &input[4..],
    )
    .map_err(|e| eyre!("failed to decode handleOps calldata: {e}"))?;

    let ops = tokens
        .remove(0)
        .into_array()
        .ok_or_else(|| eyre!("handleOps ops is not an array"))?;
    ops.into_iter()
        .map(|tok| {
            UserOperation::from_abi_token(tok, chain_id)
                .ok_or_else(|| eyre!("malformed user operation tuple"))
        })
        .collect()
}

struct Topics<'a>(&'a [H256]);

impl Topics<'_> {
    fn hash(&self, i: usize) -> Result<H256> {
        self.0
            .get(i)
            .copied()
            .ok_or_else(|| eyre!("log is missing topic {i}"))
    }

    fn address(&self, i: usize) -> Result<Address> {
        Ok(Address::from_slice(&self.hash(i)?.as_bytes()[12..]))
    }
}

fn decode_data(data: &[u8], types: &[ParamType]) -> Result<std::vec::IntoIter<Token>> {
    Ok(decode(types, data)
        .map_err(|e| eyre!("failed to decode log data: {e}"))?
        .into_iter())
}

fn take(d: &mut std::vec::IntoIter<Token>) -> Result<Token> {
    d.next().ok_or_else(|| eyre!("log data too short"))
}

fn take_uint(d: &mut std::vec::IntoIter<Token>) -> Result<U256> {
    take(d)?.into_uint().ok_or_else(|| eyre!("expected uint"))
}

fn take_address(d: &mut std::vec::IntoIter<Token>) -> Result<Address> {
    take(d)?.into_address().ok_or_else(|| eyre!("expected address"))
}
