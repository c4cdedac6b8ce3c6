//! Entry point events → entities.
//!
//! Every handler is load-or-create: replaying a transaction leaves the store unchanged.

use crate::events::{decode_handle_ops, decode_log, EntryPointEvent, EventKind};
use crate::store::{
    log_id, EntityStore, EventRow, LightWalletEntity, LogEntity, ReceiptEntity, TransactionEntity,
    UserOperationEntity, UserOperationRevertReasonEntity,
};
use ethers::types::{Address, Log, Transaction, TransactionReceipt, H256};
use light_aa::types::UserOperation;
use std::collections::BTreeSet;

/// One mined transaction with everything the handlers read from it.
#[derive(Debug, Clone)]
pub struct TxContext {
    pub chain_id: u64,
    pub entry_point: Address,
    pub transaction: Transaction,
    pub receipt: TransactionReceipt,
    pub block_timestamp: u64,
}

impl TxContext {
    fn hash(&self) -> H256 {
        self.transaction.hash
    }

    fn block_number(&self) -> u64 {
        self.receipt.block_number.map(|b| b.as_u64()).unwrap_or_default()
    }

    fn is_entry_point_log(&self, log: &Log, kind: EventKind) -> bool {
        log.address == self.entry_point && log.topics.first() == Some(&kind.topic0())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleStats {
    pub events: usize,
    pub wallets_created: usize,
    pub user_operations_created: usize,
    pub skipped: usize,
}

pub struct Handlers {
    factories: BTreeSet<Address>,
}

impl Handlers {
    pub fn new(factories: impl IntoIterator<Item = Address>) -> Self {
        Self {
            factories: factories.into_iter().collect(),
        }
    }

    /// Maps every entry point log of the transaction, in log order.
    pub fn handle_transaction(&self, store: &mut EntityStore, ctx: &TxContext) -> HandleStats {
        let mut stats = HandleStats::default();
        // decoded lazily; most transactions carry a single handleOps call
        let mut decoded_ops: Option<Vec<UserOperation>> = None;

        for (position, log) in ctx.receipt.logs.iter().enumerate() {
            if log.address != ctx.entry_point {
                continue;
            }
            let event = match decode_log(log) {
                Ok(Some(ev)) => ev,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(tx = ?ctx.hash(), position, error = %err, "undecodable entry point log");
                    continue;
                }
            };
            stats.events += 1;
            let log_index = log_index_of(log, position);
            tracing::trace!(tx = ?ctx.hash(), log_index, kind = ?event.kind(), "entry point event");

            match &event {
                EntryPointEvent::AccountDeployed {
                    user_op_hash,
                    sender,
                    factory,
                    paymaster,
                } => {
                    self.record_event(store, ctx, log_index, event.clone());
                    if self.account_deployed(store, ctx, *user_op_hash, *sender, *factory, *paymaster) {
                        stats.wallets_created += 1;
                    } else if !self.factories.contains(factory) {
                        stats.skipped += 1;
                    }
                }
                EntryPointEvent::UserOperationEvent { sender, .. } => {
                    if !store.is_light_wallet(sender) {
                        tracing::debug!(sender = ?sender, tx = ?ctx.hash(), "operation from unknown wallet; skipped");
                        stats.skipped += 1;
                        continue;
                    }
                    let ops = decoded_ops.get_or_insert_with(|| {
                        decode_handle_ops(ctx.transaction.input.as_ref(), ctx.chain_id).unwrap_or_else(|err| {
                            tracing::debug!(tx = ?ctx.hash(), error = %err, "handleOps calldata not decoded");
                            Vec::new()
                        })
                    });
                    if user_operation_event(store, ctx, position, log_index, &event, ops) {
                        stats.user_operations_created += 1;
                    }
                }
                EntryPointEvent::UserOperationRevertReason { sender, .. } => {
                    if !store.is_light_wallet(sender) {
                        tracing::debug!(sender = ?sender, tx = ?ctx.hash(), "revert reason for unknown wallet; skipped");
                        stats.skipped += 1;
                        continue;
                    }
                    revert_reason(store, ctx, log_index, &event);
                }
                _ => self.record_event(store, ctx, log_index, event.clone()),
            }
        }
        stats
    }

    fn record_event(&self, store: &mut EntityStore, ctx: &TxContext, log_index: u64, event: EntryPointEvent) {
        let id = log_id(ctx.hash(), log_index);
        store.events.entry(id.clone()).or_insert_with(|| EventRow {
            id,
            event,
            block_number: ctx.block_number(),
            block_timestamp: ctx.block_timestamp,
            transaction_hash: ctx.hash(),
        });
    }

    /// Returns whether a new wallet was recorded.
    fn account_deployed(
        &self,
        store: &mut EntityStore,
        ctx: &TxContext,
        user_op_hash: H256,
        sender: Address,
        factory: Address,
        paymaster: Address,
    ) -> bool {
        if !self.factories.contains(&factory) {
            tracing::debug!(sender = ?sender, factory = ?factory, "account from a foreign factory; not a light wallet");
            return false;
        }
        if store.light_wallets.contains_key(&sender) {
            return false;
        }
        store.light_wallets.insert(
            sender,
            LightWalletEntity {
                address: sender,
                factory,
                paymaster,
                user_op_hash,
                user_operations: Vec::new(),
                block_number: ctx.block_number(),
                block_timestamp: ctx.block_timestamp,
                transaction_hash: ctx.hash(),
            },
        );
        store.counter.light_wallets += 1;
        tracing::info!(wallet = ?sender, factory = ?factory, "light wallet deployed");
        true
    }
}

/// Returns whether a new operation was recorded.
fn user_operation_event(
    store: &mut EntityStore,
    ctx: &TxContext,
    position: usize,
    log_index: u64,
    event: &EntryPointEvent,
    ops: &[UserOperation],
) -> bool {
    let EntryPointEvent::UserOperationEvent {
        user_op_hash,
        sender,
        paymaster,
        nonce,
        success,
        actual_gas_cost,
        actual_gas_used,
    } = event
    else {
        return false;
    };

    load_or_create_transaction(store, ctx);
    load_or_create_receipt(store, ctx);

    let id = log_id(ctx.hash(), log_index);
    store
        .user_operation_events
        .entry(id.clone())
        .or_insert_with(|| EventRow {
            id,
            event: event.clone(),
            block_number: ctx.block_number(),
            block_timestamp: ctx.block_timestamp,
            transaction_hash: ctx.hash(),
        });

    if store.user_operations.contains_key(user_op_hash) {
        return false;
    }

    let (log_ids, revert_reason) = associate_logs(store, ctx, position, *user_op_hash);

    let decoded = ops
        .iter()
        .find(|op| op.hash_for(ctx.entry_point) == *user_op_hash)
        .or_else(|| ops.iter().find(|op| op.sender() == *sender && op.nonce() == *nonce));

    store.user_operations.insert(
        *user_op_hash,
        UserOperationEntity {
            user_op_hash: *user_op_hash,
            chain_id: ctx.chain_id,
            sender: *sender,
            nonce: *nonce,
            paymaster: *paymaster,
            success: *success,
            actual_gas_cost: *actual_gas_cost,
            actual_gas_used: *actual_gas_used,
            init_code: decoded.map(|op| op.init_code().clone()),
            call_data: decoded.map(|op| op.call_data().clone()),
            call_gas_limit: decoded.map(|op| op.call_gas_limit()),
            verification_gas_limit: decoded.map(|op| op.verification_gas_limit()),
            pre_verification_gas: decoded.map(|op| op.pre_verification_gas()),
            max_fee_per_gas: decoded.map(|op| op.max_fee_per_gas()),
            max_priority_fee_per_gas: decoded.map(|op| op.max_priority_fee_per_gas()),
            paymaster_and_data: decoded.map(|op| op.paymaster_and_data().clone()),
            signature: decoded.map(|op| op.signature().clone()),
            revert_reason,
            logs: log_ids,
            transaction_hash: ctx.hash(),
            block_number: ctx.block_number(),
            block_timestamp: ctx.block_timestamp,
        },
    );

    if let Some(wallet) = store.light_wallets.get_mut(sender) {
        if !wallet.user_operations.contains(user_op_hash) {
            wallet.user_operations.push(*user_op_hash);
        }
    }

    store.counter.user_operations += 1;
    if *success {
        store.counter.user_operations_succeeded += 1;
    } else {
        store.counter.user_operations_reverted += 1;
    }
    tracing::info!(user_op_hash = ?user_op_hash, sender = ?sender, success, "user operation indexed");
    true
}

/// Walks back from the operation's event to the previous `UserOperationEvent` or to
/// `BeforeExecution`, recording every log in between as emitted by the operation.
/// Returns the log ids in log order and the revert reason row found on the way.
fn associate_logs(
    store: &mut EntityStore,
    ctx: &TxContext,
    position: usize,
    user_op_hash: H256,
) -> (Vec<String>, Option<String>) {
    let mut ids = Vec::new();
    let mut revert_reason = None;

    for i in (0..position).rev() {
        let log = &ctx.receipt.logs[i];
        if ctx.is_entry_point_log(log, EventKind::BeforeExecution)
            || ctx.is_entry_point_log(log, EventKind::UserOperationEvent)
        {
            break;
        }
        let log_index = log_index_of(log, i);
        let id = log_id(ctx.hash(), log_index);

        if ctx.is_entry_point_log(log, EventKind::UserOperationRevertReason)
            && log.topics.get(1) == Some(&user_op_hash)
        {
            revert_reason = Some(id.clone());
        }

        store.logs.entry(id.clone()).or_insert_with(|| LogEntity {
            id: id.clone(),
            address: log.address,
            topics: log.topics.clone(),
            data: log.data.clone(),
            log_index,
            transaction_hash: ctx.hash(),
            user_operation: Some(user_op_hash),
        });
        ids.push(id);
    }
    ids.reverse();
    (ids, revert_reason)
}

fn revert_reason(store: &mut EntityStore, ctx: &TxContext, log_index: u64, event: &EntryPointEvent) {
    let EntryPointEvent::UserOperationRevertReason {
        user_op_hash,
        sender,
        nonce,
        revert_reason,
    } = event
    else {
        return;
    };
    let id = log_id(ctx.hash(), log_index);
    store
        .user_operation_revert_reasons
        .entry(id.clone())
        .or_insert_with(|| UserOperationRevertReasonEntity {
            id: id.clone(),
            user_op_hash: *user_op_hash,
            sender: *sender,
            nonce: *nonce,
            revert_reason: revert_reason.clone(),
            block_number: ctx.block_number(),
            block_timestamp: ctx.block_timestamp,
            transaction_hash: ctx.hash(),
        });

    // usually the operation is recorded after this log; associate_logs links it then
    if let Some(op) = store.user_operations.get_mut(user_op_hash) {
        op.revert_reason.get_or_insert(id);
    }
}

fn load_or_create_transaction(store: &mut EntityStore, ctx: &TxContext) {
    let tx = &ctx.transaction;
    store
        .transactions
        .entry(tx.hash)
        .or_insert_with(|| TransactionEntity {
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            value: tx.value,
            nonce: tx.nonce,
            gas: tx.gas,
            gas_price: tx.gas_price,
            input: tx.input.clone(),
            block_number: ctx.block_number(),
            block_timestamp: ctx.block_timestamp,
        });
}

fn load_or_create_receipt(store: &mut EntityStore, ctx: &TxContext) {
    let r = &ctx.receipt;
    store
        .receipts
        .entry(r.transaction_hash)
        .or_insert_with(|| ReceiptEntity {
            transaction_hash: r.transaction_hash,
            status: r.status.map(|s| s.as_u64()),
            gas_used: r.gas_used,
            cumulative_gas_used: r.cumulative_gas_used,
            effective_gas_price: r.effective_gas_price,
            block_number: ctx.block_number(),
        });
}

fn log_index_of(log: &Log, position: usize) -> u64 {
    log.log_index.map(|i| i.as_u64()).unwrap_or(position as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::tests::{log, topic_of};
    use ethers::abi::{encode, Token};
    use ethers::types::{Bytes, U256, U64};
    use ethers::utils::keccak256;

    const CHAIN_ID: u64 = 8453;

    fn entry_point() -> Address {
        Address::repeat_byte(0xee)
    }

    fn factory() -> Address {
        Address::repeat_byte(0xfa)
    }

    fn wallet() -> Address {
        Address::repeat_byte(0x77)
    }

    fn ep_log(topics: Vec<H256>, data: Vec<u8>) -> Log {
        let mut l = log(topics, data);
        l.address = entry_point();
        l
    }

    fn account_deployed(sender: Address, factory: Address, op_hash: H256) -> Log {
        ep_log(
            vec![EventKind::AccountDeployed.topic0(), op_hash, topic_of(sender)],
            encode(&[Token::Address(factory), Token::Address(Address::zero())]),
        )
    }

    fn before_execution() -> Log {
        ep_log(vec![EventKind::BeforeExecution.topic0()], vec![])
    }

    fn op_event(sender: Address, op_hash: H256, nonce: u64, success: bool) -> Log {
        ep_log(
            vec![
                EventKind::UserOperationEvent.topic0(),
                op_hash,
                topic_of(sender),
                H256::zero(),
            ],
            encode(&[
                Token::Uint(U256::from(nonce)),
                Token::Bool(success),
                Token::Uint(U256::from(21_000)),
                Token::Uint(U256::from(100)),
            ]),
        )
    }

    fn revert_log(sender: Address, op_hash: H256) -> Log {
        ep_log(
            vec![
                EventKind::UserOperationRevertReason.topic0(),
                op_hash,
                topic_of(sender),
            ],
            encode(&[Token::Uint(U256::zero()), Token::Bytes(vec![0xde, 0xad])]),
        )
    }

    fn app_log(byte: u8) -> Log {
        let mut l = log(vec![H256::repeat_byte(byte)], vec![byte]);
        l.address = Address::repeat_byte(byte);
        l
    }

    fn handle_ops_input(ops: &[UserOperation]) -> Bytes {
        let sig = crate::events::HANDLE_OPS_SIGNATURE;
        let mut input = keccak256(sig)[..4].to_vec();
        input.extend(encode(&[
            Token::Array(ops.iter().map(UserOperation::to_abi_token).collect()),
            Token::Address(Address::repeat_byte(0xbe)),
        ]));
        Bytes::from(input)
    }

    fn ctx(logs: Vec<Log>, input: Bytes) -> TxContext {
        let hash = H256::repeat_byte(0x99);
        let logs = logs
            .into_iter()
            .enumerate()
            .map(|(i, mut l)| {
                l.log_index = Some(U256::from(i));
                l.transaction_hash = Some(hash);
                l
            })
            .collect();
        TxContext {
            chain_id: CHAIN_ID,
            entry_point: entry_point(),
            transaction: Transaction {
                hash,
                input,
                ..Default::default()
            },
            receipt: TransactionReceipt {
                transaction_hash: hash,
                block_number: Some(U64::from(1_234)),
                status: Some(U64::one()),
                logs,
                ..Default::default()
            },
            block_timestamp: 1_700_000_000,
        }
    }

    fn sample_op(nonce: u64) -> UserOperation {
        let mut op = UserOperation::new(wallet(), CHAIN_ID);
        op.set_nonce(U256::from(nonce));
        op.set_call_data(Bytes::from(vec![0xca, 0x11]));
        op.set_call_gas_limit(U256::from(50_000));
        op
    }

    #[test]
    fn deployment_and_operations_are_indexed() {
        let h = Handlers::new([factory()]);
        let mut store = EntityStore::default();

        let op0 = sample_op(0);
        let op1 = sample_op(1);
        let h0 = op0.hash_for(entry_point());
        let h1 = op1.hash_for(entry_point());

        let c = ctx(
            vec![
                account_deployed(wallet(), factory(), h0),
                ep_log(
                    vec![EventKind::Deposited.topic0(), topic_of(wallet())],
                    encode(&[Token::Uint(U256::from(5))]),
                ),
                before_execution(),
                app_log(1),
                app_log(2),
                op_event(wallet(), h0, 0, true),
                app_log(3),
                revert_log(wallet(), h1),
                op_event(wallet(), h1, 1, false),
            ],
            handle_ops_input(&[op0.clone(), op1.clone()]),
        );

        let stats = h.handle_transaction(&mut store, &c);
        assert_eq!(stats.wallets_created, 1);
        assert_eq!(stats.user_operations_created, 2);
        assert_eq!(stats.events, 6);

        assert_eq!(store.counter.light_wallets, 1);
        assert_eq!(store.counter.user_operations, 2);
        assert_eq!(store.counter.user_operations_succeeded, 1);
        assert_eq!(store.counter.user_operations_reverted, 1);

        let first = &store.user_operations[&h0];
        assert_eq!(
            first.logs,
            vec![log_id(c.hash(), 3), log_id(c.hash(), 4)]
        );
        assert_eq!(first.call_data.as_ref(), Some(op0.call_data()));
        assert!(first.revert_reason.is_none());

        let second = &store.user_operations[&h1];
        assert_eq!(second.logs, vec![log_id(c.hash(), 6), log_id(c.hash(), 7)]);
        assert_eq!(second.revert_reason.as_deref(), Some(log_id(c.hash(), 7).as_str()));
        assert_eq!(second.call_gas_limit, Some(U256::from(50_000)));
        assert!(!second.success);

        assert_eq!(store.logs[&log_id(c.hash(), 3)].user_operation, Some(h0));
        assert_eq!(store.light_wallets[&wallet()].user_operations, vec![h0, h1]);
        assert_eq!(store.transactions.len(), 1);
        assert_eq!(store.receipts[&c.hash()].status, Some(1));
        assert_eq!(store.user_operation_events.len(), 2);
        assert_eq!(store.user_operation_revert_reasons.len(), 1);
        // AccountDeployed, Deposited and BeforeExecution rows
        assert_eq!(store.events.len(), 3);
        assert_eq!(store.events[&log_id(c.hash(), 0)].block_number, 1_234);
    }

    #[test]
    fn replaying_a_transaction_changes_nothing() {
        let h = Handlers::new([factory()]);
        let mut store = EntityStore::default();
        let op = sample_op(0);
        let hash = op.hash_for(entry_point());
        let c = ctx(
            vec![
                account_deployed(wallet(), factory(), hash),
                before_execution(),
                op_event(wallet(), hash, 0, true),
            ],
            handle_ops_input(&[op]),
        );

        h.handle_transaction(&mut store, &c);
        let snapshot = serde_json::to_value(&store).unwrap();
        let stats = h.handle_transaction(&mut store, &c);
        assert_eq!(stats.wallets_created, 0);
        assert_eq!(stats.user_operations_created, 0);
        assert_eq!(serde_json::to_value(&store).unwrap(), snapshot);
    }

    #[test]
    fn unknown_wallets_and_foreign_factories_are_skipped() {
        let h = Handlers::new([factory()]);
        let mut store = EntityStore::default();
        let other = Address::repeat_byte(0x55);
        let c = ctx(
            vec![
                account_deployed(other, Address::repeat_byte(0x01), H256::repeat_byte(1)),
                before_execution(),
                revert_log(other, H256::repeat_byte(1)),
                op_event(other, H256::repeat_byte(1), 0, false),
            ],
            Bytes::default(),
        );
        let stats = h.handle_transaction(&mut store, &c);
        assert_eq!(stats.skipped, 3);
        assert!(store.light_wallets.is_empty());
        assert!(store.user_operations.is_empty());
        assert!(store.user_operation_revert_reasons.is_empty());
        assert_eq!(store.counter, Default::default());
    }

    #[test]
    fn operation_without_decodable_calldata_keeps_event_fields() {
        let h = Handlers::new([factory()]);
        let mut store = EntityStore::default();
        let hash = H256::repeat_byte(0x31);
        let c = ctx(
            vec![
                account_deployed(wallet(), factory(), hash),
                before_execution(),
                op_event(wallet(), hash, 9, true),
            ],
            Bytes::from(vec![0x12, 0x34, 0x56, 0x78]),
        );
        h.handle_transaction(&mut store, &c);
        let op = &store.user_operations[&hash];
        assert_eq!(op.nonce, U256::from(9));
        assert!(op.call_data.is_none());
        assert!(op.logs.is_empty());
    }

    #[test]
    fn logs_from_other_contracts_are_ignored_as_events() {
        let h = Handlers::new([factory()]);
        let mut store = EntityStore::default();
        // same topic, wrong emitter
        let mut spoofed = op_event(wallet(), H256::repeat_byte(1), 0, true);
        spoofed.address = Address::repeat_byte(0x02);
        let stats = h.handle_transaction(&mut store, &ctx(vec![spoofed], Bytes::default()));
        assert_eq!(stats, HandleStats::default());
    }
}
