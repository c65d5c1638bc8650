//! Address history filters over generated chains: every filtered listing is
//! an in-order subsequence of the unfiltered one.

use proptest::prelude::*;

use blockdex_api::types::{AccountDetails, AddressFilter, VoutFilter};
use blockdex_core::types::{Amount, ChainType, EthTxStatus, EthereumTxData, TokenStandard, TokenTransfer};
use blockdex_tests::helpers::*;

const ADDRS: [&str; 3] = ["alice", "bob", "carol"];
const CONTRACTS: [&str; 2] = ["tokenA", "tokenB"];

fn is_subsequence(sub: &[String], full: &[String]) -> bool {
    let mut it = full.iter();
    sub.iter().all(|s| it.any(|f| f == s))
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

async fn listing(env: &TestEnv, addr: &str, filter: &AddressFilter) -> Vec<String> {
    env.worker
        .get_address(addr, 1, 1000, AccountDetails::Txids, filter)
        .await
        .unwrap()
        .txids
}

fn height_filter(range: (u32, u32)) -> AddressFilter {
    AddressFilter { from_height: range.0, to_height: range.1, ..Default::default() }
}

/// `(from, to)` heights; `to == 0` is unbounded.
fn height_range(blocks: u32) -> impl Strategy<Value = (u32, u32)> {
    (0..blocks, 0..blocks).prop_map(|(a, b)| if b == 0 { (a, 0) } else { (a.min(b), a.max(b)) })
}

/// Filtered listings paired with the listing each must be a subsequence of.
type Checks = Vec<(String, Vec<String>, Vec<String>)>;

async fn check_filters(env: &TestEnv, filters: &[(String, AddressFilter)], range: (u32, u32)) -> Checks {
    let mut out = Vec::new();
    for addr in ADDRS {
        let full = listing(env, addr, &AddressFilter::default()).await;
        for (label, filter) in filters {
            let narrowed = listing(env, addr, filter).await;
            let ranged = AddressFilter { from_height: range.0, to_height: range.1, ..filter.clone() };
            let both = listing(env, addr, &ranged).await;
            out.push((format!("{addr} {label}"), narrowed.clone(), full.clone()));
            out.push((format!("{addr} {label} {range:?}"), both, narrowed));
        }
        let by_height = listing(env, addr, &height_filter(range)).await;
        out.push((format!("{addr} {range:?}"), by_height, full));
    }
    out
}

// ------------------------------------------------------------------
// Script chain
// ------------------------------------------------------------------

/// Per block: coinbase payee, then spends as `(outpoint pick, payees)`.
type UtxoPlan = Vec<(usize, Vec<(usize, Vec<usize>)>)>;

fn utxo_plan() -> impl Strategy<Value = UtxoPlan> {
    let spend = (0usize..64, prop::collection::vec(0..ADDRS.len(), 1..3));
    prop::collection::vec((0..ADDRS.len(), prop::collection::vec(spend, 0..3)), 2..7)
}

fn mine_utxo_plan(backend: &TestBackend, plan: &UtxoPlan) {
    let mut unspent: Vec<(u32, u32, Amount)> = Vec::new();
    let mut next_id = 1u32;
    for (payee, spends) in plan {
        let mut spendable = std::mem::take(&mut unspent);
        let coinbase = next_id;
        next_id += 1;
        let mut txs = vec![coinbase_tx(coinbase, &[(ADDRS[*payee], 1 << 20)])];
        unspent.push((coinbase, 0, 1 << 20));
        for (pick, payees) in spends {
            if spendable.is_empty() {
                break;
            }
            let (prev, vout, value) = spendable.remove(pick % spendable.len());
            let id = next_id;
            next_id += 1;
            let share = value / payees.len() as Amount;
            let outs: Vec<(&str, Amount)> = payees.iter().map(|p| (ADDRS[*p], share)).collect();
            txs.push(spend_tx(id, &[(prev, vout)], &outs, 100));
            unspent.extend((0..outs.len() as u32).map(|n| (id, n, share)));
        }
        unspent.extend(spendable);
        backend.mine(txs);
    }
}

fn utxo_filters() -> Vec<(String, AddressFilter)> {
    [VoutFilter::Inputs, VoutFilter::Outputs, VoutFilter::Index(0), VoutFilter::Index(1)]
        .into_iter()
        .map(|vout| (format!("{vout:?}"), AddressFilter { vout, ..Default::default() }))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn utxo_filters_keep_history_order(plan in utxo_plan(), range in height_range(7)) {
        let checks = runtime().block_on(async {
            let env = TestEnv::new(ChainType::Bitcoin);
            mine_utxo_plan(&env.backend, &plan);
            env.sync().await;
            check_filters(&env, &utxo_filters(), range).await
        });
        for (label, sub, full) in checks {
            prop_assert!(is_subsequence(&sub, &full), "{label}: {sub:?} not within {full:?}");
        }
    }
}

// ------------------------------------------------------------------
// Account chain
// ------------------------------------------------------------------

/// Per block: txs as `(from, to, optional (contract, token from, token to))`.
type AccountPlan = Vec<Vec<(usize, usize, Option<(usize, usize, usize)>)>>;

fn account_plan() -> impl Strategy<Value = AccountPlan> {
    let token = prop::option::of((0..CONTRACTS.len(), 0..ADDRS.len(), 0..ADDRS.len()));
    let tx = (0..ADDRS.len(), 0..ADDRS.len(), token);
    prop::collection::vec(prop::collection::vec(tx, 1..3), 2..7)
}

fn mine_account_plan(backend: &TestBackend, plan: &AccountPlan) {
    let mut next_id = 1u32;
    for block in plan {
        let mut txs = Vec::new();
        for (from, to, token) in block {
            let token_transfers = token
                .iter()
                .map(|(c, tf, tt)| TokenTransfer {
                    standard: TokenStandard::Erc20,
                    contract: CONTRACTS[*c].into(),
                    from: ADDRS[*tf].into(),
                    to: ADDRS[*tt].into(),
                    value: 5,
                    token_id: None,
                })
                .collect();
            let eth = EthereumTxData {
                nonce: next_id as u64,
                gas_limit: 50_000,
                gas_price: 1,
                gas_used: Some(21_000),
                status: EthTxStatus::Ok,
                token_transfers,
                ..Default::default()
            };
            txs.push(eth_tx(next_id, ADDRS[*from], ADDRS[*to], 10, eth));
            next_id += 1;
        }
        backend.mine(txs);
    }
}

fn account_filters() -> Vec<(String, AddressFilter)> {
    let mut out: Vec<(String, AddressFilter)> = CONTRACTS
        .iter()
        .map(|c| (c.to_string(), AddressFilter { contract: Some(c.to_string()), ..Default::default() }))
        .collect();
    for vout in [VoutFilter::Inputs, VoutFilter::Outputs, VoutFilter::Index(0), VoutFilter::Index(1)] {
        out.push((format!("{vout:?}"), AddressFilter { vout, ..Default::default() }));
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn account_filters_keep_history_order(plan in account_plan(), range in height_range(7)) {
        let checks = runtime().block_on(async {
            let env = TestEnv::new(ChainType::Ethereum);
            mine_account_plan(&env.backend, &plan);
            env.sync().await;
            check_filters(&env, &account_filters(), range).await
        });
        for (label, sub, full) in checks {
            prop_assert!(is_subsequence(&sub, &full), "{label}: {sub:?} not within {full:?}");
        }
    }
}
