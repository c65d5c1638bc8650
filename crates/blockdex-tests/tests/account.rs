//! Account-model chain: contract bookkeeping, token balances and the
//! contract history filter.

use blockdex_api::types::{AccountDetails, AddressFilter};
use blockdex_api::ApiError;
use blockdex_core::types::{
    ChainType, ContractInfo, EthTxStatus, EthereumTxData, NftMetadata, TokenStandard, TokenTransfer,
};
use blockdex_tests::helpers::*;

fn transfer(contract: &str, from: &str, to: &str, value: u128) -> TokenTransfer {
    TokenTransfer {
        standard: TokenStandard::Erc20,
        contract: contract.into(),
        from: from.into(),
        to: to.into(),
        value,
        token_id: None,
    }
}

/// alice pays bob 100 and moves 5 `tokenA` to carol in the same tx.
async fn token_env() -> TestEnv {
    let env = TestEnv::new(ChainType::Ethereum);
    env.backend.add_contract(ContractInfo {
        contract: "tokenA".into(),
        standard: TokenStandard::Erc20,
        name: "Token A".into(),
        symbol: "TKA".into(),
        decimals: 6,
        created_in_block: 0,
        destructed_in_block: 0,
        nft: Vec::new(),
    });
    let eth = EthereumTxData {
        nonce: 0,
        gas_limit: 50_000,
        gas_price: 1,
        gas_used: Some(21_000),
        status: EthTxStatus::Ok,
        token_transfers: vec![transfer("tokenA", "alice", "carol", 5)],
        ..Default::default()
    };
    env.backend.mine(vec![eth_tx(1, "alice", "bob", 100, eth)]);
    env.backend.set_balance("bob", 777);
    env.sync().await;
    env
}

#[tokio::test]
async fn token_receiver_lists_contract_balance() {
    let env = token_env().await;
    let carol = env
        .worker
        .get_address("carol", 1, 10, AccountDetails::TokenBalances, &AddressFilter::default())
        .await
        .unwrap();
    assert_eq!(carol.txs, 1);
    assert_eq!(carol.non_token_txs, Some(0));
    assert_eq!(carol.used_tokens, Some(1));
    let token = &carol.tokens[0];
    assert_eq!((token.kind.as_str(), token.contract.as_str(), token.symbol.as_str()), ("ERC20", "tokenA", "TKA"));
    assert_eq!(token.decimals, 6);
    assert_eq!(token.balance, Some(5));

    let stored = env.ix.get_contract_info_for_address("tokenA").unwrap().unwrap();
    assert_eq!(stored.name, "Token A");
}

#[tokio::test]
async fn contract_filter_selects_token_history() {
    let env = token_env().await;
    let on = |contract: &str| AddressFilter { contract: Some(contract.into()), ..Default::default() };
    let a = env.worker.get_address("carol", 1, 10, AccountDetails::Txids, &on("tokenA")).await.unwrap();
    assert_eq!(a.txids, vec![txid(1)]);
    let b = env.worker.get_address("carol", 1, 10, AccountDetails::Txids, &on("tokenB")).await.unwrap();
    assert!(b.txids.is_empty());
}

#[tokio::test]
async fn native_balance_and_nonce_come_from_backend() {
    let env = token_env().await;
    let bob = env.worker.get_address("bob", 1, 10, AccountDetails::Txids, &AddressFilter::default()).await.unwrap();
    assert_eq!(bob.balance, 777);
    assert_eq!(bob.nonce.as_deref(), Some("0"));
    assert_eq!((bob.txs, bob.non_token_txs), (1, Some(1)));
    assert_eq!(bob.txids, vec![txid(1)]);
    assert!(matches!(env.worker.get_utxo("bob", false).await, Err(ApiError::Unsupported(_))));
}

#[tokio::test]
async fn account_tx_view_has_fee_and_transfers() {
    let env = token_env().await;
    let view = env.worker.get_transaction(&txid(1), false, false).await.unwrap();
    assert_eq!((view.block_height, view.confirmations), (0, 1));
    assert_eq!((view.value, view.fees), (100, 21_000));
    assert_eq!(view.token_transfers.len(), 1);
    assert_eq!((view.token_transfers[0].symbol.as_str(), view.token_transfers[0].value), ("TKA", 5));
    let specific = view.ethereum_specific.unwrap();
    assert_eq!((specific.status, specific.gas_used), (1, Some(21_000)));

    let history = env.worker.get_balance_history("alice", 0, 0, &[], 3600).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!((history[0].sent, history[0].received), (21_100, 0));
}

#[tokio::test]
async fn held_nft_lists_contract_metadata() {
    let env = TestEnv::new(ChainType::Ethereum);
    let meta = |id: &str| NftMetadata {
        category: "punks".into(),
        commitment: id.into(),
        name: format!("Punk #{id}"),
        uri: format!("ipfs://punks/{id}"),
    };
    env.backend.add_contract(ContractInfo {
        contract: "punks".into(),
        standard: TokenStandard::Erc721,
        name: "Punks".into(),
        symbol: "PNK".into(),
        decimals: 0,
        created_in_block: 0,
        destructed_in_block: 0,
        nft: vec![meta("1"), meta("42")],
    });
    let mint = TokenTransfer { standard: TokenStandard::Erc721, token_id: Some(42), ..transfer("punks", "minter", "alice", 0) };
    env.backend.mine(vec![eth_tx(1, "minter", "punks", 0, EthereumTxData {
        status: EthTxStatus::Ok,
        token_transfers: vec![mint],
        ..Default::default()
    })]);
    env.sync().await;

    let alice = env
        .worker
        .get_address("alice", 1, 10, AccountDetails::TokenBalances, &AddressFilter::default())
        .await
        .unwrap();
    let token = &alice.tokens[0];
    assert_eq!(token.ids, vec![("42".to_string(), "1".to_string())]);
    assert_eq!(token.nfts, vec![meta("42")]);
    assert_eq!(env.ix.get_contract_info_for_address("punks").unwrap().unwrap().nft.len(), 2);
}
