//! 地址分配测试
//!
//! 覆盖：大批量唯一性、并发分配、随机策略、重启后游标恢复、路径可重新派生

mod common;

use std::{collections::HashSet, sync::Arc};

use common::{engine, engine_on_store, engine_with};
use ironpay::{
    domain::{AccountScope, AddressKind, Network},
    repository::{InMemoryPaymentStore, PaymentStore},
    service::{AllocationPolicy, NewPayment},
};
use proptest::prelude::*;

fn new_payment(amount: u64) -> NewPayment {
    NewPayment {
        expected_amount: amount,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_ten_thousand_allocations_are_unique() {
    let engine = engine();
    let allocator = engine.state.allocator.clone();

    let mut addresses = HashSet::new();
    let mut paths = HashSet::new();
    for _ in 0..10_000 {
        let allocated = allocator.allocate(0, Network::Testnet).await.unwrap();
        assert!(addresses.insert(allocated.address.clone()), "address reused");
        assert!(paths.insert(allocated.path.to_string()), "path reused");
    }

    assert_eq!(addresses.len(), 10_000);
    assert!(paths.contains("m/84'/1'/0'/0/0"));
    assert!(paths.contains("m/84'/1'/0'/0/9999"));
}

#[tokio::test]
async fn test_concurrent_payments_get_distinct_addresses() {
    let engine = engine();
    let service = engine.state.payments.clone();

    let mut handles = Vec::new();
    for task in 0..32u64 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            let mut out = Vec::new();
            for i in 0..16u64 {
                let p = service.create(new_payment(1_000 + task * 100 + i)).await.unwrap();
                out.push(p.address.address);
            }
            out
        }));
    }

    let mut all = HashSet::new();
    for handle in handles {
        for address in handle.await.unwrap() {
            assert!(all.insert(address), "address handed out twice");
        }
    }
    assert_eq!(all.len(), 32 * 16);
    assert_eq!(engine.store.len().await, 32 * 16);
}

#[tokio::test]
async fn test_accounts_allocate_independently() {
    let engine = engine();
    let service = &engine.state.payments;

    let a = service
        .create(NewPayment {
            expected_amount: 10,
            account_index: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();
    let b = service
        .create(NewPayment {
            expected_amount: 10,
            account_index: Some(7),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(a.address.path.to_string(), "m/84'/1'/0'/0/0");
    assert_eq!(b.address.path.to_string(), "m/84'/1'/7'/0/0");
    assert_ne!(a.address.address, b.address.address);
}

#[tokio::test]
async fn test_random_policy_never_reuses_an_index() {
    let engine = engine_with(AllocationPolicy::Random, None);
    let service = &engine.state.payments;

    let mut addresses = HashSet::new();
    for _ in 0..500 {
        let p = service.create(new_payment(42)).await.unwrap();
        assert!(addresses.insert(p.address.address.clone()));
        assert!(engine.state.payments.verify(p.id).await.unwrap().matches);
    }
}

#[tokio::test]
async fn test_sequential_cursor_resumes_after_restart() {
    let store = Arc::new(InMemoryPaymentStore::new());

    {
        let first = engine_on_store(store.clone(), AllocationPolicy::Sequential, None);
        for _ in 0..3 {
            first.state.payments.create(new_payment(5)).await.unwrap();
        }
    }

    let scope = AccountScope {
        network: Network::Testnet,
        kind: AddressKind::Witness,
        account: 0,
    };
    assert_eq!(store.max_address_index(scope).await.unwrap(), Some(2));

    let restarted = engine_on_store(store, AllocationPolicy::Sequential, None);
    let p = restarted.state.payments.create(new_payment(5)).await.unwrap();
    assert_eq!(p.address.path.to_string(), "m/84'/1'/0'/0/3");
}

#[tokio::test]
async fn test_recorded_path_rederives_recorded_address() {
    let engine = engine();
    for _ in 0..20 {
        let p = engine.state.payments.create(new_payment(1)).await.unwrap();
        let report = engine.state.payments.verify(p.id).await.unwrap();
        assert!(report.matches);
        assert_eq!(report.derivation_path, p.address.path.to_string());
        assert!(p.address.address.starts_with("tb1q"));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_concurrent_allocation_is_collision_free(
        tasks in 2usize..12,
        per_task in 1usize..20,
        random in any::<bool>(),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let policy = if random { AllocationPolicy::Random } else { AllocationPolicy::Sequential };
        let (unique, total) = runtime.block_on(async move {
            let engine = engine_with(policy, None);
            let mut handles = Vec::new();
            for _ in 0..tasks {
                let service = engine.state.payments.clone();
                handles.push(tokio::spawn(async move {
                    let mut out = Vec::new();
                    for _ in 0..per_task {
                        let p = service.create(new_payment(7)).await.unwrap();
                        out.push(p.address.address);
                    }
                    out
                }));
            }

            let mut seen = HashSet::new();
            let mut total = 0;
            for handle in handles {
                for address in handle.await.unwrap() {
                    seen.insert(address);
                    total += 1;
                }
            }
            (seen.len(), total)
        });

        prop_assert_eq!(total, tasks * per_task);
        prop_assert_eq!(unique, total);
    }
}
