//! Stress tests for registry mutation under concurrent link/unlink.
//! Run with: cargo test --test stress_registry -- --ignored

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use northstar_fleet::{
    registry::{channel_indices, Registry, RegistryConfig},
    session::{AgentId, SessionConfig},
    sim::SimProvider,
};

fn id(raw: u32) -> AgentId {
    AgentId::new(raw).unwrap()
}

fn registry(provider: Arc<SimProvider>) -> Arc<Registry> {
    Arc::new(Registry::new(
        provider,
        RegistryConfig {
            session: SessionConfig {
                tick: Duration::from_millis(5),
                kill_retries: 50,
                teardown_timeout: Duration::from_secs(1),
            },
            link_stagger: Duration::ZERO,
        },
    ))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn concurrent_link_unlink_keeps_table_consistent() {
    let provider = Arc::new(SimProvider::new());
    let registry = registry(provider);

    let mut tasks = Vec::new();
    for worker in 0..8u32 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..50u32 {
                let a = id(1 + (worker * 7 + round) % 40);
                let b = id(1 + (worker * 13 + round * 3) % 40);
                registry.link(&[a, b]).await;
                if round % 3 == 0 {
                    registry.unlink(&[a]).await;
                }
                let _ = registry.resolve(b);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Every linked id has exactly one live session; nothing else does.
    let linked: BTreeSet<AgentId> = registry.linked_ids().into_iter().collect();
    assert_eq!(registry.session_count(), linked.len());
    for agent in &linked {
        assert!(registry.resolve(*agent).unwrap().is_alive());
    }
    assert_eq!(registry.channel_map(), channel_indices(&linked));

    registry.unlink_all().await;
    assert!(registry.linked_ids().is_empty());
    assert_eq!(registry.session_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn large_fleet_links_and_tears_down() {
    let provider = Arc::new(SimProvider::new());
    let registry = registry(provider.clone());
    let ids: Vec<AgentId> = (1..=200).map(id).collect();

    let outcome = registry.link(&ids).await;
    assert_eq!(outcome.opened.len(), 200);
    for (rank, agent) in ids.iter().enumerate() {
        assert_eq!(registry.resolve(*agent).unwrap().channel(), rank);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let sessions: Vec<_> = ids.iter().map(|a| registry.resolve(*a).unwrap()).collect();
    registry.shutdown().await;
    assert!(sessions.iter().all(|s| !s.is_alive()));
    assert!(provider
        .agent_ids()
        .into_iter()
        .all(|a| !provider.agent(a).is_some_and(|agent| agent.frames().is_empty())));
}
