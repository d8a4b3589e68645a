//! Property-Based Tests for Expert Selection and Routing Bookkeeping
//!
//! These tests check invariants of the router that must hold for any set
//! of experts and any sequence of queries.

use conclave_workspace::agents::{
    ExpertRecord, ExpertRegistry, ExpertSelector, QueryClassifier,
};
use conclave_workspace::{
    AgentId, InMemoryBus, LoadBalancingStrategy, MessageBus, Payload, QueryCategory, RouterAgent,
};
use proptest::prelude::*;
use std::sync::Arc;

// Strategy for generating valid agent ids
fn agent_id_strategy() -> impl Strategy<Value = AgentId> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}")
        .unwrap()
        .prop_filter_map("Valid agent id", |s| AgentId::parse(&s).ok())
}

fn experts(loads: &[u64]) -> Vec<ExpertRecord> {
    loads
        .iter()
        .enumerate()
        .map(|(i, load)| {
            let mut record = ExpertRecord::new(
                AgentId::parse(format!("expert_{i}")).unwrap(),
                vec!["general".to_string()],
                Payload::new(),
            );
            record.load = *load;
            record
        })
        .collect()
}

proptest! {
    /// Property: round robin visits experts cyclically in registration order
    #[test]
    fn prop_round_robin_cycles(pool in 1usize..8, picks in 1usize..40) {
        let records = experts(&vec![0; pool]);
        let eligible: Vec<&ExpertRecord> = records.iter().collect();
        let mut selector = ExpertSelector::new(LoadBalancingStrategy::RoundRobin);

        for i in 0..picks {
            let picked = selector.select("general", &eligible).unwrap();
            prop_assert_eq!(&picked.expert_id, &records[i % pool].expert_id);
        }
    }

    /// Property: least loaded picks a minimum-load expert, the first on ties
    #[test]
    fn prop_least_loaded_picks_first_minimum(loads in prop::collection::vec(0u64..10, 1..10)) {
        let records = experts(&loads);
        let eligible: Vec<&ExpertRecord> = records.iter().collect();
        let mut selector = ExpertSelector::new(LoadBalancingStrategy::LeastLoaded);

        let picked = selector.select("general", &eligible).unwrap();
        let min = *loads.iter().min().unwrap();
        let first_min = loads.iter().position(|l| *l == min).unwrap();
        prop_assert_eq!(&picked.expert_id, &records[first_min].expert_id);
    }

    /// Property: registering the same expert repeatedly leaves one record
    #[test]
    fn prop_register_is_idempotent(ids in prop::collection::vec(agent_id_strategy(), 1..20)) {
        let mut registry = ExpertRegistry::default();
        for id in &ids {
            registry.register(ExpertRecord::new(
                id.clone(),
                vec!["code".to_string()],
                Payload::new(),
            ));
        }
        for id in &ids {
            registry.register(ExpertRecord::new(
                id.clone(),
                vec!["legal".to_string()],
                Payload::new(),
            ));
        }

        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        prop_assert_eq!(registry.len(), unique.len());
        prop_assert!(registry.iter().all(|e| e.categories == vec!["legal".to_string()]));
    }

    /// Property: text without letters is always general
    #[test]
    fn prop_letterless_queries_are_general(query in "[0-9 .,!?]{0,64}") {
        let classifier = QueryClassifier::new();
        prop_assert_eq!(classifier.classify(&query), QueryCategory::General);
    }

    /// Property: unanswered dispatches show up as load and pending routes
    #[test]
    fn prop_dispatch_bookkeeping(pool in 1usize..5, queries in 1usize..20) {
        tokio_test::block_on(async {
            // never started: dispatches stay queued
            let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
            let router = RouterAgent::new(
                AgentId::parse("router").unwrap(),
                Some(bus),
                LoadBalancingStrategy::LeastLoaded,
            );
            for i in 0..pool {
                router.register_expert(
                    AgentId::parse(format!("expert_{i}")).unwrap(),
                    vec!["general".to_string()],
                    Payload::new(),
                );
            }

            for n in 0..queries {
                let routed = router
                    .route_query(&format!("question {n}"), AgentId::parse("client").unwrap())
                    .await
                    .unwrap();
                prop_assert_eq!(&routed["routed"], &serde_json::json!(true));
            }

            let loads: Vec<u64> = router.experts().iter().map(|e| e.load).collect();
            prop_assert_eq!(loads.iter().sum::<u64>(), queries as u64);
            prop_assert_eq!(router.pending_routes().len(), queries);
            // least loaded keeps the spread within one
            let spread = loads.iter().max().unwrap() - loads.iter().min().unwrap();
            prop_assert!(spread <= 1);
            prop_assert_eq!(router.routing_metrics().total_routed, queries as u64);
            Ok(())
        })?;
    }
}
