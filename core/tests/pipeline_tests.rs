/// End to end pipeline tests
/// Relay reports -> aggregator -> optimizer -> route matrix -> session selection

extern crate relay_core;

use rand::rngs::StdRng;
use rand::SeedableRng;
use relay_core::config::StatsConfig;
use relay_core::optimizer::{optimize_matrix, OptimizeOptions};
use relay_core::selector::{RouteSelector, RouteShader, RouteState, SliceInput};
use relay_core::stats::{relay_id, Aggregator, RelayInfo, RelaySample, RelayUpdate};
use relay_core::{RouteMatrix, UNROUTABLE};

const WINDOW: usize = 5;

fn update(name: &str, now: u64, links: &[(&str, f32)]) -> RelayUpdate {
    RelayUpdate {
        relay_id: relay_id(name),
        relay_name: name.to_string(),
        relay_address: "127.0.0.1:40000".parse().unwrap(),
        timestamp: now,
        version: "1.0.0".to_string(),
        sessions: 0,
        shutting_down: false,
        samples: links
            .iter()
            .map(|(dest, rtt)| RelaySample {
                dest_relay_id: relay_id(dest),
                rtt: *rtt,
                jitter: 1.0,
                packet_loss: 0.0,
            })
            .collect(),
    }
}

async fn report_round(aggregator: &Aggregator, now: u64) {
    aggregator
        .process_update(&update("la", now, &[("chicago", 100.0), ("denver", 10.0)]))
        .await;
    aggregator
        .process_update(&update("chicago", now, &[("la", 100.0), ("denver", 10.0)]))
        .await;
    aggregator
        .process_update(&update("denver", now, &[("la", 10.0), ("chicago", 10.0)]))
        .await;
}

fn directory() -> Vec<RelayInfo> {
    ["chicago", "denver", "la"]
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let address = format!("10.0.1.{}:40000", i + 1).parse().unwrap();
            RelayInfo::new(name, address, i as u64 + 1)
        })
        .collect()
}

#[tokio::test]
async fn test_reports_to_session_route() {
    let aggregator = Aggregator::new(StatsConfig {
        history_size: WINDOW,
        ..StatsConfig::default()
    });
    let start = 1_700_000_000;

    // Cold start: every pair is poisoned until the window fills
    for t in 0..WINDOW as u64 - 1 {
        report_round(&aggregator, start + t).await;
    }
    let ids: Vec<u64> = aggregator.routable_relays(start + 3).await;
    let costs = aggregator.build_cost_matrix(&ids, 100.0, 1.0, start + 3).await;
    assert_eq!(costs.routable_pairs(), 0);

    let now = start + WINDOW as u64 - 1;
    report_round(&aggregator, now).await;

    let relays = directory();
    let ids = aggregator.routable_relays(now).await;
    assert_eq!(ids, relays.iter().map(|r| r.id).collect::<Vec<_>>());

    let costs = aggregator.build_cost_matrix(&ids, 100.0, 1.0, now).await;
    assert_eq!(costs.routable_pairs(), 3);
    assert_eq!(costs.get(2, 0), 100);

    let datacenters: Vec<u64> = relays.iter().map(|r| r.datacenter_id).collect();
    let options = OptimizeOptions {
        datacenters: Some(&datacenters),
        ..OptimizeOptions::default()
    };
    let entries = optimize_matrix(&costs, 2, &options);
    let matrix = RouteMatrix::new(&relays, entries, now);

    // Ship it through the binary codec
    let decoded = RouteMatrix::from_bytes(&matrix.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, matrix);

    let la = decoded.relay_index(relay_id("la")).unwrap() as u32;
    let chicago = decoded.relay_index(relay_id("chicago")).unwrap() as u32;
    let denver = decoded.relay_index(relay_id("denver")).unwrap() as u32;

    let shader = RouteShader::default();
    let selector = RouteSelector::new(&decoded.route_entries, &shader);
    let mut state = RouteState::new(2);
    let mut rng = StdRng::seed_from_u64(8);

    let input = SliceInput {
        direct_latency: 110,
        direct_packet_loss: 0.0,
        next_latency: 0,
        predicted_latency: 0,
        source_relays: &[la],
        source_relay_costs: &[5],
        dest_relays: &[chicago],
    };
    let decision = selector.take_network_next(&mut state, &input, &mut rng);
    assert!(decision.take);
    let route = decision.route.unwrap();
    assert_eq!(route.relays, vec![la, denver, chicago]);
    assert_eq!(route.cost, 5 + 20 + 3);
}

#[tokio::test]
async fn test_silent_relay_drops_out_of_matrix() {
    let aggregator = Aggregator::new(StatsConfig {
        history_size: 2,
        ..StatsConfig::default()
    });
    let start = 1_700_000_000;
    report_round(&aggregator, start).await;
    report_round(&aggregator, start + 1).await;

    // Denver stops reporting, the others keep going
    let later = start + 20;
    for t in [later - 1, later] {
        aggregator
            .process_update(&update("la", t, &[("chicago", 100.0), ("denver", 10.0)]))
            .await;
        aggregator
            .process_update(&update("chicago", t, &[("la", 100.0), ("denver", 10.0)]))
            .await;
    }

    let ids = aggregator.routable_relays(later).await;
    assert_eq!(ids, vec![relay_id("chicago"), relay_id("la")]);

    // Even when asked for, the silent relay's pairs are unroutable
    let all = [relay_id("chicago"), relay_id("denver"), relay_id("la")];
    let costs = aggregator.build_cost_matrix(&all, 100.0, 1.0, later).await;
    assert_eq!(costs.get(1, 0), UNROUTABLE);
    assert_eq!(costs.get(2, 1), UNROUTABLE);
    assert_eq!(costs.get(2, 0), 100);
}
