//! Connection tracking under concurrency, pressure and expiry.

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::thread;

use ipve_common::*;
use ipve_datapath::conntrack::{CtObservation, CtState};
use ipve_datapath::monitor::ObsPoint;
use ipve_datapath::test_util::packets;
use ipve_datapath::test_util::*;
use ipve_datapath::tuple::CtTuple;
use ipve_datapath::{CtConfig, CtMaps, Direction, Disposition, Forward, NodeConfig};

fn tuple(sport: u16, dport: u16) -> CtTuple<Ipv6Addr> {
    CtTuple::new(CLIENT_V6, REMOTE_V6, IPPROTO_UDP, Direction::Egress).with_ports(sport, dport)
}

#[test]
fn test_parallel_creates_all_land() {
    let ct = Arc::new(CtMaps::with_clock(
        CtConfig::default(),
        Arc::new(ManualClock::new(0)),
    ));

    thread::scope(|s| {
        for worker in 0..8u16 {
            let ct = &ct;
            s.spawn(move || {
                for i in 0..250u16 {
                    ct.create(&tuple(worker, i), &CtState::default(), &CtObservation::default());
                }
            });
        }
    });

    assert_eq!(ct.len(), 8 * 250);
    assert!(ct.get(&tuple(7, 249)).is_some());
}

#[test]
fn test_parallel_creates_of_one_flow() {
    let ct = CtMaps::with_clock(CtConfig::default(), Arc::new(ManualClock::new(0)));
    let flow = tuple(1000, 53);

    thread::scope(|s| {
        for label in 1..=8u32 {
            let ct = &ct;
            s.spawn(move || {
                let state = CtState {
                    src_sec_id: label,
                    ..Default::default()
                };
                ct.create(&flow, &state, &CtObservation::default());
            });
        }
    });

    assert_eq!(ct.len(), 1);
    let label = ct.get(&flow).unwrap().src_sec_id;
    assert!((1..=8).contains(&label));
}

#[test]
fn test_parallel_lookups_count_every_packet() {
    let ct = CtMaps::with_clock(CtConfig::default(), Arc::new(ManualClock::new(0)));
    let flow = tuple(1000, 53);
    ct.create(&flow, &CtState::default(), &CtObservation::default());

    let obs = CtObservation {
        bytes: 100,
        tcp_flags: 0,
    };
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..100 {
                    ct.lookup(&flow.reverse(), None, &obs).unwrap();
                }
            });
        }
    });

    let entry = ct.get(&flow).unwrap();
    assert_eq!(entry.rx_packets, 400);
    assert_eq!(entry.rx_bytes, 40_000);
}

#[test]
fn test_table_stays_bounded_under_pressure() {
    let node = NodeConfig {
        conntrack: CtConfig {
            tcp_capacity: 64,
            ..Default::default()
        },
        ..node_config()
    };
    let bed = TestBed::with_node(node);

    for sport in 0..500u16 {
        let mut syn = packets::tcp6(CLIENT_V6, REMOTE_V6, 10000 + sport, 443, TCP_FLAG_SYN);
        assert_eq!(
            bed.dp.handle_egress(CLIENT_ID, &mut syn),
            Disposition::Accept(Forward::Stack)
        );
    }

    let tcp = bed.dp.ct.map::<Ipv6Addr>(IPPROTO_TCP);
    assert!(tcp.len() <= 64);
    assert!(tcp.evictions() >= 500 - 64);
    // The most recent flow always survives its own insertion.
    let last = CtTuple::new(CLIENT_V6, REMOTE_V6, IPPROTO_TCP, Direction::Egress)
        .with_ports(10499, 443);
    assert!(bed.dp.ct.get(&last).is_some());
}

#[test]
fn test_parallel_egress() {
    let bed = TestBed::new();

    thread::scope(|s| {
        for worker in 0..4u16 {
            let dp = &bed.dp;
            s.spawn(move || {
                for i in 0..50u16 {
                    let sport = 20000 + worker * 100 + i;
                    let mut pkt = packets::udp6(CLIENT_V6, REMOTE_V6, sport, 53, b"q");
                    assert!(dp.handle_egress(CLIENT_ID, &mut pkt).is_accept());
                }
            });
        }
    });

    assert_eq!(bed.dp.ct.len(), 200);
    assert_eq!(
        bed.dp
            .metrics
            .get(REASON_FORWARDED, Direction::Egress)
            .count,
        200
    );
}

#[test]
fn test_idle_flow_expires() {
    let bed = TestBed::new();
    let mut first = packets::udp6(CLIENT_V6, REMOTE_V6, 5000, 53, b"q");
    bed.dp.handle_egress(CLIENT_ID, &mut first);

    // Lifetimes are only enforced by the sweep.
    bed.clock.advance(CT_CONNECTION_LIFETIME_NONTCP as u64 + 1);
    let mut stale = packets::udp6(CLIENT_V6, REMOTE_V6, 5000, 53, b"q");
    bed.dp.handle_egress(CLIENT_ID, &mut stale);
    assert_eq!(bed.monitor.traces().pop().unwrap().reason, CT_ESTABLISHED);

    bed.clock.advance(CT_CONNECTION_LIFETIME_NONTCP as u64 + 1);
    assert_eq!(bed.dp.ct.gc(), 1);
    assert!(bed.dp.ct.is_empty());

    let mut again = packets::udp6(CLIENT_V6, REMOTE_V6, 5000, 53, b"q");
    bed.dp.handle_egress(CLIENT_ID, &mut again);
    let trace = bed.monitor.traces().pop().unwrap();
    assert_eq!(trace.obs_point, ObsPoint::ToStack);
    assert_eq!(trace.reason, CT_NEW);
}

#[test]
fn test_closed_connection_expires_sooner() {
    let bed = TestBed::new();
    let mut syn = packets::tcp6(CLIENT_V6, REMOTE_V6, 40000, 443, TCP_FLAG_SYN);
    bed.dp.handle_egress(CLIENT_ID, &mut syn);
    let mut fin = packets::tcp6(CLIENT_V6, REMOTE_V6, 40000, 443, TCP_FLAG_FIN | TCP_FLAG_ACK);
    bed.dp.handle_egress(CLIENT_ID, &mut fin);

    let tuple = CtTuple::new(CLIENT_V6, REMOTE_V6, IPPROTO_TCP, Direction::Egress)
        .with_ports(40000, 443);
    let entry = bed.dp.ct.get(&tuple).unwrap();
    assert!(entry.tx_closing);
    assert_eq!(entry.lifetime, 1000 + CT_CLOSE_TIMEOUT as u64);

    bed.clock.advance(CT_CLOSE_TIMEOUT as u64);
    assert_eq!(bed.dp.ct.gc(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cleaner_runs_in_background() {
    let bed = TestBed::new();
    let mut pkt = packets::udp6(CLIENT_V6, REMOTE_V6, 5000, 53, b"q");
    bed.dp.handle_egress(CLIENT_ID, &mut pkt);
    assert_eq!(bed.dp.ct.len(), 1);

    let cleaner = ipve_datapath::ConnTrackCleaner::start(
        bed.dp.ct.clone(),
        std::time::Duration::from_secs(5),
    );
    bed.clock.advance(3600);
    tokio::time::sleep(std::time::Duration::from_secs(6)).await;

    assert!(bed.dp.ct.is_empty());
    cleaner.stop();
}
