use std::collections::HashMap;

use super::*;
use crate::logic::types::PortNo;

fn port(sw: u64, p: u32) -> SwitchPort {
    SwitchPort::new(SwitchId(sw), PortNo(p))
}

fn ports(n: u32) -> Vec<SwitchPort> {
    (1..=n).map(|p| port(1, p)).collect()
}

fn all(verdict: Verdict, ports: &[SwitchPort]) -> HashMap<SwitchPort, Verdict> {
    ports.iter().map(|&p| (p, verdict)).collect()
}

fn exactly_one_state(c: &PortClassifier, tracked: &[SwitchPort]) {
    assert!(c.is_consistent());
    assert_eq!(c.len(), tracked.len());
    let snap = c.snapshot();
    for p in tracked {
        let hits = snap.normal.contains(p) as u8
            + snap.observe.contains(p) as u8
            + snap.abnormal.contains(p) as u8;
        assert_eq!(hits, 1, "port {} in {} states", p, hits);
    }
}

#[test]
fn test_init_all_normal() {
    let c = PortClassifier::new();
    let tracked = ports(5);
    c.init(&tracked);

    let snap = c.snapshot();
    assert_eq!(snap.normal.len(), 5);
    assert!(snap.observe.is_empty());
    assert!(snap.abnormal.is_empty());
    exactly_one_state(&c, &tracked);
}

#[test]
fn test_normal_pass_respects_bound() {
    let c = PortClassifier::new();
    let tracked = ports(5);
    c.init(&tracked);

    let picked = c.normal_pass(1, 2, |_| false);
    assert_eq!(picked.len(), 2);
    for p in &picked {
        assert_eq!(
            c.placement(p),
            Some(Placement::Observation { good_streak: 0, polled: true, since: 1 })
        );
    }
    assert_eq!(c.snapshot().polling, {
        let mut v = picked.clone();
        v.sort();
        v
    });
    exactly_one_state(&c, &tracked);
}

#[test]
fn test_normal_pass_skips_and_rotates() {
    let c = PortClassifier::new();
    let tracked = ports(4);
    c.init(&tracked);
    let manual = port(1, 2);

    // Bound larger than eligible ports: stops after a full rotation
    let picked = c.normal_pass(1, 10, |p| *p == manual);
    assert_eq!(picked.len(), 3);
    assert!(!picked.contains(&manual));
    assert_eq!(c.ports_in(PortState::Normal), vec![manual]);
    exactly_one_state(&c, &tracked);
}

#[test]
fn test_normal_pass_only_skipped_ports_left() {
    let c = PortClassifier::new();
    let tracked = ports(3);
    c.init(&tracked);
    assert!(c.normal_pass(1, 3, |_| true).is_empty());
    assert_eq!(c.ports_in(PortState::Normal).len(), 3);
}

#[test]
fn test_observation_exit_needs_streak() {
    let c = PortClassifier::new();
    let p = port(1, 1);
    c.init(&[p]);
    c.normal_pass(1, 1, |_| false);

    // Credit 24 -> threshold 3
    let good = all(Verdict::Good, &[p]);
    let mut cycle = 2;
    let mut good_cycles = 0;
    loop {
        let out = c.observation_pass(cycle, &good, |_| 3);
        good_cycles += 1;
        if !out.released.is_empty() {
            break;
        }
        cycle += 1;
        assert!(good_cycles < 20);
    }
    assert!(good_cycles >= 3);
    assert_eq!(c.state_of(&p), Some(PortState::Normal));
}

#[test]
fn test_observation_exit_at_credit_zero_needs_six() {
    let c = PortClassifier::new();
    let p = port(1, 1);
    c.init(&[p]);
    c.normal_pass(1, 1, |_| false);

    let good = all(Verdict::Good, &[p]);
    let mut good_cycles = 0;
    for cycle in 2..40 {
        good_cycles += 1;
        if !c.observation_pass(cycle, &good, |_| 6).released.is_empty() {
            break;
        }
    }
    assert!(good_cycles >= 6);
    assert_eq!(c.state_of(&p), Some(PortState::Normal));
}

#[test]
fn test_observation_bad_goes_abnormal() {
    let c = PortClassifier::new();
    let p = port(1, 1);
    c.init(&[p]);
    c.normal_pass(1, 1, |_| false);

    let out = c.observation_pass(2, &all(Verdict::Bad, &[p]), |_| 3);
    assert_eq!(out.demoted, vec![p]);
    assert_eq!(c.ports_in(PortState::Abnormal), vec![p]);
    exactly_one_state(&c, &[p]);
}

#[test]
fn test_no_data_is_neutral() {
    let c = PortClassifier::new();
    let p = port(1, 1);
    c.init(&[p]);
    c.normal_pass(1, 1, |_| false);
    c.observation_pass(2, &all(Verdict::Good, &[p]), |_| 3);

    let before = c.placement(&p);
    let out = c.observation_pass(3, &HashMap::new(), |_| 3);
    assert_eq!(out, ObservationOutcome::default());
    assert_eq!(c.placement(&p), before);

    // Abnormal ports without data stay
    c.observation_pass(4, &all(Verdict::Bad, &[p]), |_| 3);
    assert!(c.abnormal_pass(5, &all(Verdict::NoData, &[p])).is_empty());
    assert!(c.is_abnormal(&p));
}

#[test]
fn test_abnormal_pass_promotes_good_ports() {
    let c = PortClassifier::new();
    let tracked = ports(3);
    c.init(&tracked);
    c.normal_pass(1, 3, |_| false);
    c.observation_pass(2, &all(Verdict::Bad, &tracked), |_| 3);
    assert_eq!(c.ports_in(PortState::Abnormal).len(), 3);

    let mut verdicts = all(Verdict::Bad, &tracked);
    verdicts.insert(port(1, 2), Verdict::Good);
    let promoted = c.abnormal_pass(3, &verdicts);
    assert_eq!(promoted, vec![port(1, 2)]);
    assert_eq!(
        c.placement(&port(1, 2)),
        Some(Placement::Observation { good_streak: 0, polled: false, since: 3 })
    );
    assert_eq!(c.ports_in(PortState::Abnormal).len(), 2);
    exactly_one_state(&c, &tracked);
}

#[test]
fn test_one_pass_per_port_per_cycle() {
    let c = PortClassifier::new();
    let p = port(1, 1);
    c.init(&[p]);
    c.normal_pass(1, 1, |_| false);
    c.observation_pass(2, &all(Verdict::Bad, &[p]), |_| 3);

    // Demoted in cycle 2: the abnormal pass of cycle 2 leaves it alone
    assert!(c.abnormal_pass(2, &all(Verdict::Good, &[p])).is_empty());
    assert_eq!(c.abnormal_pass(3, &all(Verdict::Good, &[p])), vec![p]);

    // Promoted in cycle 3: not judged by the observation pass of cycle 3
    let out = c.observation_pass(3, &all(Verdict::Bad, &[p]), |_| 3);
    assert!(out.demoted.is_empty());
}

#[test]
fn test_membership_invariant_under_random_cycles() {
    use rand::{Rng, SeedableRng};

    let tracked: Vec<SwitchPort> = (1..=3)
        .flat_map(|sw| (1..=4).map(move |p| port(sw, p)))
        .collect();
    let c = PortClassifier::new();
    c.init(&tracked);
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);

    for cycle in 1..200u64 {
        let verdicts: HashMap<SwitchPort, Verdict> = tracked
            .iter()
            .map(|&p| {
                let v = match rng.gen_range(0..10) {
                    0..=1 => Verdict::Bad,
                    2 => Verdict::NoData,
                    _ => Verdict::Good,
                };
                (p, v)
            })
            .collect();

        c.abnormal_pass(cycle, &verdicts);
        c.normal_pass(cycle, 4, |p| p.port == PortNo(4));
        c.observation_pass(cycle, &verdicts, |_| 3);
        exactly_one_state(&c, &tracked);
    }

    // Skipped ports never entered verification
    for sw in 1..=3 {
        assert_eq!(c.state_of(&port(sw, 4)), Some(PortState::Normal));
    }
}

#[test]
fn test_verified_per_switch() {
    let c = PortClassifier::new();
    let tracked = vec![port(1, 1), port(1, 2), port(2, 1)];
    c.init(&tracked);
    c.normal_pass(1, 3, |_| false);
    c.observation_pass(2, &all(Verdict::Bad, &[port(1, 1)]), |_| 3);

    let counts = c.verified_per_switch();
    assert_eq!(counts[&SwitchId(1)], 2);
    assert_eq!(counts[&SwitchId(2)], 1);
}
