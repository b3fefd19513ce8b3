//! Full adaptive scenario: degrade, fail, ban, recover, upgrade.

use livecast_abr::{AbrConfig, AbrEngine, ControllerState, Level, SwitchReason, TickSample};
use std::time::{Duration, Instant};

fn level_table() -> Vec<Level> {
    vec![
        Level::new("high", 0),
        Level::new("medium", 1500),
        Level::new("low", 500),
        Level::audio("audio", 64),
    ]
}

fn lossy(tick: u64) -> TickSample {
    TickSample {
        rtt_ms: Some(60.0),
        packets_lost: tick * 15,
        packets_received: tick * 85,
        bytes_received: tick * 300_000,
        frames_decoded: Some(tick * 30),
    }
}

fn healthy(tick: u64) -> TickSample {
    TickSample {
        rtt_ms: Some(40.0),
        packets_lost: 0,
        packets_received: tick * 100,
        bytes_received: tick * 300_000,
        frames_decoded: Some(tick * 30),
    }
}

#[test]
fn test_degrade_fail_ban_recover_upgrade() {
    let t0 = Instant::now();
    let mut engine = AbrEngine::new(level_table(), 0, AbrConfig::default());

    // initial connect on the top layer
    engine.begin_initial(0);
    engine.on_connect_success(t0);
    assert_eq!(engine.state(), ControllerState::Running);

    // loss triggers are active from tick 1 even inside the honeymoon, so
    // 15% loss fires on the 4th tick
    let mut decision = None;
    for tick in 1..=4u64 {
        decision = engine.on_tick(lossy(tick), t0 + Duration::from_secs(tick));
    }
    let decision = decision.expect("downgrade must fire on the 4th lossy tick");
    assert_eq!(decision.target, 1, "first downgrade goes to medium");
    assert_eq!(decision.reason, SwitchReason::Downgrade);

    // the connect to medium fails: banned for 30 s with failure count 1,
    // and the downgrade intent falls through to low
    let t_fail = t0 + Duration::from_secs(5);
    let fallback = engine.on_switch_failure(t_fail);
    assert_eq!(fallback, Some(2));
    assert_eq!(engine.penalties().failure_count(1), 1);
    assert!(engine.penalties().is_banned(1, t_fail));
    assert!(engine
        .penalties()
        .is_banned(1, t_fail + Duration::from_secs(29)));
    assert!(!engine
        .penalties()
        .is_banned(1, t_fail + Duration::from_secs(31)));

    // low connects; the controller is running again
    engine.on_connect_success(t_fail);
    assert_eq!(engine.current_index(), 2);

    // while medium is banned the controller never upgrades into it
    let mut tick = 0u64;
    for s in 10..34u64 {
        tick += 1;
        assert!(
            engine
                .on_tick(healthy(tick), t0 + Duration::from_secs(s))
                .is_none(),
            "auto-switched into a banned level at t0+{s}"
        );
    }

    // ban expired: eight consecutive healthy ticks upgrade to medium
    let mut upgrade = None;
    for s in 37..70u64 {
        tick += 1;
        if let Some(d) = engine.on_tick(healthy(tick), t0 + Duration::from_secs(s)) {
            upgrade = Some(d);
            break;
        }
    }
    let upgrade = upgrade.expect("upgrade never fired after ban expiry");
    assert_eq!(upgrade.target, 1);
    assert_eq!(upgrade.reason, SwitchReason::Upgrade);

    engine.on_connect_success(t0 + Duration::from_secs(70));
    assert_eq!(engine.current_index(), 1);
    assert_eq!(engine.state(), ControllerState::Running);
}

#[test]
fn test_closed_engine_emits_nothing() {
    let mut engine = AbrEngine::new(level_table(), 0, AbrConfig::default());
    engine.begin_initial(0);
    engine.on_connect_success(Instant::now());
    engine.on_closed();
    assert_eq!(engine.state(), ControllerState::Closed);
    assert!(engine
        .on_tick(healthy(1), Instant::now() + Duration::from_secs(60))
        .is_none());
}
