//! Reboot sequencing and rolling reboot tests against the simulated device.

use ab_torture::mock::{MockDevice, Power};
use ab_torture::rolling::VAR_ERROR_FLAG_COMMAND;
use ab_torture::{
    Config, Error, Harness, RebootOrchestrator, RebootPhase, Rebootable, ReachabilityMonitor,
    RemoteSession, RollingConfig, RollingReboot, SessionManager, SlotId,
};
use std::time::Duration;

fn harness(config: &Config, device: &MockDevice) -> Harness {
    Harness::new(config, Box::new(device.clone()), Box::new(device.clone()))
}

// ============================================================================
// Session + Reboot
// ============================================================================

#[test]
fn test_session_verify_fails_while_device_is_down() {
    let config = Config::test_mode();
    let device = MockDevice::new();
    let mut session =
        SessionManager::new(config.target.clone(), &config.timing, Box::new(device.clone()));

    session.verify(Duration::from_secs(5)).unwrap();
    device.state_mut().power = Power::Down(3);

    let err = session.verify(Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, Error::Connection { .. }));
    assert!(err.is_recoverable());
    assert!(!session.is_connected());
}

#[test]
fn test_orchestrator_walks_every_phase() {
    let config = Config::test_mode();
    let device = MockDevice::new();
    {
        let mut state = device.state_mut();
        state.shutdown_polls = 2;
        state.down_polls = 4;
        state.refuse_after_boot = 2;
    }
    let mut session =
        SessionManager::new(config.target.clone(), &config.timing, Box::new(device.clone()));
    let monitor = ReachabilityMonitor::new(
        Box::new(device.clone()),
        config.timing.poll_interval,
        None,
    );
    let mut orchestrator = RebootOrchestrator::new(monitor, &config.timing, false);

    orchestrator.reboot(&mut session).unwrap();

    assert_eq!(orchestrator.phase(), RebootPhase::Confirmed);
    assert_eq!(orchestrator.reboots(), 1);
    // 2 pings while shutting down + 1 going dark, then 4 silent + 1 back
    assert_eq!(orchestrator.monitor().pings(), 8);
    assert_eq!(device.state().boot_count, 1);
    // 3 liveness checks after two refused connects
    assert_eq!(device.count_commands("echo connection test"), 3);
}

#[test]
fn test_reboot_wait_gives_up_with_max_wait() {
    let mut config = Config::test_mode();
    config.timing.max_wait = Some(Duration::ZERO);
    let device = MockDevice::new();
    device.state_mut().shutdown_polls = u32::MAX;
    let mut harness = harness(&config, &device);

    let err = harness.reboot().unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }));
}

// ============================================================================
// Rolling Reboots
// ============================================================================

#[test]
fn test_rolling_reboot_keeps_slot() {
    let config = Config::test_mode();
    let device = MockDevice::on_slot(SlotId::B);
    let mut harness = harness(&config, &device);

    let report = RollingReboot::new(RollingConfig {
        num_reboots: 5,
        check_slot: true,
        check_var_error_flag: true,
    })
    .run(&mut harness)
    .unwrap();

    assert_eq!(report.reboots, 5);
    assert_eq!(report.slot, Some(SlotId::B));
    assert_eq!(device.state().reboots, 5);
    assert_eq!(device.count_commands(VAR_ERROR_FLAG_COMMAND), 5);
}

#[test]
fn test_rolling_reboot_stops_on_var_error_flag() {
    let config = Config::test_mode();
    let device = MockDevice::new();
    device.state_mut().var_error_flag_clear = false;
    let mut harness = harness(&config, &device);

    let err = RollingReboot::new(RollingConfig {
        num_reboots: 5,
        check_slot: false,
        check_var_error_flag: true,
    })
    .run(&mut harness)
    .unwrap_err();

    assert!(matches!(err, Error::CommandFailed { .. }));
    assert_eq!(device.state().reboots, 0);
}

#[test]
fn test_rolling_reboot_detects_slot_switch() {
    let config = Config::test_mode();
    let device = MockDevice::new();
    device.state_mut().pending_active = Some(SlotId::B);
    let mut harness = harness(&config, &device);

    let err = RollingReboot::new(RollingConfig {
        num_reboots: 3,
        check_slot: true,
        check_var_error_flag: false,
    })
    .run(&mut harness)
    .unwrap_err();

    assert_eq!(err.code(), "E_ASSERT_SLOT_CHANGED");
    assert_eq!(device.state().reboots, 1);
}

#[test]
fn test_rolling_reboot_without_slot_check_ignores_switch() {
    let config = Config::test_mode();
    let device = MockDevice::new();
    device.state_mut().pending_active = Some(SlotId::B);
    let mut harness = harness(&config, &device);

    let report = RollingReboot::new(RollingConfig {
        num_reboots: 2,
        ..RollingConfig::default()
    })
    .run(&mut harness)
    .unwrap();

    assert_eq!(report.slot, None);
    assert_eq!(device.state().slot_index, 1);
}
