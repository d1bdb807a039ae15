//! Guided recovery scenario tests
//!
//! The operator is replaced by a stand-in that cuts the simulated device's
//! power when prompted.

use ab_torture::mock::{MockDevice, PowerCycleOperator};
use ab_torture::recovery::{MAX_FORCED_CLEARS, POWER_INTERRUPT_PROMPT};
use ab_torture::{
    Bootability, Config, Error, Harness, InvariantViolation, Operator, RecoveryScenarios, Result,
    SlotId,
};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use tempfile::NamedTempFile;

fn test_config() -> (Config, NamedTempFile) {
    let mut payload = NamedTempFile::new().unwrap();
    payload.write_all(b"capsule payload").unwrap();
    payload.flush().unwrap();

    let mut config = Config::test_mode();
    config.update.update_file = Some(payload.path().to_path_buf());
    (config, payload)
}

fn harness(config: &Config, device: &MockDevice) -> Harness {
    Harness::new(config, Box::new(device.clone()), Box::new(device.clone()))
}

/// Operator that records prompts and then cuts power
struct SharedOperator {
    inner: PowerCycleOperator,
    prompts: Rc<RefCell<Vec<String>>>,
}

impl Operator for SharedOperator {
    fn confirm(&mut self, prompt: &str) -> Result<()> {
        self.prompts.borrow_mut().push(prompt.to_string());
        self.inner.confirm(prompt)
    }
}

fn scenarios(device: &MockDevice) -> (RecoveryScenarios, Rc<RefCell<Vec<String>>>) {
    let prompts = Rc::new(RefCell::new(Vec::new()));
    let operator = SharedOperator {
        inner: PowerCycleOperator::new(device.clone()),
        prompts: prompts.clone(),
    };
    (RecoveryScenarios::new(Box::new(operator)), prompts)
}

/// Operator who confirms without touching the hardware
struct AbsentOperator;

impl Operator for AbsentOperator {
    fn confirm(&mut self, _prompt: &str) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Power Interruption
// ============================================================================

#[test]
fn test_power_interruption_recovery() {
    let (config, _payload) = test_config();
    let device = MockDevice::on_slot(SlotId::A);
    let mut harness = harness(&config, &device);
    let (mut scenarios, prompts) = scenarios(&device);

    let report = scenarios.power_interruption(&mut harness).unwrap();

    assert_eq!(report.forced_clears, 0);
    assert_eq!(report.interrupted_slot, SlotId::A);
    assert_eq!(report.final_slot, SlotId::B);
    assert_eq!(prompts.borrow().as_slice(), [POWER_INTERRUPT_PROMPT]);

    let target = &report.interrupted_target;
    assert_eq!(target.slot, SlotId::B);
    assert_eq!(target.root_device, "/dev/mmcblk0p2");
    assert_eq!(target.bootability, Bootability::Unbootable);
    assert!(target.capsule_forced);

    let state = device.state();
    assert_eq!(state.bootability, [Bootability::Normal; 2]);
    assert!(!state.capsule_forced);
    assert_eq!(state.capsule_status, Some(1));
    assert_eq!(state.reboots, 2);
}

#[test]
fn test_interrupted_update_leaves_target_unbootable() {
    let (config, _payload) = test_config();
    let device = MockDevice::new();
    let mut harness = harness(&config, &device);
    let (mut scenarios, _prompts) = scenarios(&device);

    let slot = scenarios.interrupted_update(&mut harness).unwrap();

    assert_eq!(slot, SlotId::A);
    assert_eq!(
        harness.slots.slot_bootability(harness.session.as_mut()).unwrap(),
        [Bootability::Normal, Bootability::Unbootable]
    );
    assert!(harness
        .slots
        .is_capsule_update_forced(harness.session.as_mut())
        .unwrap());
}

#[test]
fn test_power_interruption_clears_prior_forced_capsule() {
    let (config, _payload) = test_config();
    let device = MockDevice::new();
    device.state_mut().capsule_forced = true;
    let mut harness = harness(&config, &device);
    let (mut scenarios, _prompts) = scenarios(&device);

    let report = scenarios.power_interruption(&mut harness).unwrap();

    assert_eq!(report.forced_clears, 1);
    // clearing update moved to B, the interruption kept it there
    assert_eq!(report.interrupted_slot, SlotId::B);
    assert_eq!(report.final_slot, SlotId::A);
}

#[test]
fn test_forced_capsule_that_never_clears_is_protocol_violation() {
    let (config, _payload) = test_config();
    let device = MockDevice::new();
    {
        let mut state = device.state_mut();
        state.capsule_forced = true;
        state.capsule_stuck = true;
    }
    let mut harness = harness(&config, &device);
    let (mut scenarios, prompts) = scenarios(&device);

    let err = scenarios.power_interruption(&mut harness).unwrap_err();

    assert!(matches!(err, Error::Protocol(_)));
    assert_eq!(device.state().uploads, MAX_FORCED_CLEARS);
    assert!(prompts.borrow().is_empty());
}

#[test]
fn test_missed_power_interruption_is_assertion() {
    let (config, _payload) = test_config();
    let device = MockDevice::new();
    let mut harness = harness(&config, &device);
    let mut scenarios = RecoveryScenarios::new(Box::new(AbsentOperator));

    let err = scenarios.power_interruption(&mut harness).unwrap_err();

    match err {
        Error::Assertion(InvariantViolation::SlotChangedDuringRecovery { before, after, .. }) => {
            assert_eq!(before, SlotId::A);
            assert_eq!(after, SlotId::B);
        }
        other => panic!("unexpected error: {other}"),
    }
}

// ============================================================================
// Unbootable Slot
// ============================================================================

#[test]
fn test_unbootable_slot_recovery() {
    let (config, _payload) = test_config();
    let device = MockDevice::on_slot(SlotId::B);
    let mut harness = harness(&config, &device);
    let (mut scenarios, prompts) = scenarios(&device);

    let report = scenarios.unbootable_slot(&mut harness).unwrap();

    assert_eq!(report.interrupted_slot, SlotId::B);
    assert_eq!(report.final_slot, SlotId::A);
    assert_eq!(prompts.borrow().len(), 1);
    assert_eq!(device.count_commands("nvbootctrl set-active-boot-slot 0"), 1);
    assert_eq!(report.interrupted_target.slot, SlotId::A);
    assert_eq!(report.interrupted_target.root_device, "/dev/mmcblk0p1");
    assert_eq!(report.interrupted_target.bootability, Bootability::Unbootable);

    let state = device.state();
    assert_eq!(state.bootability, [Bootability::Normal; 2]);
    assert!(!state.capsule_forced);
    // interrupted boot, refused switch, recovery update
    assert_eq!(state.reboots, 3);
}

#[test]
fn test_unbootable_slot_recovery_requires_forced_flag_cleared() {
    let (config, _payload) = test_config();
    let device = MockDevice::new();
    device.state_mut().capsule_stuck = true;
    let mut harness = harness(&config, &device);
    let (mut scenarios, _prompts) = scenarios(&device);

    let err = scenarios.unbootable_slot(&mut harness).unwrap_err();

    assert!(matches!(
        err,
        Error::Assertion(InvariantViolation::CapsuleStillForced)
    ));
    // the recovery update itself went through
    assert_eq!(device.state().slot_index, 1);
}
