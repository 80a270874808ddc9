use drift_core::state_machine::{allowed_transitions, validate_transition, Phase};
use proptest::prelude::*;

fn any_phase() -> impl Strategy<Value = Phase> {
    prop_oneof![
        Just(Phase::Building),
        Just(Phase::Diffing),
        Just(Phase::Applying),
        Just(Phase::Restarting),
        Just(Phase::Verifying),
        Just(Phase::Converged),
        Just(Phase::PartiallyApplied),
        Just(Phase::Failed),
    ]
}

#[test]
fn test_building_transitions() {
    assert!(validate_transition(Phase::Building, Phase::Diffing).is_ok());
    assert!(validate_transition(Phase::Building, Phase::Failed).is_ok());

    // Nothing is applied before diffing
    assert!(validate_transition(Phase::Building, Phase::PartiallyApplied).is_err());
    assert!(validate_transition(Phase::Building, Phase::Converged).is_err());
}

#[test]
fn test_post_write_phases_never_fail() {
    for from in [Phase::Restarting, Phase::Verifying] {
        assert!(validate_transition(from, Phase::Failed).is_err());
        assert!(validate_transition(from, Phase::PartiallyApplied).is_ok());
    }
}

proptest! {
    #[test]
    fn prop_validator_agrees_with_table(from in any_phase(), to in any_phase()) {
        let res = validate_transition(from, to);
        let allowed = allowed_transitions(from);

        if res.is_ok() {
            prop_assert!(allowed.contains(&to));
        } else {
            prop_assert!(!allowed.contains(&to));
        }
    }

    #[test]
    fn prop_terminal_phases_are_never_left(from in any_phase(), to in any_phase()) {
        if from.is_terminal() {
            prop_assert!(validate_transition(from, to).is_err());
        }
    }
}
