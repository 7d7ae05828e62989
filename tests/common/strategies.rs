use proptest::prelude::*;

use nomad_core::state_machine::{is_valid_transition, TaskStatus};

pub fn status_strategy() -> impl Strategy<Value = TaskStatus> {
    proptest::sample::select(TaskStatus::ALL.to_vec())
}

/// Pairs that are not in the allowed-edge table
pub fn invalid_pair_strategy() -> impl Strategy<Value = (TaskStatus, TaskStatus)> {
    (status_strategy(), status_strategy())
        .prop_filter("edge must be disallowed", |(from, to)| {
            !is_valid_transition(*from, *to)
        })
}

pub fn valid_pair_strategy() -> impl Strategy<Value = (TaskStatus, TaskStatus)> {
    (status_strategy(), status_strategy())
        .prop_filter("edge must be allowed", |(from, to)| is_valid_transition(*from, *to))
}
