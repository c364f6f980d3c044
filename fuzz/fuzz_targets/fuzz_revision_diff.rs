//! Fuzz target for the reconciliation diff.
//!
//! `revision_diff` and `missing_keys` must never panic and never report a
//! key the compared side does not contain.

#![no_main]

use cqrs_replication::envelope::InstanceKey;
use cqrs_replication::reconcile::{missing_keys, revision_diff};
use libfuzzer_sys::fuzz_target;
use std::collections::{HashMap, HashSet};

fuzz_target!(|data: (Vec<(i64, i64)>, Vec<(i64, i64)>)| {
    let (master, replica) = data;

    let master: Vec<(InstanceKey, i64)> = master.into_iter().map(|(k, r)| (InstanceKey::Int(k), r)).collect();
    let replica: HashMap<InstanceKey, i64> = replica.into_iter().map(|(k, r)| (InstanceKey::Int(k), r)).collect();

    let diverged = revision_diff(&master, &replica);
    assert!(diverged.len() <= master.len());

    let replica_keys: Vec<InstanceKey> = replica.keys().cloned().collect();
    let existing: HashSet<InstanceKey> = master.iter().map(|(k, _)| k.clone()).collect();
    for key in missing_keys(&replica_keys, &existing) {
        assert!(replica.contains_key(&key));
        assert!(!existing.contains(&key));
    }
});
