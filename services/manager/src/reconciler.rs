//! Desired-vs-actual plan computation.
//!
//! Given the complete desired instance set and the currently installed
//! instance records, computes the minimal set of per-instance transitions.
//! Execution (and its ordering rules) lives in the engine; this module is
//! deliberately pure so the decision table stays testable in isolation.

use std::collections::{HashMap, HashSet};

use axle_id::InstanceIdent;

use crate::model::{DesiredInstance, InstanceRecord};

/// A desired entry rejected because its version is older than the
/// installed one. Reported per instance; never aborts the reconcile.
#[derive(Debug, Clone)]
pub struct VersionRegression {
    pub ident: InstanceIdent,
    pub desired: u64,
    pub current: u64,
}

/// The computed transition plan.
#[derive(Debug, Default)]
pub struct Plan {
    /// Desired instances with no installed counterpart: install, then start.
    pub installs: Vec<DesiredInstance>,

    /// Installed instances whose desired version is newer: stop the old
    /// version, install the new one, start it.
    pub updates: Vec<(InstanceRecord, DesiredInstance)>,

    /// Installed instances matching the desired version: make sure they are
    /// running.
    pub ensure_running: Vec<(InstanceRecord, DesiredInstance)>,

    /// Installed instances absent from the desired set: stop and remove.
    pub stops: Vec<InstanceRecord>,

    /// Rejected desired entries (version regressions).
    pub rejected: Vec<VersionRegression>,
}

impl Plan {
    /// True when the reconcile has nothing to do.
    pub fn is_noop(&self) -> bool {
        self.installs.is_empty()
            && self.updates.is_empty()
            && self.stops.is_empty()
            && self.rejected.is_empty()
            && self.ensure_running.iter().all(|(record, _)| record.running)
    }

    /// Number of per-instance outcomes execution will produce.
    pub fn action_count(&self) -> usize {
        self.installs.len() + self.updates.len() + self.ensure_running.len() + self.stops.len()
    }
}

/// Computes the plan for one reconcile pass.
///
/// Every ident in `desired` ∪ `current` lands in exactly one plan bucket.
pub fn plan(desired: &[DesiredInstance], current: &[InstanceRecord]) -> Plan {
    let mut plan = Plan::default();

    let current_by_ident: HashMap<InstanceIdent, &InstanceRecord> =
        current.iter().map(|r| (r.ident(), r)).collect();

    let mut desired_idents: HashSet<&InstanceIdent> = HashSet::new();

    for entry in desired {
        desired_idents.insert(&entry.ident);

        match current_by_ident.get(&entry.ident) {
            None => plan.installs.push(entry.clone()),
            Some(record) => {
                if entry.version == record.version {
                    plan.ensure_running.push(((*record).clone(), entry.clone()));
                } else if entry.version > record.version {
                    plan.updates.push(((*record).clone(), entry.clone()));
                } else {
                    plan.rejected.push(VersionRegression {
                        ident: entry.ident.clone(),
                        desired: entry.version,
                        current: record.version,
                    });
                }
            }
        }
    }

    for record in current {
        if !desired_idents.contains(&record.ident()) {
            plan.stops.push(record.clone());
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use axle_id::{InstanceId, ServiceId, SubjectId};

    fn ident(service: &str, index: u32) -> InstanceIdent {
        InstanceIdent::new(
            ServiceId::new(service).unwrap(),
            SubjectId::new("subj").unwrap(),
            index,
        )
    }

    fn desired(service: &str, index: u32, version: u64) -> DesiredInstance {
        DesiredInstance {
            ident: ident(service, index),
            version,
            priority: 0,
            network: Default::default(),
            resources: vec![],
            labels: Default::default(),
        }
    }

    fn installed(service: &str, index: u32, version: u64, running: bool) -> InstanceRecord {
        let ident = ident(service, index);
        InstanceRecord {
            instance_id: InstanceId::new(),
            service_id: ident.service_id,
            subject_id: ident.subject_id,
            instance_index: ident.instance_index,
            version,
            unit_subject: true,
            running,
            uid: 5000,
            last_error: None,
        }
    }

    #[test]
    fn fresh_install() {
        let plan = plan(&[desired("a", 0, 1)], &[]);
        assert_eq!(plan.installs.len(), 1);
        assert_eq!(plan.action_count(), 1);
        assert!(!plan.is_noop());
    }

    #[test]
    fn same_version_ensures_running() {
        let plan = plan(&[desired("a", 0, 3)], &[installed("a", 0, 3, true)]);
        assert_eq!(plan.ensure_running.len(), 1);
        assert!(plan.installs.is_empty());
        assert!(plan.is_noop(), "a running instance at the right version is a no-op");
    }

    #[test]
    fn stopped_instance_at_right_version_is_not_noop() {
        let plan = plan(&[desired("a", 0, 3)], &[installed("a", 0, 3, false)]);
        assert_eq!(plan.ensure_running.len(), 1);
        assert!(!plan.is_noop());
    }

    #[test]
    fn newer_version_updates() {
        let plan = plan(&[desired("a", 0, 5)], &[installed("a", 0, 3, true)]);
        assert_eq!(plan.updates.len(), 1);
        let (record, entry) = &plan.updates[0];
        assert_eq!(record.version, 3);
        assert_eq!(entry.version, 5);
    }

    #[test]
    fn older_version_is_rejected_but_siblings_progress() {
        let plan = plan(
            &[desired("a", 0, 5), desired("b", 0, 3)],
            &[installed("b", 0, 7, true)],
        );

        assert_eq!(plan.installs.len(), 1);
        assert_eq!(plan.installs[0].ident.service_id.as_str(), "a");

        assert_eq!(plan.rejected.len(), 1);
        let regression = &plan.rejected[0];
        assert_eq!(regression.desired, 3);
        assert_eq!(regression.current, 7);

        // The rejected entry produces no action.
        assert_eq!(plan.action_count(), 1);
    }

    #[test]
    fn undesired_instances_stop() {
        let plan = plan(&[], &[installed("a", 0, 1, true), installed("a", 1, 1, true)]);
        assert_eq!(plan.stops.len(), 2);
    }

    #[test]
    fn mixed_plan_partitions_every_ident() {
        let current = vec![
            installed("keep", 0, 2, true),
            installed("update", 0, 1, true),
            installed("drop", 0, 1, true),
            installed("regress", 0, 9, true),
        ];
        let desired = vec![
            desired("keep", 0, 2),
            desired("update", 0, 2),
            desired("regress", 0, 1),
            desired("new", 0, 1),
        ];

        let plan = plan(&desired, &current);
        assert_eq!(plan.ensure_running.len(), 1);
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.stops.len(), 1);
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.installs.len(), 1);
    }

    #[test]
    fn replica_indexes_are_independent() {
        let plan = plan(
            &[desired("a", 0, 1), desired("a", 1, 1), desired("a", 2, 1)],
            &[installed("a", 0, 1, true)],
        );
        assert_eq!(plan.installs.len(), 2);
        assert_eq!(plan.ensure_running.len(), 1);
    }
}
