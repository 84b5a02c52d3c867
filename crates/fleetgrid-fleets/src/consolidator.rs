//! Consolidator — the pure decision of one fleet consolidation cycle.
//!
//! Takes a fleet, its instances, and the moment of evaluation; returns the
//! updates to commit. Nothing here touches the store, so every branch is
//! testable with plain values.

use fleetgrid_state::{
    Fleet, FleetStatus, FleetUpdate, FleetMode, Instance, InstanceId, InstanceStatus,
    InstanceUpdate,
};

use crate::error::FleetError;

/// Back-off steps (ms) after 1, 2, 3, 4, and 5+ consecutive changing cycles.
pub const RETRY_DELAYS_MS: [u64; 5] = [30_000, 60_000, 120_000, 300_000, 600_000];

pub const TOO_MANY_INSTANCES: &str = "too many instances";

/// Minimum wait (ms) before the next consolidation after `attempt`
/// consecutive cycles that required a change.
pub fn retry_delay(attempt: u32) -> u64 {
    if attempt == 0 {
        return 0;
    }
    let step = (attempt as usize - 1).min(RETRY_DELAYS_MS.len() - 1);
    RETRY_DELAYS_MS[step]
}

/// Inputs of a cycle besides the fleet and its instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetContext {
    pub now: u64,
    /// Unfinished jobs placed in the fleet.
    pub active_jobs: usize,
    pub project_deleted: bool,
}

/// Why a fleet was not consolidated this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Terminating,
    /// No `nodes` range configured.
    Unsized,
    Autocreated,
    /// SSH fleets are sized by their host list, not by provisioning.
    SshMode,
    BackingOff { ready_at: u64 },
    InvalidSpec,
}

/// What a consolidation pass wants done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationPlan {
    /// TERMINATED instances to soft-delete.
    pub reap: Vec<InstanceId>,
    pub new_instances_count: u32,
    /// IDLE instances to mark TERMINATING.
    pub terminate: Vec<InstanceId>,
    /// Instances above `nodes.max`, whether or not any could be terminated.
    pub surplus: u32,
}

impl ConsolidationPlan {
    /// The fleet was out of range. Reaping alone does not count.
    pub fn changed(&self) -> bool {
        self.new_instances_count > 0 || self.surplus > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consolidation {
    Skipped(SkipReason),
    Planned(ConsolidationPlan),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteReason {
    ProjectDeleted,
    /// No jobs and no instances left.
    Empty,
    InvalidSpec(String),
}

impl DeleteReason {
    pub fn message(&self) -> String {
        match self {
            DeleteReason::ProjectDeleted => "project deleted".to_string(),
            DeleteReason::Empty => "fleet is empty".to_string(),
            DeleteReason::InvalidSpec(msg) => {
                FleetError::ConfigurationInconsistency(msg.clone()).to_string()
            }
        }
    }
}

/// Everything one cycle commits.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutcome {
    pub consolidation: Consolidation,
    pub delete: Option<DeleteReason>,
    pub fleet: FleetUpdate,
    pub instances: Vec<(InstanceId, InstanceUpdate)>,
    pub new_instances_count: u32,
}

/// Decide one cycle for `fleet`.
///
/// Auto-deletion is judged against the fleet as it will look after this
/// cycle's consolidation, so a fleet that is about to grow is never empty.
pub fn evaluate(fleet: &Fleet, instances: &[Instance], ctx: FleetContext) -> CycleOutcome {
    if let Err(msg) = fleet.spec.validate() {
        return teardown(instances, DeleteReason::InvalidSpec(msg), SkipReason::InvalidSpec);
    }
    if ctx.project_deleted {
        let skip = skip_reason(fleet, ctx.now).unwrap_or(SkipReason::Terminating);
        return teardown(instances, DeleteReason::ProjectDeleted, skip);
    }

    let consolidation = match skip_reason(fleet, ctx.now) {
        Some(reason) => Consolidation::Skipped(reason),
        None => Consolidation::Planned(plan(fleet, instances)),
    };

    let mut update = FleetUpdate::default();
    let mut instance_updates = Vec::new();
    let mut new_instances_count = 0;
    let reap = match &consolidation {
        Consolidation::Planned(plan) => {
            update.last_consolidated_at = Some(ctx.now);
            update.consolidation_attempt = Some(if plan.changed() {
                fleet.consolidation_attempt.saturating_add(1)
            } else {
                0
            });
            new_instances_count = plan.new_instances_count;
            instance_updates.extend(
                plan.terminate
                    .iter()
                    .map(|id| (id.clone(), InstanceUpdate::terminating(TOO_MANY_INSTANCES))),
            );
            plan.reap.clone()
        }
        // A fleet that is not consolidated still sheds its dead instances.
        Consolidation::Skipped(_) => reapable(instances),
    };
    instance_updates.extend(reap.iter().map(|id| (id.clone(), InstanceUpdate::deleted())));

    let remaining = instances
        .iter()
        .filter(|i| !i.deleted && !reap.contains(&i.id))
        .count()
        + new_instances_count as usize;
    let delete = empty_fleet_deletable(fleet, remaining, ctx.active_jobs);
    if delete {
        mark_deleted(&mut update, &DeleteReason::Empty);
    }

    CycleOutcome {
        consolidation,
        delete: delete.then_some(DeleteReason::Empty),
        fleet: update,
        instances: instance_updates,
        new_instances_count,
    }
}

fn skip_reason(fleet: &Fleet, now: u64) -> Option<SkipReason> {
    if fleet.status != FleetStatus::Active {
        return Some(SkipReason::Terminating);
    }
    if fleet.spec.nodes.is_none() {
        return Some(SkipReason::Unsized);
    }
    if fleet.spec.autocreated {
        return Some(SkipReason::Autocreated);
    }
    if fleet.spec.mode == FleetMode::Ssh {
        return Some(SkipReason::SshMode);
    }
    let reference = fleet.last_consolidated_at.or(fleet.last_processed_at)?;
    let ready_at = reference.saturating_add(retry_delay(fleet.consolidation_attempt));
    (now < ready_at).then_some(SkipReason::BackingOff { ready_at })
}

/// Reap, then grow to `min` or shrink to `max`. Never both in one cycle.
pub fn plan(fleet: &Fleet, instances: &[Instance]) -> ConsolidationPlan {
    let reap = reapable(instances);
    let active: Vec<&Instance> = instances.iter().filter(|i| i.is_active()).collect();

    let min = fleet.spec.min_nodes() as usize;
    if active.len() < min {
        return ConsolidationPlan {
            reap,
            new_instances_count: (min - active.len()) as u32,
            terminate: Vec::new(),
            surplus: 0,
        };
    }

    let mut terminate = Vec::new();
    let mut surplus = 0;
    if let Some(max) = fleet.spec.max_nodes() {
        // Instances already on their way out are not surplus twice.
        let staying = active
            .iter()
            .filter(|i| i.status != InstanceStatus::Terminating)
            .count();
        surplus = staying.saturating_sub(max as usize);
        if surplus > 0 {
            let mut idle: Vec<&Instance> = active
                .iter()
                .copied()
                .filter(|i| i.status == InstanceStatus::Idle)
                .collect();
            // Youngest first.
            idle.sort_by(|a, b| b.instance_num.cmp(&a.instance_num).then_with(|| a.id.cmp(&b.id)));
            terminate = idle.into_iter().take(surplus).map(|i| i.id.clone()).collect();
        }
    }

    ConsolidationPlan {
        reap,
        new_instances_count: 0,
        terminate,
        surplus: surplus as u32,
    }
}

fn reapable(instances: &[Instance]) -> Vec<InstanceId> {
    instances
        .iter()
        .filter(|i| i.status == InstanceStatus::Terminated && !i.deleted)
        .map(|i| i.id.clone())
        .collect()
}

fn empty_fleet_deletable(fleet: &Fleet, remaining_instances: usize, active_jobs: usize) -> bool {
    if active_jobs > 0 || remaining_instances > 0 {
        return false;
    }
    let allows_zero = fleet.spec.nodes.is_some_and(|n| n.min == 0);
    fleet.status != FleetStatus::Active || !allows_zero
}

/// Send every live instance to termination and reap the dead ones. The
/// fleet stays TERMINATING until a cycle finds nothing left, then is deleted.
fn teardown(instances: &[Instance], reason: DeleteReason, skip: SkipReason) -> CycleOutcome {
    let termination = reason.message();
    let mut remaining = 0;
    let mut updates = Vec::new();
    for inst in instances.iter().filter(|i| !i.deleted) {
        match inst.status {
            InstanceStatus::Terminated => updates.push((inst.id.clone(), InstanceUpdate::deleted())),
            InstanceStatus::Terminating => remaining += 1,
            _ => {
                remaining += 1;
                updates.push((inst.id.clone(), InstanceUpdate::terminating(&termination)));
            }
        }
    }

    let mut update = FleetUpdate::default();
    let delete = if remaining == 0 {
        mark_deleted(&mut update, &reason);
        Some(reason)
    } else {
        update.status = Some(FleetStatus::Terminating);
        update.status_message = Some(Some(termination));
        None
    };
    CycleOutcome {
        consolidation: Consolidation::Skipped(skip),
        delete,
        fleet: update,
        instances: updates,
        new_instances_count: 0,
    }
}

fn mark_deleted(update: &mut FleetUpdate, reason: &DeleteReason) {
    update.status = Some(FleetStatus::Terminated);
    update.status_message = Some(Some(reason.message()));
    update.deleted = Some(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetgrid_state::{Blocks, FleetNodes, FleetSpec};
    use proptest::prelude::*;

    const T0: u64 = 1_700_000_000_000;

    fn ctx(now: u64) -> FleetContext {
        FleetContext {
            now,
            active_jobs: 0,
            project_deleted: false,
        }
    }

    fn fleet(min: u32, max: Option<u32>) -> Fleet {
        Fleet::new(
            "f-1",
            "gpu",
            "main",
            FleetSpec {
                nodes: Some(FleetNodes { min, max }),
                ..Default::default()
            },
            T0,
        )
    }

    fn instance(num: u32, status: InstanceStatus) -> Instance {
        let mut inst = Instance::pending(&format!("i-{num}"), "main", Some("f-1"), None, T0);
        inst.instance_num = num;
        inst.status = status;
        inst.total_blocks = Some(1);
        inst
    }

    #[test]
    fn retry_delay_steps_and_caps() {
        assert_eq!(retry_delay(0), 0);
        assert_eq!(retry_delay(1), 30_000);
        assert_eq!(retry_delay(2), 60_000);
        assert_eq!(retry_delay(3), 120_000);
        assert_eq!(retry_delay(4), 300_000);
        assert_eq!(retry_delay(5), 600_000);
        assert_eq!(retry_delay(50), 600_000);
    }

    #[test]
    fn grow_then_back_off_then_settle() {
        let mut f = fleet(1, Some(3));

        // Cycle 1: nothing running, one instance missing.
        let out = evaluate(&f, &[], ctx(T0));
        let Consolidation::Planned(plan) = &out.consolidation else {
            panic!("expected a plan, got {:?}", out.consolidation);
        };
        assert_eq!(plan.new_instances_count, 1);
        assert_eq!(out.new_instances_count, 1);
        assert_eq!(out.fleet.consolidation_attempt, Some(1));
        assert!(out.delete.is_none());
        out.fleet.apply(&mut f);
        f.last_processed_at = Some(T0);
        let instances = vec![instance(0, InstanceStatus::Pending)];

        // Cycle 2, right away: backing off.
        let out = evaluate(&f, &instances, ctx(T0 + 1_000));
        assert_eq!(
            out.consolidation,
            Consolidation::Skipped(SkipReason::BackingOff {
                ready_at: T0 + 30_000
            })
        );
        assert_eq!(out.fleet, FleetUpdate::default());
        out.fleet.apply(&mut f);
        f.last_processed_at = Some(T0 + 1_000);

        // Cycle 3, 30s after the growth: in range, attempt resets.
        let out = evaluate(&f, &instances, ctx(T0 + 30_000));
        assert_eq!(out.consolidation, Consolidation::Planned(ConsolidationPlan::default()));
        assert_eq!(out.fleet.consolidation_attempt, Some(0));
        assert_eq!(out.new_instances_count, 0);
    }

    #[test]
    fn shrink_terminates_only_idle() {
        let f = fleet(0, Some(2));
        let instances = vec![
            instance(0, InstanceStatus::Busy),
            instance(1, InstanceStatus::Idle),
            instance(2, InstanceStatus::Busy),
        ];
        let out = evaluate(&f, &instances, ctx(T0));
        assert_eq!(out.instances.len(), 1);
        let (id, update) = &out.instances[0];
        assert_eq!(id, "i-1");
        assert_eq!(update.status, Some(InstanceStatus::Terminating));
        assert_eq!(
            update.termination_reason,
            Some(Some(TOO_MANY_INSTANCES.to_string()))
        );
        assert_eq!(out.fleet.consolidation_attempt, Some(1));
    }

    #[test]
    fn busy_surplus_keeps_backing_off() {
        let mut f = fleet(0, Some(1));
        f.consolidation_attempt = 3;
        let instances = vec![
            instance(0, InstanceStatus::Busy),
            instance(1, InstanceStatus::Busy),
            instance(2, InstanceStatus::Busy),
        ];
        let out = evaluate(&f, &instances, ctx(T0));
        let Consolidation::Planned(plan) = &out.consolidation else {
            panic!("expected a plan, got {:?}", out.consolidation);
        };
        assert!(plan.terminate.is_empty());
        assert_eq!(plan.surplus, 2);
        assert!(plan.changed());
        assert!(out.instances.is_empty());
        assert_eq!(out.fleet.consolidation_attempt, Some(4));
    }

    #[test]
    fn shrink_picks_youngest_idle_first() {
        let f = fleet(1, Some(1));
        let instances = vec![
            instance(0, InstanceStatus::Idle),
            instance(1, InstanceStatus::Idle),
            instance(2, InstanceStatus::Idle),
        ];
        let plan = plan(&f, &instances);
        assert_eq!(plan.terminate, ["i-2", "i-1"]);
    }

    #[test]
    fn terminating_instances_are_not_surplus_twice() {
        let f = fleet(0, Some(2));
        let instances = vec![
            instance(0, InstanceStatus::Idle),
            instance(1, InstanceStatus::Idle),
            instance(2, InstanceStatus::Terminating),
        ];
        assert!(!plan(&f, &instances).changed());
    }

    #[test]
    fn growth_takes_priority_over_shrink() {
        let f = fleet(3, Some(3));
        let instances = vec![
            instance(0, InstanceStatus::Idle),
            instance(1, InstanceStatus::Terminated),
        ];
        let plan = plan(&f, &instances);
        assert_eq!(plan.new_instances_count, 2);
        assert!(plan.terminate.is_empty());
        assert_eq!(plan.reap, ["i-1"]);
    }

    #[test]
    fn reaping_alone_resets_attempt() {
        let mut f = fleet(1, Some(2));
        f.consolidation_attempt = 3;
        let instances = vec![
            instance(0, InstanceStatus::Idle),
            instance(1, InstanceStatus::Terminated),
        ];
        let out = evaluate(&f, &instances, ctx(T0));
        assert_eq!(out.fleet.consolidation_attempt, Some(0));
        assert_eq!(out.instances, vec![("i-1".to_string(), InstanceUpdate::deleted())]);
    }

    #[test]
    fn skip_reasons() {
        let mut f = fleet(1, None);
        f.spec.nodes = None;
        assert_eq!(
            evaluate(&f, &[instance(0, InstanceStatus::Idle)], ctx(T0)).consolidation,
            Consolidation::Skipped(SkipReason::Unsized)
        );

        let mut f = fleet(1, None);
        f.spec.autocreated = true;
        assert_eq!(
            evaluate(&f, &[instance(0, InstanceStatus::Idle)], ctx(T0)).consolidation,
            Consolidation::Skipped(SkipReason::Autocreated)
        );

        let mut f = fleet(1, None);
        f.spec.mode = FleetMode::Ssh;
        assert_eq!(
            evaluate(&f, &[], ctx(T0)).consolidation,
            Consolidation::Skipped(SkipReason::SshMode)
        );
    }

    #[test]
    fn terminating_fleet_reaps_then_deletes_when_empty() {
        let mut f = fleet(2, Some(4));
        f.status = FleetStatus::Terminating;

        let instances = vec![
            instance(0, InstanceStatus::Terminated),
            instance(1, InstanceStatus::Terminating),
        ];
        let out = evaluate(&f, &instances, ctx(T0));
        assert_eq!(out.consolidation, Consolidation::Skipped(SkipReason::Terminating));
        assert_eq!(out.instances, vec![("i-0".to_string(), InstanceUpdate::deleted())]);
        assert!(out.delete.is_none());

        let instances = vec![instance(1, InstanceStatus::Terminated)];
        let out = evaluate(&f, &instances, ctx(T0));
        assert_eq!(out.delete, Some(DeleteReason::Empty));
        assert_eq!(out.fleet.status, Some(FleetStatus::Terminated));
        assert_eq!(out.fleet.deleted, Some(true));
    }

    #[test]
    fn empty_fleet_allowing_zero_nodes_is_kept() {
        let f = fleet(0, Some(2));
        let out = evaluate(&f, &[], ctx(T0));
        assert!(out.delete.is_none());
        assert_eq!(out.fleet.deleted, None);
    }

    #[test]
    fn empty_run_fleet_is_deleted_unless_in_use() {
        let mut f = fleet(0, None);
        f.spec.nodes = None;
        f.spec.autocreated = true;

        let out = evaluate(&f, &[], ctx(T0));
        assert_eq!(out.delete, Some(DeleteReason::Empty));

        let busy = FleetContext {
            active_jobs: 1,
            ..ctx(T0)
        };
        assert!(evaluate(&f, &[], busy).delete.is_none());
    }

    #[test]
    fn project_deletion_tears_fleet_down() {
        let f = fleet(1, Some(3));
        let instances = vec![
            instance(0, InstanceStatus::Busy),
            instance(1, InstanceStatus::Terminated),
        ];
        let out = evaluate(
            &f,
            &instances,
            FleetContext {
                project_deleted: true,
                active_jobs: 4,
                ..ctx(T0)
            },
        );
        assert!(out.delete.is_none());
        assert_eq!(out.fleet.status, Some(FleetStatus::Terminating));
        assert_eq!(out.fleet.deleted, None);
        assert_eq!(out.new_instances_count, 0);
        assert_eq!(out.instances.len(), 2);
        assert_eq!(out.instances[0].1.status, Some(InstanceStatus::Terminating));
        assert_eq!(out.instances[1].1, InstanceUpdate::deleted());

        // Once the last instance is terminated and reaped, the fleet goes.
        let mut f = f;
        out.fleet.apply(&mut f);
        let instances = vec![instance(0, InstanceStatus::Terminated)];
        let out = evaluate(
            &f,
            &instances,
            FleetContext {
                project_deleted: true,
                ..ctx(T0 + 1)
            },
        );
        assert_eq!(out.delete, Some(DeleteReason::ProjectDeleted));
        assert_eq!(out.fleet.deleted, Some(true));
        assert_eq!(out.instances, vec![("i-0".to_string(), InstanceUpdate::deleted())]);
    }

    #[test]
    fn invalid_spec_is_not_retried() {
        let mut f = fleet(1, Some(3));
        f.spec.blocks = Blocks::Fixed(0);
        let out = evaluate(&f, &[instance(0, InstanceStatus::Idle)], ctx(T0));
        assert_eq!(out.consolidation, Consolidation::Skipped(SkipReason::InvalidSpec));
        assert!(out.delete.is_none());
        assert_eq!(out.fleet.status, Some(FleetStatus::Terminating));
        let message = out.fleet.status_message.clone().flatten().unwrap();
        assert!(message.starts_with("inconsistent fleet configuration"));
        assert_eq!(out.instances[0].1.status, Some(InstanceStatus::Terminating));
    }

    /// Apply a cycle outcome the way the store commit would, then let the
    /// instance pipeline finish every pending termination.
    fn apply(f: &mut Fleet, instances: &mut Vec<Instance>, out: CycleOutcome, now: u64) {
        out.fleet.apply(f);
        f.last_processed_at = Some(now);
        for (id, update) in out.instances {
            if let Some(inst) = instances.iter_mut().find(|i| i.id == id) {
                update.apply(inst);
            }
        }
        let taken = instances.iter().filter(|i| !i.deleted).map(|i| i.instance_num);
        let nums = fleetgrid_state::lowest_free_instance_nums(taken, out.new_instances_count as usize);
        for num in nums {
            let mut inst = instance(num, InstanceStatus::Idle);
            inst.id = format!("i-{num}-{now}");
            instances.push(inst);
        }
        for inst in instances.iter_mut() {
            if inst.status == InstanceStatus::Terminating {
                inst.status = InstanceStatus::Terminated;
            }
        }
    }

    fn fleet_instances(idle: usize, busy: usize) -> Vec<Instance> {
        (0..idle + busy)
            .map(|n| {
                let status = if n < busy {
                    InstanceStatus::Busy
                } else {
                    InstanceStatus::Idle
                };
                instance(n as u32, status)
            })
            .collect()
    }

    proptest! {
        #[test]
        fn consolidation_converges_and_stays(
            min in 0u32..5,
            extra in 0u32..4,
            idle in 0usize..10,
            busy_seed in 0usize..10,
        ) {
            let max = min + extra;
            let busy = busy_seed.min(max as usize);
            let mut f = fleet(min, Some(max));
            let mut instances = fleet_instances(idle, busy);

            let mut now = T0;
            let mut quiet_cycles = 0;
            for _ in 0..30 {
                now += 10 * 60_000;
                let out = evaluate(&f, &instances, ctx(now));
                let changed = matches!(&out.consolidation, Consolidation::Planned(p) if p.changed());
                prop_assert!(out.delete.is_none());
                apply(&mut f, &mut instances, out, now);
                quiet_cycles = if changed { 0 } else { quiet_cycles + 1 };
            }
            prop_assert!(quiet_cycles >= 3, "still changing after 30 cycles");

            let active = instances.iter().filter(|i| i.is_active()).count() as u32;
            prop_assert!(min <= active && active <= max, "{active} outside [{min}, {max}]");
            prop_assert_eq!(f.consolidation_attempt, 0);
        }

        #[test]
        fn attempt_increments_while_changing_and_resets_on_quiet(
            min in 0u32..4,
            extra in 0u32..3,
            idle in 0usize..6,
            busy in 0usize..6,
            attempt in 0u32..8,
        ) {
            let mut f = fleet(min, Some(min + extra));
            f.consolidation_attempt = attempt;
            f.last_consolidated_at = Some(T0);
            let instances = fleet_instances(idle, busy);

            let now = T0 + retry_delay(attempt);
            let out = evaluate(&f, &instances, ctx(now));
            let Consolidation::Planned(plan) = &out.consolidation else {
                return Err(TestCaseError::fail("ready fleet was skipped"));
            };
            let expected = if plan.changed() { attempt + 1 } else { 0 };
            prop_assert_eq!(out.fleet.consolidation_attempt, Some(expected));

            // One millisecond early is always a skip for a non-zero attempt.
            if attempt > 0 {
                let early = evaluate(&f, &instances, ctx(now - 1));
                let backing_off = matches!(
                    early.consolidation,
                    Consolidation::Skipped(SkipReason::BackingOff { .. })
                );
                prop_assert!(backing_off);
            }
        }
    }
}
