//! Best Instance Clock selection.
//!
//! Ranks candidate sync instances with an ordered rule list. Each rule
//! either distinguishes two candidates or defers to the next; the implicit
//! tie-break on instance identity guarantees a total, deterministic order.
//! `choose` is pure: hysteresis between successive elections belongs to the
//! engine.

use std::cmp::Ordering;

use serde::Serialize;

use crate::domain::status::{InstanceId, InstanceStatus};

/// One selection rule. `End` terminates a policy; `TieBreak` always follows
/// it as the last resort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rule {
    /// Manually selected instance wins.
    Manual,
    /// must-be-selected < unconstrained < cannot-be-selected.
    ExtConstraints,
    /// Slave < listening/selection < master/passive < disabled/faulty.
    State,
    /// An alarm-free instance beats any alarmed one.
    NoAlarms,
    /// Smaller configured priority wins.
    UserPriority,
    /// Higher clustering score wins.
    Clustering,
    /// Numerically smaller PTP clock class wins.
    ClockClass,
    /// Smaller grandmaster + local accuracy sum wins.
    TotalAccuracy,
    /// Smaller Allan variance wins.
    AllanVariance,
    /// Fewer steps from the grandmaster wins.
    StepsRemoved,
    End,
    /// Stable identity order; guarantees determinism.
    TieBreak,
}

impl Rule {
    pub fn name(self) -> &'static str {
        match self {
            Rule::Manual => "manual",
            Rule::ExtConstraints => "ext-constraints",
            Rule::State => "state",
            Rule::NoAlarms => "no-alarms",
            Rule::UserPriority => "user-priority",
            Rule::Clustering => "clustering",
            Rule::ClockClass => "clock-class",
            Rule::TotalAccuracy => "total-accuracy",
            Rule::AllanVariance => "allan-variance",
            Rule::StepsRemoved => "steps-removed",
            Rule::End => "end",
            Rule::TieBreak => "tie-break",
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// The default policy, in decreasing order of authority.
pub const DEFAULT_POLICY: &[Rule] = &[
    Rule::Manual,
    Rule::ExtConstraints,
    Rule::State,
    Rule::NoAlarms,
    Rule::UserPriority,
    Rule::Clustering,
    Rule::ClockClass,
    Rule::TotalAccuracy,
    Rule::AllanVariance,
    Rule::StepsRemoved,
    Rule::End,
];

/// One entry in the selector's input vector.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: InstanceId,
    pub name: String,
    pub status: InstanceStatus,
    /// Manual-selection latch, see [`select_instance`].
    pub selected: bool,
    /// Position in the last ranking, 0 = best.
    pub rank: usize,
}

impl Candidate {
    pub fn new(id: InstanceId, name: &str, status: InstanceStatus) -> Self {
        Candidate {
            id,
            name: name.to_string(),
            status,
            selected: false,
            rank: 0,
        }
    }
}

/// Outcome of a `choose` run over a non-empty candidate set.
#[derive(Debug, Clone)]
pub struct Ranking {
    /// Candidate indices, best first.
    pub order: Vec<usize>,
    /// `decisive[i]` is the first rule distinguishing `order[i]` from
    /// `order[i + 1]`.
    pub decisive: Vec<Rule>,
}

impl Ranking {
    pub fn winner(&self) -> usize {
        self.order[0]
    }

    /// Diagnostic lines in the form `rank 1: ptp1 by rule clock-class`.
    pub fn describe(&self, candidates: &[Candidate]) -> Vec<String> {
        let mut out = Vec::with_capacity(self.order.len());
        for (rank, &idx) in self.order.iter().enumerate() {
            let name = &candidates[idx].name;
            match rank.checked_sub(1).and_then(|r| self.decisive.get(r)) {
                Some(rule) => out.push(format!("rank {rank}: {name} by rule {rule}")),
                None => out.push(format!("rank {rank}: {name}")),
            }
        }
        out
    }
}

fn compare_by(rule: Rule, a: &Candidate, b: &Candidate) -> Ordering {
    let (sa, sb) = (&a.status, &b.status);
    match rule {
        Rule::Manual => b.selected.cmp(&a.selected),
        Rule::ExtConstraints => sa
            .constraints
            .selection_score()
            .cmp(&sb.constraints.selection_score()),
        Rule::State => sa
            .state
            .selection_priority()
            .cmp(&sb.state.selection_priority()),
        Rule::NoAlarms => sa.alarms.is_empty().cmp(&sb.alarms.is_empty()).reverse(),
        Rule::UserPriority => sa.user_priority.cmp(&sb.user_priority),
        Rule::Clustering => sb.clustering_score.cmp(&sa.clustering_score),
        Rule::ClockClass => sa
            .grandmaster
            .clock_class
            .as_ptp()
            .cmp(&sb.grandmaster.clock_class.as_ptp()),
        Rule::TotalAccuracy => {
            let ta = sa.grandmaster.accuracy_ns + sa.local_accuracy_ns;
            let tb = sb.grandmaster.accuracy_ns + sb.local_accuracy_ns;
            ta.total_cmp(&tb)
        }
        Rule::AllanVariance => sa
            .grandmaster
            .allan_variance
            .total_cmp(&sb.grandmaster.allan_variance),
        Rule::StepsRemoved => sa
            .grandmaster
            .steps_removed
            .cmp(&sb.grandmaster.steps_removed),
        Rule::End => Ordering::Equal,
        Rule::TieBreak => a.id.cmp(&b.id),
    }
}

/// Compare two candidates under a policy. Returns the ordering and the
/// first rule that distinguished them (`TieBreak` when none did).
pub fn compare(policy: &[Rule], a: &Candidate, b: &Candidate) -> (Ordering, Rule) {
    for &rule in policy {
        if rule == Rule::End {
            break;
        }
        let ord = compare_by(rule, a, b);
        if ord != Ordering::Equal {
            return (ord, rule);
        }
    }
    (compare_by(Rule::TieBreak, a, b), Rule::TieBreak)
}

/// Rank `candidates` under `policy`. Pure: no candidate state is modified.
/// Returns `None` for an empty candidate set.
pub fn choose(candidates: &[Candidate], policy: &[Rule]) -> Option<Ranking> {
    if candidates.is_empty() {
        return None;
    }
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&i, &j| compare(policy, &candidates[i], &candidates[j]).0);
    let decisive = order
        .windows(2)
        .map(|pair| compare(policy, &candidates[pair[0]], &candidates[pair[1]]).1)
        .collect();
    Some(Ranking { order, decisive })
}

/// Record the ranking back onto the candidate vector.
pub fn apply_ranks(candidates: &mut [Candidate], ranking: &Ranking) {
    for (rank, &idx) in ranking.order.iter().enumerate() {
        candidates[idx].rank = rank;
    }
}

/// Latch manual selection onto exactly one record, clearing all others.
pub fn select_instance(candidates: &mut [Candidate], winner: InstanceId) {
    for cand in candidates.iter_mut() {
        cand.selected = cand.id == winner;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::grandmaster::ClockClass;
    use crate::domain::state::{Alarms, Constraints, SyncState};

    fn slave_candidate(id: u32, name: &str) -> Candidate {
        let mut status = InstanceStatus::default();
        status.state = SyncState::Slave;
        status.grandmaster.clock_class = ClockClass::Locked;
        status.grandmaster.accuracy_ns = 100.0;
        status.grandmaster.allan_variance = 1e-18;
        status.local_accuracy_ns = 50.0;
        Candidate::new(InstanceId(id), name, status)
    }

    #[test]
    fn test_clock_class_decides() {
        let a = slave_candidate(1, "ptp1");
        let mut b = slave_candidate(2, "ptp2");
        b.status.grandmaster.clock_class = ClockClass::Holdover;
        let cands = vec![a, b];
        let ranking = choose(&cands, DEFAULT_POLICY).unwrap();
        assert_eq!(ranking.winner(), 0);
        assert_eq!(ranking.decisive[0], Rule::ClockClass);
    }

    #[test]
    fn test_allan_variance_decides_after_class_tie() {
        let mut a = slave_candidate(1, "ptp1");
        a.status.grandmaster.clock_class = ClockClass::Holdover;
        a.status.grandmaster.allan_variance = 1e-20;
        let mut b = slave_candidate(2, "ptp2");
        b.status.grandmaster.clock_class = ClockClass::Holdover;
        b.status.grandmaster.allan_variance = 1e-18;
        let cands = vec![a, b];
        let ranking = choose(&cands, DEFAULT_POLICY).unwrap();
        assert_eq!(ranking.winner(), 0);
        assert_eq!(ranking.decisive[0], Rule::AllanVariance);
    }

    #[test]
    fn test_constraints_override_everything_else() {
        let a = slave_candidate(1, "ntp1");
        let mut b = slave_candidate(2, "ptp1");
        // Better on every metric, but barred from selection.
        b.status.user_priority = 1;
        b.status.grandmaster.accuracy_ns = 1.0;
        b.status.constraints = Constraints::CANNOT_BE_SELECTED;
        let cands = vec![a, b];
        let ranking = choose(&cands, DEFAULT_POLICY).unwrap();
        assert_eq!(ranking.winner(), 0);
        assert_eq!(ranking.decisive[0], Rule::ExtConstraints);
    }

    #[test]
    fn test_manual_selection_wins() {
        let a = slave_candidate(1, "a");
        let mut b = slave_candidate(2, "b");
        b.status.alarms = Alarms::NO_SYNC_PKTS;
        let mut cands = vec![a, b];
        select_instance(&mut cands, InstanceId(2));
        let ranking = choose(&cands, DEFAULT_POLICY).unwrap();
        assert_eq!(ranking.winner(), 1);
        assert_eq!(ranking.decisive[0], Rule::Manual);
    }

    #[test]
    fn test_select_instance_is_exclusive() {
        let mut cands = vec![slave_candidate(1, "a"), slave_candidate(2, "b")];
        select_instance(&mut cands, InstanceId(1));
        select_instance(&mut cands, InstanceId(2));
        assert!(!cands[0].selected);
        assert!(cands[1].selected);
    }

    #[test]
    fn test_alarms_disqualify() {
        let mut a = slave_candidate(1, "a");
        a.status.alarms = Alarms::NO_DELAY_RESPS;
        let b = slave_candidate(2, "b");
        let cands = vec![a, b];
        let ranking = choose(&cands, DEFAULT_POLICY).unwrap();
        assert_eq!(ranking.winner(), 1);
        assert_eq!(ranking.decisive[0], Rule::NoAlarms);
    }

    #[test]
    fn test_state_priority_ordering() {
        let mut a = slave_candidate(1, "listening");
        a.status.state = SyncState::Listening;
        let b = slave_candidate(2, "slave");
        let mut c = slave_candidate(3, "faulty");
        c.status.state = SyncState::Faulty;
        let cands = vec![a, b, c];
        let ranking = choose(&cands, DEFAULT_POLICY).unwrap();
        assert_eq!(ranking.order, vec![1, 0, 2]);
        assert_eq!(ranking.decisive, vec![Rule::State, Rule::State]);
    }

    #[test]
    fn test_total_accuracy_sums_local_and_master() {
        let mut a = slave_candidate(1, "a");
        a.status.grandmaster.accuracy_ns = 100.0;
        a.status.local_accuracy_ns = 500.0;
        let mut b = slave_candidate(2, "b");
        b.status.grandmaster.accuracy_ns = 300.0;
        b.status.local_accuracy_ns = 100.0;
        let cands = vec![a, b];
        let ranking = choose(&cands, DEFAULT_POLICY).unwrap();
        assert_eq!(ranking.winner(), 1);
        assert_eq!(ranking.decisive[0], Rule::TotalAccuracy);
    }

    #[test]
    fn test_unknown_accuracy_loses_to_known() {
        let mut a = slave_candidate(1, "a");
        a.status.grandmaster.accuracy_ns = f64::INFINITY;
        let b = slave_candidate(2, "b");
        let cands = vec![a, b];
        let ranking = choose(&cands, DEFAULT_POLICY).unwrap();
        assert_eq!(ranking.winner(), 1);
    }

    #[test]
    fn test_determinism_across_runs() {
        let cands = vec![
            slave_candidate(3, "c"),
            slave_candidate(1, "a"),
            slave_candidate(2, "b"),
        ];
        let first = choose(&cands, DEFAULT_POLICY).unwrap();
        for _ in 0..10 {
            let again = choose(&cands, DEFAULT_POLICY).unwrap();
            assert_eq!(again.order, first.order);
            assert_eq!(again.decisive, first.decisive);
        }
        // Indistinguishable candidates order by identity.
        assert_eq!(first.order, vec![1, 2, 0]);
        assert!(first.decisive.iter().all(|&r| r == Rule::TieBreak));
    }

    #[test]
    fn test_tie_break_is_input_order_independent() {
        let a = slave_candidate(1, "a");
        let b = slave_candidate(2, "b");
        let forward = vec![a.clone(), b.clone()];
        let reversed = vec![b, a];
        let w1 = choose(&forward, DEFAULT_POLICY).unwrap();
        let w2 = choose(&reversed, DEFAULT_POLICY).unwrap();
        assert_eq!(forward[w1.winner()].id, reversed[w2.winner()].id);
    }

    #[test]
    fn test_clustering_higher_wins() {
        let mut a = slave_candidate(1, "a");
        a.status.clustering_score = 3;
        let mut b = slave_candidate(2, "b");
        b.status.clustering_score = 7;
        let cands = vec![a, b];
        let ranking = choose(&cands, DEFAULT_POLICY).unwrap();
        assert_eq!(ranking.winner(), 1);
        assert_eq!(ranking.decisive[0], Rule::Clustering);
    }

    #[test]
    fn test_describe_lines() {
        let a = slave_candidate(1, "ptp1");
        let mut b = slave_candidate(2, "ptp2");
        b.status.grandmaster.clock_class = ClockClass::Holdover;
        let cands = vec![a, b];
        let ranking = choose(&cands, DEFAULT_POLICY).unwrap();
        let lines = ranking.describe(&cands);
        assert_eq!(lines[0], "rank 0: ptp1");
        assert_eq!(lines[1], "rank 1: ptp2 by rule clock-class");
    }

    #[test]
    fn test_truncated_policy_falls_to_tie_break() {
        let policy = [Rule::Manual, Rule::End];
        let a = slave_candidate(2, "a");
        let mut b = slave_candidate(1, "b");
        b.status.grandmaster.clock_class = ClockClass::Holdover;
        let cands = vec![a, b];
        let ranking = choose(&cands, &policy).unwrap();
        // Clock class is beyond End; identity decides.
        assert_eq!(ranking.winner(), 1);
        assert_eq!(ranking.decisive[0], Rule::TieBreak);
    }
}
