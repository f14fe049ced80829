//! 链路顺序解析：阶段分桶 + 桶内稳定拓扑排序。
//!
//! # 教案式说明
//! - **意图（Why）**：相同输入必须得到相同顺序，测试才可复现；没有约束关系的拦截器保持插入顺序。
//! - **逻辑（How）**：
//!   1. 按阶段注册表中的下标把条目分桶，桶之间的顺序只由阶段决定；
//!   2. 桶内根据 `before`/`after` 建边（`a.before ∋ b` 得 `a → b`，`a.after ∋ b` 得 `b → a`），
//!      通配符 `*` 对同桶中未声明同向通配的所有条目建边；
//!   3. Kahn 算法，每一步取入度为零且插入序最小的条目，保证稳定性。
//! - **契约（What）**：输入切片按插入顺序排列；返回该切片的下标排列；
//!   约束成环时返回环上剩余的 id，调用方据此拒绝变更。

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{interceptor::Placement, phase::PhaseRegistry};

/// 解析失败原因。
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum OrderingFailure {
    UnknownPhase { id: String, phase: String },
    Cycle { phase: String, ids: Vec<String> },
}

/// 计算执行顺序。
pub(crate) fn resolve(
    phases: &PhaseRegistry,
    placements: &[&Placement],
) -> Result<Vec<usize>, OrderingFailure> {
    let mut buckets: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (index, placement) in placements.iter().enumerate() {
        let position =
            phases
                .position(&placement.phase)
                .ok_or_else(|| OrderingFailure::UnknownPhase {
                    id: placement.id.clone(),
                    phase: placement.phase.clone(),
                })?;
        buckets.entry(position).or_default().push(index);
    }

    let mut order = Vec::with_capacity(placements.len());
    for members in buckets.values() {
        order.extend(sort_bucket(placements, members)?);
    }
    Ok(order)
}

fn sort_bucket(
    placements: &[&Placement],
    members: &[usize],
) -> Result<Vec<usize>, OrderingFailure> {
    if members.len() < 2 {
        return Ok(members.to_vec());
    }

    // 桶内局部下标与插入顺序一致，`BTreeSet` 的最小值即“最早插入的就绪条目”。
    let local: HashMap<&str, usize> = members
        .iter()
        .enumerate()
        .map(|(slot, &index)| (placements[index].id.as_str(), slot))
        .collect();
    let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); members.len()];

    for (slot, &index) in members.iter().enumerate() {
        let placement = placements[index];
        for target in &placement.before {
            if let Some(&to) = local.get(target.as_str()) {
                edges[slot].insert(to);
            }
        }
        for source in &placement.after {
            if let Some(&from) = local.get(source.as_str()) {
                edges[from].insert(slot);
            }
        }
        if placement.wants_first() {
            for (other, &other_index) in members.iter().enumerate() {
                if !placements[other_index].wants_first() {
                    edges[slot].insert(other);
                }
            }
        }
        if placement.wants_last() {
            for (other, &other_index) in members.iter().enumerate() {
                if !placements[other_index].wants_last() {
                    edges[other].insert(slot);
                }
            }
        }
    }
    for (slot, targets) in edges.iter_mut().enumerate() {
        targets.remove(&slot);
    }

    let mut in_degree = vec![0usize; members.len()];
    for targets in &edges {
        for &to in targets {
            in_degree[to] += 1;
        }
    }
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(slot, _)| slot)
        .collect();

    let mut sorted = Vec::with_capacity(members.len());
    while let Some(slot) = ready.pop_first() {
        sorted.push(members[slot]);
        for &to in &edges[slot] {
            in_degree[to] -= 1;
            if in_degree[to] == 0 {
                ready.insert(to);
            }
        }
    }

    if sorted.len() != members.len() {
        let ids = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree > 0)
            .map(|(slot, _)| placements[members[slot]].id.clone())
            .collect();
        return Err(OrderingFailure::Cycle {
            phase: placements[members[0]].phase.clone(),
            ids,
        });
    }
    Ok(sorted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PhaseRegistry {
        PhaseRegistry::from_pairs([("p1", 0), ("p2", 10)]).unwrap()
    }

    fn ids(placements: &[Placement], order: &[usize]) -> Vec<String> {
        order.iter().map(|&i| placements[i].id.clone()).collect()
    }

    fn run(placements: &[Placement]) -> Result<Vec<String>, OrderingFailure> {
        let refs: Vec<&Placement> = placements.iter().collect();
        resolve(&registry(), &refs).map(|order| ids(placements, &order))
    }

    #[test]
    fn phase_order_dominates_insertion_order() {
        let placements = [
            Placement::new("c", "p2"),
            Placement::new("a", "p1"),
            Placement::new("b", "p1").after("a"),
        ];
        assert_eq!(run(&placements).unwrap(), ["a", "b", "c"]);
    }

    #[test]
    fn constraint_declared_by_earlier_entry_moves_later_entry() {
        let placements = [
            Placement::new("late", "p1").after("early"),
            Placement::new("early", "p1"),
        ];
        assert_eq!(run(&placements).unwrap(), ["early", "late"]);

        let placements = [
            Placement::new("x", "p1"),
            Placement::new("y", "p1"),
            Placement::new("z", "p1").before("x"),
        ];
        assert_eq!(run(&placements).unwrap(), ["y", "z", "x"]);
    }

    #[test]
    fn cross_phase_and_absent_constraints_are_ignored() {
        let placements = [
            Placement::new("a", "p1").after("c").before("ghost"),
            Placement::new("c", "p2"),
        ];
        assert_eq!(run(&placements).unwrap(), ["a", "c"]);
    }

    #[test]
    fn wildcards_pin_to_bucket_edges() {
        let placements = [
            Placement::new("m1", "p1"),
            Placement::new("tail", "p1").last(),
            Placement::new("m2", "p1"),
            Placement::new("head", "p1").first(),
        ];
        assert_eq!(run(&placements).unwrap(), ["head", "m1", "m2", "tail"]);
    }

    #[test]
    fn cycle_is_reported_with_members() {
        let placements = [
            Placement::new("a", "p1").after("b"),
            Placement::new("b", "p1").after("a"),
            Placement::new("free", "p1"),
        ];
        match run(&placements) {
            Err(OrderingFailure::Cycle { phase, ids }) => {
                assert_eq!(phase, "p1");
                assert_eq!(ids, ["a", "b"]);
            }
            other => panic!("预期检测到环，实际为 {other:?}"),
        }
    }

    #[test]
    fn unknown_phase_is_reported() {
        let placements = [Placement::new("a", "nowhere")];
        assert_eq!(
            run(&placements),
            Err(OrderingFailure::UnknownPhase {
                id: "a".into(),
                phase: "nowhere".into()
            })
        );
    }
}
