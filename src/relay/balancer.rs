//! Group load-balancing strategies.
//!
//! Pure selection functions over a group's item list. The round-robin
//! counter is process-wide and atomic: a burst of N concurrent requests
//! samples N distinct items (modulo list length).

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::store::entities::{GroupItem, GroupMode};

static ROUND_ROBIN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Pick the first item for a round.
pub fn select(mode: GroupMode, items: &[GroupItem]) -> Option<GroupItem> {
    if items.is_empty() {
        return None;
    }
    match mode {
        GroupMode::RoundRobin => {
            let n = ROUND_ROBIN_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
            Some(items[(n % items.len() as u64) as usize].clone())
        }
        GroupMode::Random => {
            let idx = rand::thread_rng().gen_range(0..items.len());
            Some(items[idx].clone())
        }
        GroupMode::Failover => {
            let mut sorted: Vec<&GroupItem> = items.iter().collect();
            sorted.sort_by_key(|i| i.priority);
            Some(sorted[0].clone())
        }
        GroupMode::Weighted => Some(weighted_pick(items).clone()),
    }
}

/// Pick the item after a failed attempt on `current`. Failover walks down
/// the priority order and returns `None` past the last item; every other
/// mode just selects again.
pub fn next(mode: GroupMode, items: &[GroupItem], current: &GroupItem) -> Option<GroupItem> {
    if items.is_empty() {
        return None;
    }
    match mode {
        GroupMode::Failover => {
            let mut sorted: Vec<&GroupItem> = items.iter().collect();
            sorted.sort_by_key(|i| i.priority);
            let pos = sorted.iter().position(|i| i.id == current.id)?;
            sorted.get(pos + 1).map(|i| (*i).clone())
        }
        _ => select(mode, items),
    }
}

/// Pick proportionally to weight; an all-zero weight set yields the first
/// item.
fn weighted_pick(items: &[GroupItem]) -> &GroupItem {
    let total: i64 = items.iter().map(|i| i.weight).sum();
    if total == 0 {
        return &items[0];
    }
    let mut r = rand::thread_rng().gen_range(0..total);
    for item in items {
        r -= item.weight;
        if r < 0 {
            return item;
        }
    }
    &items[0]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn items(specs: &[(i64, i64, i64)]) -> Vec<GroupItem> {
        specs
            .iter()
            .map(|(id, priority, weight)| GroupItem {
                id: *id,
                group_id: 1,
                channel_id: *id,
                model_name: format!("m{id}"),
                priority: *priority,
                weight: *weight,
            })
            .collect()
    }

    #[test]
    fn test_empty_items() {
        for mode in [
            GroupMode::RoundRobin,
            GroupMode::Random,
            GroupMode::Failover,
            GroupMode::Weighted,
        ] {
            assert!(select(mode, &[]).is_none());
        }
    }

    #[test]
    fn test_round_robin_cycles_distinct_items() {
        let items = items(&[(1, 0, 0), (2, 0, 0), (3, 0, 0)]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            seen.insert(select(GroupMode::RoundRobin, &items).unwrap().id);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_failover_picks_lowest_priority_first() {
        let items = items(&[(1, 5, 0), (2, 1, 0), (3, 3, 0)]);
        assert_eq!(select(GroupMode::Failover, &items).unwrap().id, 2);
    }

    #[test]
    fn test_failover_next_walks_priority_order() {
        let list = items(&[(1, 5, 0), (2, 1, 0), (3, 3, 0)]);
        let first = select(GroupMode::Failover, &list).unwrap();
        let second = next(GroupMode::Failover, &list, &first).unwrap();
        assert_eq!(second.id, 3);
        let third = next(GroupMode::Failover, &list, &second).unwrap();
        assert_eq!(third.id, 1);
        // Past the last item there is no successor.
        assert!(next(GroupMode::Failover, &list, &third).is_none());
    }

    #[test]
    fn test_weighted_all_zero_picks_first() {
        let items = items(&[(1, 0, 0), (2, 0, 0), (3, 0, 0)]);
        for _ in 0..20 {
            assert_eq!(select(GroupMode::Weighted, &items).unwrap().id, 1);
        }
    }

    #[test]
    fn test_weighted_distribution() {
        // Weights 1:3:0 over 10k picks approximate 2500:7500:0.
        let items = items(&[(1, 0, 1), (2, 0, 3), (3, 0, 0)]);
        let mut counts: HashMap<i64, usize> = HashMap::new();
        for _ in 0..10_000 {
            *counts
                .entry(select(GroupMode::Weighted, &items).unwrap().id)
                .or_default() += 1;
        }
        let c1 = counts.get(&1).copied().unwrap_or(0) as f64;
        let c2 = counts.get(&2).copied().unwrap_or(0) as f64;
        assert_eq!(counts.get(&3).copied().unwrap_or(0), 0);
        assert!((c1 - 2500.0).abs() < 350.0, "c1 was {c1}");
        assert!((c2 - 7500.0).abs() < 350.0, "c2 was {c2}");
    }

    #[test]
    fn test_random_covers_all_items() {
        let items = items(&[(1, 0, 0), (2, 0, 0)]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            seen.insert(select(GroupMode::Random, &items).unwrap().id);
        }
        assert_eq!(seen.len(), 2);
    }
}
