//! Proportional allocation.
//!
//! Statistics providers publish overnight stays at the intercommunal level
//! only; the audit needs per-commune figures. Each commune gets a weight
//! built from its establishment counts and per-category coefficients
//! (nightly-stay equivalence), and the aggregate splits proportionally.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// One child unit's typed sub-counts (category → establishment count).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildCounts {
    pub child_id: String,
    pub sub_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub child_id: String,
    pub weight: f64,
    /// Fraction of the aggregate (weight / Σ weights).
    pub share: f64,
    pub share_amount: u64,
}

/// Default nightly-stay equivalence per establishment, by category.
/// Adjusted per destination profile by the classifier when available.
pub fn default_coefficients() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("hotel".to_string(), 70.0),
        ("camping".to_string(), 135.0),
        ("residence".to_string(), 120.0),
        ("gite".to_string(), 6.0),
        ("chambre_hote".to_string(), 5.0),
    ])
}

/// Split `aggregate` across children proportionally to their weights.
///
/// Weight = Σ(sub_count × coefficient); a sub-count type with no coefficient
/// contributes nothing. All-zero weights fall back to an equal split rather
/// than zeroing the whole aggregate. Integer rounding is corrected by
/// assigning the remainder to the largest-weight children (ties broken by
/// input order), so share amounts always sum exactly to `aggregate`.
pub fn allocate(
    aggregate: u64,
    children: &[ChildCounts],
    coefficients: &BTreeMap<String, f64>,
) -> Vec<Allocation> {
    if children.is_empty() {
        return Vec::new();
    }

    let weights: Vec<f64> = children
        .iter()
        .map(|c| {
            c.sub_counts
                .iter()
                .map(|(kind, count)| coefficients.get(kind).copied().unwrap_or(0.0) * *count as f64)
                .sum()
        })
        .collect();

    let total_weight: f64 = weights.iter().sum();
    let shares: Vec<f64> = if total_weight > 0.0 {
        weights.iter().map(|w| w / total_weight).collect()
    } else {
        debug!("All weights zero; falling back to equal split");
        vec![1.0 / children.len() as f64; children.len()]
    };

    let mut amounts: Vec<u64> = shares
        .iter()
        .map(|s| (aggregate as f64 * s).floor() as u64)
        .collect();

    // Largest-remainder correction, assigned to the largest weights first.
    let assigned: u64 = amounts.iter().sum();
    let mut remainder = aggregate - assigned;
    let mut order: Vec<usize> = (0..children.len()).collect();
    order.sort_by(|&a, &b| {
        weights[b]
            .partial_cmp(&weights[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut next = 0usize;
    while remainder > 0 {
        amounts[order[next % order.len()]] += 1;
        remainder -= 1;
        next += 1;
    }

    children
        .iter()
        .zip(weights)
        .zip(shares)
        .zip(amounts)
        .map(|(((c, weight), share), share_amount)| Allocation {
            child_id: c.child_id.clone(),
            weight,
            share,
            share_amount,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child(id: &str, counts: &[(&str, u64)]) -> ChildCounts {
        ChildCounts {
            child_id: id.to_string(),
            sub_counts: counts.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn all_zero_weights_split_equally_and_sum_exactly() {
        let children = vec![child("a", &[]), child("b", &[]), child("c", &[])];
        let out = allocate(100, &children, &default_coefficients());

        let amounts: Vec<u64> = out.iter().map(|a| a.share_amount).collect();
        assert_eq!(amounts.iter().sum::<u64>(), 100);
        assert_eq!(amounts, vec![34, 33, 33]);
    }

    #[test]
    fn shares_sum_to_aggregate_for_uneven_weights() {
        let children = vec![
            child("a", &[("hotel", 3), ("gite", 10)]),
            child("b", &[("camping", 2)]),
            child("c", &[("hotel", 1)]),
        ];
        for aggregate in [0u64, 1, 7, 99, 100_000] {
            let out = allocate(aggregate, &children, &default_coefficients());
            let sum: u64 = out.iter().map(|a| a.share_amount).sum();
            assert_eq!(sum, aggregate, "aggregate {aggregate}");
        }
    }

    #[test]
    fn remainder_goes_to_largest_weight() {
        let children = vec![
            child("small", &[("hotel", 1)]),
            child("large", &[("hotel", 2)]),
        ];
        // 70 + 140 = 210; shares 1/3 and 2/3 of 100 → 33.3 and 66.6 →
        // floors 33 + 66, remainder 1 to "large".
        let out = allocate(100, &children, &default_coefficients());
        assert_eq!(out[0].share_amount, 33);
        assert_eq!(out[1].share_amount, 67);
    }

    #[test]
    fn unknown_categories_carry_no_weight() {
        let children = vec![
            child("a", &[("heliport", 5)]),
            child("b", &[("hotel", 1)]),
        ];
        let out = allocate(50, &children, &default_coefficients());
        assert_eq!(out[0].weight, 0.0);
        assert_eq!(out[0].share_amount, 0);
        assert_eq!(out[1].share_amount, 50);
    }

    #[test]
    fn no_children_no_allocations() {
        assert!(allocate(100, &[], &default_coefficients()).is_empty());
    }
}
