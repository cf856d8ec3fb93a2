//! Sparse multi-dimensional resource vectors.
//!
//! A [`Resource`] maps a resource-type name (`memory`, `vcore`, `gpu`, ...)
//! to an integer quantity. Missing keys are zero and all arithmetic is
//! componentwise. Published values are immutable by convention: every
//! operation returns a new value, mutation helpers exist only for values a
//! caller exclusively owns.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A sparse resource vector. Quantities are signed so that intermediate
/// values (headroom, shortages) can go negative; externally submitted
/// quantities are validated non-negative at the configuration boundary.
#[derive(Clone, Debug, Default, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Resource {
    quantities: BTreeMap<String, i64>,
}

impl Resource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a resource from `(name, quantity)` pairs.
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, i64)>,
        K: Into<String>,
    {
        Self {
            quantities: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Quantity bound to `name`, zero when absent.
    pub fn get(&self, name: &str) -> i64 {
        self.quantities.get(name).copied().unwrap_or(0)
    }

    /// Iterate over the explicitly bound quantities in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.quantities.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// True when every bound quantity is zero (or nothing is bound).
    pub fn is_zero(&self) -> bool {
        self.quantities.values().all(|q| *q == 0)
    }

    /// True when any component is greater than zero.
    pub fn strictly_greater_than_zero(&self) -> bool {
        self.quantities.values().any(|q| *q > 0)
    }

    /// True when any component is negative.
    pub fn has_negative(&self) -> bool {
        self.quantities.values().any(|q| *q < 0)
    }

    fn keys_union<'a>(&'a self, other: &'a Resource) -> impl Iterator<Item = &'a str> {
        // BTreeMap keys come out sorted, a simple merge keeps the union sorted
        // and duplicate free.
        let mut keys: Vec<&str> = self
            .quantities
            .keys()
            .chain(other.quantities.keys())
            .map(String::as_str)
            .collect();
        keys.sort_unstable();
        keys.dedup();
        keys.into_iter()
    }

    /// Componentwise sum.
    pub fn add(&self, other: &Resource) -> Resource {
        let mut out = self.clone();
        out.add_to(other);
        out
    }

    /// In-place componentwise sum.
    pub fn add_to(&mut self, other: &Resource) {
        for (k, v) in &other.quantities {
            *self.quantities.entry(k.clone()).or_insert(0) += v;
        }
    }

    /// Componentwise difference; components may go negative.
    pub fn sub(&self, other: &Resource) -> Resource {
        let mut out = self.clone();
        out.sub_from(other);
        out
    }

    /// In-place componentwise difference.
    pub fn sub_from(&mut self, other: &Resource) {
        for (k, v) in &other.quantities {
            *self.quantities.entry(k.clone()).or_insert(0) -= v;
        }
    }

    /// Componentwise difference clamped at zero per dimension.
    pub fn sub_eliminate_negative(&self, other: &Resource) -> Resource {
        let quantities = self
            .keys_union(other)
            .map(|k| (k.to_string(), (self.get(k) - other.get(k)).max(0)))
            .collect();
        Resource { quantities }
    }

    /// Componentwise maximum.
    pub fn component_wise_max(&self, other: &Resource) -> Resource {
        let quantities = self
            .keys_union(other)
            .map(|k| (k.to_string(), self.get(k).max(other.get(k))))
            .collect();
        Resource { quantities }
    }

    /// Componentwise minimum.
    pub fn component_wise_min(&self, other: &Resource) -> Resource {
        let quantities = self
            .keys_union(other)
            .map(|k| (k.to_string(), self.get(k).min(other.get(k))))
            .collect();
        Resource { quantities }
    }

    /// All components of `self` are `>=` the matching component of `other`
    /// and at least one is strictly greater.
    pub fn strictly_greater_than(&self, other: &Resource) -> bool {
        let mut one_greater = false;
        for k in self.keys_union(other) {
            match self.get(k).cmp(&other.get(k)) {
                Ordering::Less => return false,
                Ordering::Greater => one_greater = true,
                Ordering::Equal => {}
            }
        }
        one_greater
    }

    /// All components of `self` are `>=` the matching component of `other`.
    pub fn strictly_greater_than_or_equals(&self, other: &Resource) -> bool {
        self.keys_union(other).all(|k| self.get(k) >= other.get(k))
    }

    /// Every quantity bound in `self` fits inside `capacity`. Keys bound
    /// only in `capacity` are ignored.
    pub fn fits_in(&self, capacity: &Resource) -> bool {
        self.quantities
            .iter()
            .all(|(k, q)| *q <= capacity.get(k))
    }

    /// The dominant share of this usage against `capacity`: the largest
    /// per-dimension usage/capacity ratio. Usage on a dimension without
    /// capacity dominates everything.
    pub fn fairness_ratio(&self, capacity: &Resource) -> f64 {
        let mut ratio = 0.0f64;
        for (k, used) in &self.quantities {
            let cap = capacity.get(k);
            let r = if cap == 0 {
                if *used > 0 {
                    f64::INFINITY
                } else {
                    0.0
                }
            } else {
                *used as f64 / cap as f64
            };
            if r > ratio {
                ratio = r;
            }
        }
        ratio
    }

    /// The largest single component, used when every dimension is weighted
    /// equally (node available-resource ordering).
    pub fn dominant_quantity(&self) -> i64 {
        self.quantities.values().copied().max().unwrap_or(0)
    }

    /// Every component scaled by `factor`. Used for repeated asks:
    /// `shape * pending_repeat` is the total still requested.
    pub fn multiply(&self, factor: i64) -> Resource {
        Resource {
            quantities: self
                .quantities
                .iter()
                .map(|(k, v)| (k.clone(), v * factor))
                .collect(),
        }
    }
}

impl PartialEq for Resource {
    /// Equality ignores keys bound to zero: `{memory:0}` equals `{}`.
    fn eq(&self, other: &Resource) -> bool {
        self.keys_union(other).all(|k| self.get(k) == other.get(k))
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (k, v)) in self.quantities.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{k}:{v}")?;
        }
        write!(f, "]")
    }
}

impl FromIterator<(String, i64)> for Resource {
    fn from_iter<I: IntoIterator<Item = (String, i64)>>(iter: I) -> Self {
        Resource {
            quantities: iter.into_iter().collect(),
        }
    }
}

/// Compare two usage/capacity pairs by dominant share. Ties fall through to
/// the per-dimension ratios in key order so the result is deterministic for
/// any input; a full tie returns [`Ordering::Equal`] and callers break it on
/// an identity key (queue path, application id, node id).
pub fn comp_fairness_ratio(
    left: &Resource,
    left_capacity: &Resource,
    right: &Resource,
    right_capacity: &Resource,
) -> Ordering {
    let l = left.fairness_ratio(left_capacity);
    let r = right.fairness_ratio(right_capacity);
    match l.total_cmp(&r) {
        Ordering::Equal => {}
        ord => return ord,
    }
    // Dominant shares tie: walk the non-dominant dimensions in key order.
    let mut keys: Vec<&str> = left
        .iter()
        .map(|(k, _)| k)
        .chain(right.iter().map(|(k, _)| k))
        .collect();
    keys.sort_unstable();
    keys.dedup();
    for k in keys {
        let lr = single_ratio(left.get(k), left_capacity.get(k));
        let rr = single_ratio(right.get(k), right_capacity.get(k));
        match lr.total_cmp(&rr) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    Ordering::Equal
}

/// Compare two resources as if every dimension had unit capacity: by their
/// largest component, then lexicographically per key. Used for node ordering
/// where no meaningful per-node capacity baseline exists.
pub fn comp_usage(left: &Resource, right: &Resource) -> Ordering {
    match left.dominant_quantity().cmp(&right.dominant_quantity()) {
        Ordering::Equal => {}
        ord => return ord,
    }
    let mut keys: Vec<&str> = left
        .iter()
        .map(|(k, _)| k)
        .chain(right.iter().map(|(k, _)| k))
        .collect();
    keys.sort_unstable();
    keys.dedup();
    for k in keys {
        match left.get(k).cmp(&right.get(k)) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    Ordering::Equal
}

fn single_ratio(used: i64, capacity: i64) -> f64 {
    if capacity == 0 {
        if used > 0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        used as f64 / capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(pairs: &[(&str, i64)]) -> Resource {
        Resource::from_pairs(pairs.iter().map(|(k, v)| (k.to_string(), *v)))
    }

    #[test]
    fn test_add_sub() {
        let a = res(&[("memory", 100), ("vcore", 1)]);
        let b = res(&[("memory", 50), ("gpu", 2)]);

        let sum = a.add(&b);
        assert_eq!(sum.get("memory"), 150);
        assert_eq!(sum.get("vcore"), 1);
        assert_eq!(sum.get("gpu"), 2);

        let diff = a.sub(&b);
        assert_eq!(diff.get("memory"), 50);
        assert_eq!(diff.get("gpu"), -2);
        assert!(diff.has_negative());
    }

    #[test]
    fn test_sub_eliminate_negative() {
        let a = res(&[("memory", 100)]);
        let b = res(&[("memory", 300), ("vcore", 5)]);
        let diff = a.sub_eliminate_negative(&b);
        assert_eq!(diff.get("memory"), 0);
        assert_eq!(diff.get("vcore"), 0);
        assert!(diff.is_zero());
    }

    #[test]
    fn test_zero_and_positive_checks() {
        assert!(Resource::new().is_zero());
        assert!(res(&[("memory", 0)]).is_zero());
        assert!(!res(&[("memory", 0)]).strictly_greater_than_zero());
        assert!(res(&[("memory", 0), ("gpu", 1)]).strictly_greater_than_zero());
    }

    #[test]
    fn test_equality_ignores_zero_keys() {
        assert_eq!(res(&[("memory", 0)]), Resource::new());
        assert_eq!(res(&[("memory", 10), ("gpu", 0)]), res(&[("memory", 10)]));
        assert_ne!(res(&[("memory", 10)]), res(&[("memory", 11)]));
    }

    #[test]
    fn test_strictly_greater_than() {
        let small = res(&[("memory", 100), ("vcore", 1)]);
        let large = res(&[("memory", 200), ("vcore", 1)]);
        assert!(large.strictly_greater_than(&small));
        assert!(!small.strictly_greater_than(&large));
        // equal is not strictly greater
        assert!(!small.strictly_greater_than(&small.clone()));
        // incomparable: one dimension up, one down
        let skewed = res(&[("memory", 300), ("vcore", 0)]);
        assert!(!skewed.strictly_greater_than(&small));
    }

    #[test]
    fn test_fits_in() {
        let cap = res(&[("memory", 1000), ("vcore", 10)]);
        assert!(res(&[("memory", 500)]).fits_in(&cap));
        assert!(res(&[("memory", 1000), ("vcore", 10)]).fits_in(&cap));
        assert!(!res(&[("memory", 1001)]).fits_in(&cap));
        // a dimension the capacity does not know about never fits
        assert!(!res(&[("gpu", 1)]).fits_in(&cap));
    }

    #[test]
    fn test_component_wise_min_max() {
        let a = res(&[("memory", 100), ("vcore", 5)]);
        let b = res(&[("memory", 50), ("gpu", 1)]);
        let min = a.component_wise_min(&b);
        assert_eq!(min.get("memory"), 50);
        assert_eq!(min.get("vcore"), 0);
        assert_eq!(min.get("gpu"), 0);
        let max = a.component_wise_max(&b);
        assert_eq!(max.get("memory"), 100);
        assert_eq!(max.get("vcore"), 5);
        assert_eq!(max.get("gpu"), 1);
    }

    #[test]
    fn test_fairness_ratio_dominant_share() {
        let cap = res(&[("memory", 1000), ("vcore", 10)]);
        let used = res(&[("memory", 500), ("vcore", 8)]);
        // vcore dominates: 0.8 > 0.5
        assert!((used.fairness_ratio(&cap) - 0.8).abs() < f64::EPSILON);
        // usage without capacity dominates everything
        let odd = res(&[("gpu", 1)]);
        assert_eq!(odd.fairness_ratio(&cap), f64::INFINITY);
    }

    #[test]
    fn test_comp_fairness_ratio_orders_by_dominant_share() {
        let cap = res(&[("memory", 1000), ("vcore", 10)]);
        let light = res(&[("memory", 100), ("vcore", 1)]);
        let heavy = res(&[("memory", 900), ("vcore", 1)]);
        assert_eq!(
            comp_fairness_ratio(&light, &cap, &heavy, &cap),
            Ordering::Less
        );
        assert_eq!(
            comp_fairness_ratio(&heavy, &cap, &light, &cap),
            Ordering::Greater
        );
    }

    #[test]
    fn test_comp_fairness_ratio_tie_break_on_secondary_dimension() {
        let cap = res(&[("memory", 1000), ("vcore", 10)]);
        // both dominate on memory at 0.5, vcore differs
        let l = res(&[("memory", 500), ("vcore", 1)]);
        let r = res(&[("memory", 500), ("vcore", 2)]);
        assert_eq!(comp_fairness_ratio(&l, &cap, &r, &cap), Ordering::Less);
        assert_eq!(comp_fairness_ratio(&l, &cap, &l, &cap), Ordering::Equal);
    }

    #[test]
    fn test_comp_usage() {
        let a = res(&[("memory", 500), ("vcore", 5)]);
        let b = res(&[("memory", 400), ("vcore", 9)]);
        // dominant components: 500 vs 400
        assert_eq!(comp_usage(&a, &b), Ordering::Greater);
        assert_eq!(comp_usage(&b, &a), Ordering::Less);
        assert_eq!(comp_usage(&a, &a), Ordering::Equal);
    }

    #[test]
    fn test_display() {
        let a = res(&[("vcore", 5), ("memory", 500)]);
        assert_eq!(a.to_string(), "[memory:500 vcore:5]");
    }
}
