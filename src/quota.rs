//! Exact arithmetic over Kubernetes resource quantities and the budget
//! partitioning that backs subsidiary namespaces.
//!
//! Quantities are held as integral milli-units (`i128`) so that
//! subtraction and comparison are exact. `2`, `2000m` and `0.002k`
//! parse to the same value; formatting canonicalizes to plain units
//! when whole and `{n}m` otherwise.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QuantityErr {
    #[error("quantity is empty")]
    Empty,
    #[error("malformed quantity `{0}`")]
    Malformed(String),
    #[error("unknown suffix in quantity `{0}`")]
    UnknownSuffix(String),
    #[error("quantity `{0}` overflows")]
    Overflow(String),
}

/// Parse a Kubernetes quantity string into milli-units.
///
/// Supports the decimal SI suffixes (`m`, none, `k`, `M`, `G`, `T`,
/// `P`, `E`), binary suffixes (`Ki` .. `Ei`) and decimal fractions.
pub fn parse_millis(s: &str) -> Result<i128, QuantityErr> {
    let s = s.trim();
    if s.is_empty() {
        return Err(QuantityErr::Empty);
    }

    let (sign, rest) = match s.as_bytes()[0] {
        b'-' => (-1i128, &s[1..]),
        b'+' => (1i128, &s[1..]),
        _ => (1i128, s),
    };

    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    let (number, suffix) = rest.split_at(digits_end);
    if number.is_empty() {
        return Err(QuantityErr::Malformed(s.to_string()));
    }

    // Multiplier expressed in milli-units of the base unit.
    let multiplier: i128 = match suffix {
        "m" => 1,
        "" => 1_000,
        "k" => 1_000_000,
        "M" => 1_000_000_000,
        "G" => 1_000_000_000_000,
        "T" => 1_000_000_000_000_000,
        "P" => 1_000_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000_000,
        "Ki" => 1_000 * (1i128 << 10),
        "Mi" => 1_000 * (1i128 << 20),
        "Gi" => 1_000 * (1i128 << 30),
        "Ti" => 1_000 * (1i128 << 40),
        "Pi" => 1_000 * (1i128 << 50),
        "Ei" => 1_000 * (1i128 << 60),
        _ => return Err(QuantityErr::UnknownSuffix(s.to_string())),
    };

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if frac_part.contains('.') {
        return Err(QuantityErr::Malformed(s.to_string()));
    }

    let int_val: i128 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse()
            .map_err(|_| QuantityErr::Malformed(s.to_string()))?
    };

    let mut value = int_val
        .checked_mul(multiplier)
        .ok_or_else(|| QuantityErr::Overflow(s.to_string()))?;

    if !frac_part.is_empty() {
        let frac_digits: i128 = frac_part
            .parse()
            .map_err(|_| QuantityErr::Malformed(s.to_string()))?;
        let scale = 10i128
            .checked_pow(frac_part.len() as u32)
            .ok_or_else(|| QuantityErr::Overflow(s.to_string()))?;
        // Fractional contribution must land on whole milli-units.
        let num = frac_digits
            .checked_mul(multiplier)
            .ok_or_else(|| QuantityErr::Overflow(s.to_string()))?;
        if num % scale != 0 {
            return Err(QuantityErr::Malformed(s.to_string()));
        }
        value = value
            .checked_add(num / scale)
            .ok_or_else(|| QuantityErr::Overflow(s.to_string()))?;
    }

    Ok(sign * value)
}

/// Canonical string form: plain units when the value is a whole
/// multiple of 1000 milli-units, `{n}m` otherwise.
pub fn format_millis(millis: i128) -> String {
    if millis % 1_000 == 0 {
        format!("{}", millis / 1_000)
    } else {
        format!("{millis}m")
    }
}

pub fn quantity_millis(q: &Quantity) -> Result<i128, QuantityErr> {
    parse_millis(&q.0)
}

pub fn to_quantity(millis: i128) -> Quantity {
    Quantity(format_millis(millis))
}

/// A sibling's claim against the shared budget, as seen during a
/// partitioning pass.
#[derive(Clone, Debug)]
pub struct SiblingClaim {
    pub name: String,
    /// Resource demand keyed by resource name, in milli-units.
    pub demand: BTreeMap<String, i128>,
    /// Creation timestamp; the newest evictable sibling is removed
    /// under shortage.
    pub created: chrono::DateTime<chrono::Utc>,
    /// Only claims that already reached an in-progress or established
    /// state yield under pressure; a request still waiting for its
    /// first partition never evicts anyone by merely existing.
    pub evictable: bool,
}

/// Outcome of partitioning the parent budget among active siblings.
#[derive(Clone, Debug)]
pub enum Partition {
    /// Every resource stays non-negative after all claims.
    Fits {
        /// What remains for the parent's own quota, keyed by resource.
        remaining: BTreeMap<String, i128>,
    },
    /// At least one resource went negative.
    Shortage {
        /// Resources that went negative and by how much.
        deficit: BTreeMap<String, i128>,
        /// Newest evictable sibling, to be removed to relieve
        /// pressure.
        eviction_candidate: Option<String>,
    },
}

/// Subtract every active sibling claim (the claimant included) from the
/// budget. Only keys present in the budget participate; a sibling
/// demand for a resource the budget does not meter is ignored.
pub fn partition_budget(
    budget: &BTreeMap<String, i128>,
    siblings: &[SiblingClaim],
) -> Partition {
    let mut remaining = budget.clone();
    let mut newest: Option<(&SiblingClaim, chrono::DateTime<chrono::Utc>)> = None;

    for sibling in siblings {
        for (resource, demand) in &sibling.demand {
            if let Some(left) = remaining.get_mut(resource) {
                *left -= demand;
            }
        }
        if !sibling.evictable {
            continue;
        }
        match &newest {
            Some((_, ts)) if *ts >= sibling.created => {}
            _ => newest = Some((sibling, sibling.created)),
        }
    }

    let deficit: BTreeMap<String, i128> = remaining
        .iter()
        .filter(|(_, v)| **v < 0)
        .map(|(k, v)| (k.clone(), -v))
        .collect();

    if deficit.is_empty() {
        Partition::Fits { remaining }
    } else {
        Partition::Shortage {
            deficit,
            eviction_candidate: newest.map(|(s, _)| s.name.clone()),
        }
    }
}

/// Convert a Quantity map into milli-units, rejecting any malformed
/// entry rather than silently zeroing it.
pub fn demand_millis(
    quantities: &BTreeMap<String, Quantity>,
) -> Result<BTreeMap<String, i128>, QuantityErr> {
    quantities
        .iter()
        .map(|(k, q)| Ok((k.clone(), quantity_millis(q)?)))
        .collect()
}

/// Render a milli-unit map back into Quantity strings for a
/// ResourceQuota hard block.
pub fn millis_to_quantities(
    millis: &BTreeMap<String, i128>,
) -> BTreeMap<String, Quantity> {
    millis
        .iter()
        .map(|(k, v)| (k.clone(), to_quantity(*v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn demand(pairs: &[(&str, &str)]) -> BTreeMap<String, i128> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), parse_millis(v).unwrap()))
            .collect()
    }

    fn claim(name: &str, ts: i64, pairs: &[(&str, &str)]) -> SiblingClaim {
        SiblingClaim {
            name: name.to_string(),
            demand: demand(pairs),
            created: Utc.timestamp_opt(ts, 0).unwrap(),
            evictable: true,
        }
    }

    #[test]
    fn parses_plain_and_milli() {
        assert_eq!(parse_millis("2").unwrap(), 2_000);
        assert_eq!(parse_millis("2000m").unwrap(), 2_000_000);
        assert_eq!(parse_millis("250m").unwrap(), 250);
        assert_eq!(parse_millis("0").unwrap(), 0);
        assert_eq!(parse_millis("-1").unwrap(), -1_000);
    }

    #[test]
    fn parses_binary_and_decimal_suffixes() {
        assert_eq!(parse_millis("1Ki").unwrap(), 1_024_000);
        assert_eq!(parse_millis("8192Mi").unwrap(), 8192 * 1_000 * (1 << 20));
        assert_eq!(parse_millis("6Gi").unwrap(), 6 * 1_000 * (1i128 << 30));
        assert_eq!(parse_millis("1k").unwrap(), 1_000_000);
        assert_eq!(parse_millis("1E").unwrap(), 1_000_000_000_000_000_000_000);
    }

    #[test]
    fn parses_fractions_that_land_on_millis() {
        assert_eq!(parse_millis("0.5").unwrap(), 500);
        assert_eq!(parse_millis("1.5Gi").unwrap(), 3 * 1_000 * (1i128 << 30) / 2);
        assert_eq!(parse_millis("0.002k").unwrap(), 2_000);
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(parse_millis(""), Err(QuantityErr::Empty));
        assert!(matches!(parse_millis("abc"), Err(QuantityErr::Malformed(_))));
        assert!(matches!(
            parse_millis("1Q"),
            Err(QuantityErr::UnknownSuffix(_))
        ));
        // 0.1m is a tenth of a milli-unit; not representable.
        assert!(matches!(
            parse_millis("0.1m"),
            Err(QuantityErr::Malformed(_))
        ));
    }

    #[test]
    fn formats_canonically() {
        assert_eq!(format_millis(2_000), "2");
        assert_eq!(format_millis(250), "250m");
        assert_eq!(format_millis(0), "0");
        assert_eq!(
            format_millis(2 * 1_000 * (1i128 << 30)),
            "2147483648"
        );
    }

    #[test]
    fn conservation_after_claim() {
        // budget cpu=8000m memory=8192Mi, claim cpu=6000m memory=6Gi
        let budget = demand(&[("cpu", "8000m"), ("memory", "8192Mi")]);
        let siblings = vec![claim("alpha", 100, &[("cpu", "6000m"), ("memory", "6Gi")])];
        match partition_budget(&budget, &siblings) {
            Partition::Fits { remaining } => {
                assert_eq!(format_millis(remaining["cpu"]), "2");
                assert_eq!(format_millis(remaining["memory"]), "2147483648");
            }
            other => panic!("expected fit, got {other:?}"),
        }
    }

    #[test]
    fn shortage_reports_deficit_and_newest_candidate() {
        let budget = demand(&[("cpu", "4")]);
        let siblings = vec![
            claim("old", 100, &[("cpu", "3")]),
            claim("new", 200, &[("cpu", "3")]),
        ];
        match partition_budget(&budget, &siblings) {
            Partition::Shortage {
                deficit,
                eviction_candidate,
            } => {
                assert_eq!(deficit["cpu"], 2_000);
                assert_eq!(eviction_candidate.as_deref(), Some("new"));
            }
            other => panic!("expected shortage, got {other:?}"),
        }
    }

    #[test]
    fn overcommitted_descendants_report_shortage() {
        // A claim's own budget partitioned among its descendants must
        // surface the deficit, never clamp the remainder to zero.
        let budget = demand(&[("cpu", "6000m")]);
        let descendants = vec![
            claim("first", 100, &[("cpu", "4000m")]),
            claim("second", 200, &[("cpu", "3000m")]),
        ];
        match partition_budget(&budget, &descendants) {
            Partition::Shortage {
                deficit,
                eviction_candidate,
            } => {
                assert_eq!(deficit["cpu"], 1_000);
                assert_eq!(eviction_candidate.as_deref(), Some("second"));
            }
            other => panic!("expected shortage, got {other:?}"),
        }
    }

    #[test]
    fn new_requests_are_never_the_eviction_candidate() {
        let budget = demand(&[("cpu", "4")]);
        let mut newcomer = claim("newcomer", 300, &[("cpu", "3")]);
        newcomer.evictable = false;
        let siblings = vec![
            claim("old", 100, &[("cpu", "2")]),
            claim("mid", 200, &[("cpu", "2")]),
            newcomer,
        ];
        match partition_budget(&budget, &siblings) {
            Partition::Shortage {
                eviction_candidate, ..
            } => assert_eq!(eviction_candidate.as_deref(), Some("mid")),
            other => panic!("expected shortage, got {other:?}"),
        }
    }

    #[test]
    fn exact_zero_remaining_fits() {
        let budget = demand(&[("cpu", "4")]);
        let siblings = vec![
            claim("a", 1, &[("cpu", "2")]),
            claim("b", 2, &[("cpu", "2")]),
        ];
        match partition_budget(&budget, &siblings) {
            Partition::Fits { remaining } => assert_eq!(remaining["cpu"], 0),
            other => panic!("expected fit, got {other:?}"),
        }
    }

    #[test]
    fn unmetered_resources_are_ignored() {
        let budget = demand(&[("cpu", "4")]);
        let siblings = vec![claim("a", 1, &[("cpu", "1"), ("pods", "50")])];
        match partition_budget(&budget, &siblings) {
            Partition::Fits { remaining } => {
                assert_eq!(remaining["cpu"], 3_000);
                assert!(!remaining.contains_key("pods"));
            }
            other => panic!("expected fit, got {other:?}"),
        }
    }

    #[test]
    fn restitution_round_trips() {
        // Removing a claim and re-partitioning restores the budget.
        let budget = demand(&[("cpu", "8"), ("memory", "8192Mi")]);
        let with = vec![
            claim("keeper", 1, &[("cpu", "2")]),
            claim("leaver", 2, &[("cpu", "4"), ("memory", "4Gi")]),
        ];
        let without = vec![claim("keeper", 1, &[("cpu", "2")])];

        let before = match partition_budget(&budget, &with) {
            Partition::Fits { remaining } => remaining,
            other => panic!("expected fit, got {other:?}"),
        };
        let after = match partition_budget(&budget, &without) {
            Partition::Fits { remaining } => remaining,
            other => panic!("expected fit, got {other:?}"),
        };
        assert_eq!(before["cpu"] + 4_000, after["cpu"]);
        assert_eq!(
            before["memory"] + 4 * 1_000 * (1i128 << 30),
            after["memory"]
        );
        assert_eq!(after["cpu"], 6_000);
    }

    #[test]
    fn quantity_map_round_trip() {
        let mut qs = BTreeMap::new();
        qs.insert("cpu".to_string(), Quantity("1500m".to_string()));
        qs.insert("memory".to_string(), Quantity("2Gi".to_string()));
        let ms = demand_millis(&qs).unwrap();
        let back = millis_to_quantities(&ms);
        assert_eq!(back["cpu"].0, "1500m");
        assert_eq!(back["memory"].0, "2147483648");
    }
}
