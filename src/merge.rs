//! Response merging.
//!
//! # Responsibilities
//! - Union find answers into one sorted, duplicate-free path list
//! - Overlay render answers per metric onto one grid
//! - Decide whether the result is complete or partial
//!
//! # Design Decisions
//! - Pure function of the query and the fan-out: no I/O, no clocks
//! - For each slot the first non-null value in arrival order wins
//! - Failed calls contribute nothing but still count against completeness

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::dispatch::{FanOut, GroupRecord};
use crate::group::SelectionPolicy;
use crate::query::{Query, QueryKind, TimeRange};
use crate::response::{Completeness, MergedPayload, MergedResult, Payload, PartialResponse, Series};

/// Combine the successful responses of a fan-out.
pub fn merge(query: &Query, fan_out: &FanOut) -> MergedResult {
    let payload = match query.kind() {
        QueryKind::Find => MergedPayload::Paths(merge_paths(&fan_out.responses)),
        QueryKind::Render => MergedPayload::Series(merge_series(query, &fan_out.responses)),
    };

    MergedResult {
        payload,
        completeness: completeness(&fan_out.groups, &fan_out.responses),
        summary: fan_out.summary,
    }
}

fn merge_paths(responses: &[PartialResponse]) -> Vec<String> {
    let mut paths = BTreeSet::new();
    for resp in responses {
        if let Some(Payload::Paths(p)) = resp.payload() {
            paths.extend(p.iter().cloned());
        }
    }
    paths.into_iter().collect()
}

fn merge_series(query: &Query, responses: &[PartialResponse]) -> Vec<Series> {
    // Arrival order per metric name.
    let mut by_name: BTreeMap<&str, Vec<&Series>> = BTreeMap::new();
    for resp in responses {
        if let Some(Payload::Series(series)) = resp.payload() {
            for s in series {
                by_name.entry(s.name.as_str()).or_default().push(s);
            }
        }
    }

    let Some(range) = query.range() else {
        return Vec::new();
    };

    by_name
        .into_iter()
        .map(|(name, sources)| {
            let step = match query.step() {
                Some(step) => step,
                None => {
                    let arrived = sources
                        .first()
                        .map(|s| s.step)
                        .filter(|step| *step > 0)
                        .unwrap_or(crate::dispatch::transport::DEFAULT_STEP);
                    // Coarsen a fine backend step until the range fits.
                    range.fit_step(arrived, query.max_points()).unwrap_or(u32::MAX)
                }
            };
            overlay(name, range, step, query.max_points(), &sources)
        })
        .collect()
}

/// Lay `sources` over the slots of the range, first non-null wins.
///
/// At most `max_points` slots are allocated; points past them are dropped.
fn overlay(name: &str, range: TimeRange, step: u32, max_points: usize, sources: &[&Series]) -> Series {
    let step = step.max(1);
    let slots = usize::try_from(range.slots(step))
        .unwrap_or(usize::MAX)
        .min(max_points);
    let mut values: Vec<Option<f64>> = vec![None; slots];

    for source in sources {
        for (ts, value) in source.points() {
            let Some(v) = value else {
                continue;
            };
            if ts < range.from || ts >= range.until {
                continue;
            }
            let slot = ts.abs_diff(range.from) / u64::from(step);
            let Some(cell) = usize::try_from(slot).ok().and_then(|i| values.get_mut(i)) else {
                continue;
            };
            if cell.is_none() {
                *cell = Some(v);
            }
        }
    }

    Series {
        name: name.to_string(),
        start: range.from,
        step,
        values,
    }
}

/// Partial when a group contributed nothing it was expected to.
///
/// - a group with no admitted backend is partial
/// - broadcast: every selected backend must have answered successfully
/// - prefer_first: one backend of the chain must have answered successfully
fn completeness(groups: &[GroupRecord], responses: &[PartialResponse]) -> Completeness {
    let succeeded: HashSet<(&str, &str)> = responses
        .iter()
        .filter(|r| r.result.is_ok())
        .map(|r| (r.group.as_ref(), r.backend.as_ref()))
        .collect();

    let group_complete = |group: &GroupRecord| {
        if group.is_empty() {
            return false;
        }
        let ok = |backend: &std::sync::Arc<str>| succeeded.contains(&(group.name.as_ref(), backend.as_ref()));
        match group.policy {
            SelectionPolicy::Broadcast => group.selected.iter().all(ok),
            SelectionPolicy::PreferFirst => group.selected.iter().any(ok),
        }
    };

    if groups.iter().all(group_complete) {
        Completeness::Complete
    } else {
        Completeness::Partial
    }
}
