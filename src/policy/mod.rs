/// Routing policy evaluation
///
/// Policies are checked in ascending priority order; the first active policy
/// whose conditions all match decides the request. A policy with no
/// conditions always matches, which makes it a catch-all at its priority.
use std::collections::HashMap;

use http::HeaderMap;
use rand::Rng;
use regex::Regex;

use crate::core::{ConditionType, PolicyCondition, PolicyOperator, RoutingPolicy};

/// Country header set by the edge in front of the control plane
pub const GEO_COUNTRY_HEADER: &str = "x-geo-country";

/// Request facts a policy can inspect
pub struct PolicyInput<'a> {
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub query: HashMap<String, String>,
}

impl<'a> PolicyInput<'a> {
    pub fn new(path: &'a str, headers: &'a HeaderMap, raw_query: Option<&str>) -> Self {
        Self {
            path,
            headers,
            query: parse_query(raw_query),
        }
    }
}

/// Split a raw query string into a map; later duplicates win
pub fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let mut query = HashMap::new();
    if let Some(raw) = raw {
        for pair in raw.split('&') {
            if pair.is_empty() {
                continue;
            }
            let mut parts = pair.splitn(2, '=');
            let key = parts.next().unwrap_or_default();
            let value = parts.next().unwrap_or_default();
            query.insert(key.to_string(), value.to_string());
        }
    }
    query
}

#[derive(Default)]
pub struct PolicyEvaluator;

impl PolicyEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// First active policy (lowest priority value) whose conditions all match
    pub fn select_policy<'a>(
        &self,
        policies: &'a [RoutingPolicy],
        input: &PolicyInput<'_>,
    ) -> Option<&'a RoutingPolicy> {
        let mut candidates: Vec<&RoutingPolicy> =
            policies.iter().filter(|p| p.is_active).collect();
        candidates.sort_by_key(|p| p.priority);
        candidates.into_iter().find(|p| self.matches(p, input))
    }

    /// AND over all conditions; an empty list always matches
    pub fn matches(&self, policy: &RoutingPolicy, input: &PolicyInput<'_>) -> bool {
        policy
            .conditions
            .iter()
            .all(|cond| self.condition_matches(cond, input))
    }

    fn condition_matches(&self, cond: &PolicyCondition, input: &PolicyInput<'_>) -> bool {
        match cond.condition_type {
            ConditionType::Percentage => {
                // Operand is the percentage of requests that match; each
                // evaluation draws independently
                let pct: f64 = match cond.value.parse() {
                    Ok(p) => p,
                    Err(_) => return false,
                };
                rand::thread_rng().gen_range(0.0..100.0) < pct
            }
            ConditionType::Time => {
                let now = chrono::Utc::now();
                let minutes = chrono::Timelike::hour(&now) * 60 + chrono::Timelike::minute(&now);
                Self::time_matches(minutes, cond.operator, &cond.value)
            }
            ConditionType::Header => {
                let actual = cond
                    .key
                    .as_deref()
                    .and_then(|k| input.headers.get(k))
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_string());
                Self::apply_operator(cond.operator, actual.as_deref(), &cond.value)
            }
            ConditionType::Path => {
                Self::apply_operator(cond.operator, Some(input.path), &cond.value)
            }
            ConditionType::Query => {
                let actual = cond
                    .key
                    .as_deref()
                    .and_then(|k| input.query.get(k))
                    .map(|v| v.as_str());
                Self::apply_operator(cond.operator, actual, &cond.value)
            }
            ConditionType::Geo => {
                let actual = input
                    .headers
                    .get(GEO_COUNTRY_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.to_uppercase());
                Self::apply_operator(
                    cond.operator,
                    actual.as_deref(),
                    &cond.value.to_uppercase(),
                )
            }
        }
    }

    /// Absent values satisfy only NOT_IN (the value is certainly not in the
    /// list); every other operator fails on a missing value.
    fn apply_operator(op: PolicyOperator, actual: Option<&str>, expected: &str) -> bool {
        let actual = match actual {
            Some(v) => v,
            None => return op == PolicyOperator::NotIn,
        };

        match op {
            PolicyOperator::Equals => actual == expected,
            PolicyOperator::Contains => actual.contains(expected),
            PolicyOperator::Regex => match Regex::new(expected) {
                Ok(re) => re.is_match(actual),
                Err(err) => {
                    log::warn!("Invalid policy regex '{}': {}", expected, err);
                    false
                }
            },
            PolicyOperator::In => expected.split(',').any(|item| item.trim() == actual),
            PolicyOperator::NotIn => !expected.split(',').any(|item| item.trim() == actual),
            PolicyOperator::Gt => match (actual.parse::<f64>(), expected.parse::<f64>()) {
                (Ok(a), Ok(e)) => a > e,
                _ => false,
            },
            PolicyOperator::Lt => match (actual.parse::<f64>(), expected.parse::<f64>()) {
                (Ok(a), Ok(e)) => a < e,
                _ => false,
            },
            PolicyOperator::Between => {
                let mut bounds = expected.splitn(2, ',');
                match (
                    actual.parse::<f64>(),
                    bounds.next().and_then(|b| b.trim().parse::<f64>().ok()),
                    bounds.next().and_then(|b| b.trim().parse::<f64>().ok()),
                ) {
                    (Ok(a), Some(low), Some(high)) => a >= low && a <= high,
                    _ => false,
                }
            }
        }
    }

    /// Time conditions compare minutes-of-day (UTC) against "HH:MM" operands.
    /// BETWEEN ranges that cross midnight wrap.
    fn time_matches(now_minutes: u32, op: PolicyOperator, value: &str) -> bool {
        match op {
            PolicyOperator::Between => {
                let mut bounds = value.splitn(2, ',');
                let (start, end) = match (
                    bounds.next().and_then(Self::minutes_of_day),
                    bounds.next().and_then(Self::minutes_of_day),
                ) {
                    (Some(s), Some(e)) => (s, e),
                    _ => return false,
                };
                if start <= end {
                    now_minutes >= start && now_minutes <= end
                } else {
                    now_minutes >= start || now_minutes <= end
                }
            }
            PolicyOperator::Gt => {
                Self::minutes_of_day(value).is_some_and(|m| now_minutes > m)
            }
            PolicyOperator::Lt => {
                Self::minutes_of_day(value).is_some_and(|m| now_minutes < m)
            }
            PolicyOperator::Equals => {
                Self::minutes_of_day(value).is_some_and(|m| now_minutes == m)
            }
            _ => false,
        }
    }

    fn minutes_of_day(hhmm: &str) -> Option<u32> {
        let mut parts = hhmm.trim().splitn(2, ':');
        let hours: u32 = parts.next()?.parse().ok()?;
        let minutes: u32 = parts.next()?.parse().ok()?;
        if hours > 23 || minutes > 59 {
            return None;
        }
        Some(hours * 60 + minutes)
    }
}
