//! Status conditions: an ordered, unique-by-type set with transition bookkeeping.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionType {
    Reconciled,
    ResourcesReady,
    Ready,
    Started,
    Completed,
}

impl ConditionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConditionType::Reconciled => "Reconciled",
            ConditionType::ResourcesReady => "ResourcesReady",
            ConditionType::Ready => "Ready",
            ConditionType::Started => "Started",
            ConditionType::Completed => "Completed",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown condition type: {0}")]
pub struct UnknownConditionType(pub String);

impl FromStr for ConditionType {
    type Err = UnknownConditionType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Reconciled" => Ok(ConditionType::Reconciled),
            "ResourcesReady" => Ok(ConditionType::ResourcesReady),
            "Ready" => Ok(ConditionType::Ready),
            "Started" => Ok(ConditionType::Started),
            "Completed" => Ok(ConditionType::Completed),
            other => Err(UnknownConditionType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn from_bool(b: bool) -> Self { if b { ConditionStatus::True } else { ConditionStatus::False } }
    pub fn is_true(self) -> bool { self == ConditionStatus::True }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => f.write_str("True"),
            ConditionStatus::False => f.write_str("False"),
            ConditionStatus::Unknown => f.write_str("Unknown"),
        }
    }
}

impl FromStr for ConditionStatus {
    type Err = std::convert::Infallible;

    /// Anything other than "True"/"False" reads as Unknown, matching apiserver conventions.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "True" => ConditionStatus::True,
            "False" => ConditionStatus::False,
            _ => ConditionStatus::Unknown,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub last_update_time: DateTime<Utc>,
}

/// The caller-supplied part of a condition; timestamps are owned by the set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionUpdate {
    pub type_: ConditionType,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
}

impl ConditionUpdate {
    pub fn new(type_: ConditionType, status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self { type_, status, reason: reason.into(), message: message.into() }
    }

    /// `True` with empty reason and message.
    pub fn truthy(type_: ConditionType) -> Self { Self::new(type_, ConditionStatus::True, "", "") }

    pub fn falsy(type_: ConditionType, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(type_, ConditionStatus::False, reason, message)
    }
}

impl Condition {
    pub fn fresh(update: ConditionUpdate, now: DateTime<Utc>) -> Self {
        Self {
            type_: update.type_,
            status: update.status,
            reason: update.reason,
            message: update.message,
            last_transition_time: now,
            last_update_time: now,
        }
    }

    /// Apply an update to an existing entry of the same type.
    /// The transition time only moves when the status flips.
    pub fn apply(&mut self, update: ConditionUpdate, now: DateTime<Utc>) {
        debug_assert_eq!(self.type_, update.type_);
        if self.status != update.status {
            self.status = update.status;
            self.last_transition_time = now;
        }
        self.reason = update.reason;
        self.message = update.message;
        self.last_update_time = now;
    }

    /// Whether `last_update_time` was ever recorded.
    pub fn has_update_time(&self) -> bool { self.last_update_time.timestamp() > 0 }
}

/// At most one condition per type; existing entries keep their position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct ConditionSet(SmallVec<[Condition; 4]>);

impl ConditionSet {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &Condition> { self.0.iter() }

    pub fn index_of(&self, type_: ConditionType) -> Option<usize> {
        self.0.iter().position(|c| c.type_ == type_)
    }

    pub fn get(&self, type_: ConditionType) -> Option<&Condition> {
        self.index_of(type_).map(|i| &self.0[i])
    }

    /// Status of `type_`, `Unknown` when absent.
    pub fn status_of(&self, type_: ConditionType) -> ConditionStatus {
        self.get(type_).map(|c| c.status).unwrap_or_default()
    }

    pub fn is_true(&self, type_: ConditionType) -> bool { self.status_of(type_).is_true() }

    /// Insert or update by type. Returns the index of the entry.
    pub fn upsert(&mut self, update: ConditionUpdate, now: DateTime<Utc>) -> usize {
        match self.index_of(update.type_) {
            Some(idx) => {
                self.update_at(idx, update, now);
                idx
            }
            None => {
                self.0.push(Condition::fresh(update, now));
                self.0.len() - 1
            }
        }
    }

    /// Update the entry at `idx` in place. The update must carry the same type.
    pub fn update_at(&mut self, idx: usize, update: ConditionUpdate, now: DateTime<Utc>) {
        if let Some(c) = self.0.get_mut(idx) {
            if c.type_ == update.type_ { c.apply(update, now); }
        }
    }
}

impl<'a> IntoIterator for &'a ConditionSet {
    type Item = &'a Condition;
    type IntoIter = std::slice::Iter<'a, Condition>;
    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> { DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap() }

    #[test]
    fn absent_type_is_appended_with_both_timestamps() {
        let mut set = ConditionSet::new();
        set.upsert(ConditionUpdate::falsy(ConditionType::Ready, "NotReady", "waiting"), at(0));
        let c = set.get(ConditionType::Ready).unwrap();
        assert_eq!(c.status, ConditionStatus::False);
        assert_eq!(c.last_transition_time, at(0));
        assert_eq!(c.last_update_time, at(0));
    }

    #[test]
    fn unchanged_status_only_moves_update_time() {
        let mut set = ConditionSet::new();
        set.upsert(ConditionUpdate::falsy(ConditionType::Ready, "A", "first"), at(0));
        set.upsert(ConditionUpdate::falsy(ConditionType::Ready, "B", "second"), at(10));
        let c = set.get(ConditionType::Ready).unwrap();
        assert_eq!(c.reason, "B");
        assert_eq!(c.message, "second");
        assert_eq!(c.last_transition_time, at(0));
        assert_eq!(c.last_update_time, at(10));
    }

    #[test]
    fn changed_status_moves_both_timestamps() {
        let mut set = ConditionSet::new();
        set.upsert(ConditionUpdate::falsy(ConditionType::Ready, "A", "x"), at(0));
        set.upsert(ConditionUpdate::truthy(ConditionType::Ready), at(5));
        let c = set.get(ConditionType::Ready).unwrap();
        assert_eq!(c.status, ConditionStatus::True);
        assert_eq!(c.reason, "");
        assert_eq!(c.last_transition_time, at(5));
        assert_eq!(c.last_update_time, at(5));
    }

    #[test]
    fn never_duplicates_and_never_reorders() {
        let types = [
            ConditionType::Reconciled,
            ConditionType::ResourcesReady,
            ConditionType::Ready,
            ConditionType::Started,
            ConditionType::Completed,
        ];
        let mut set = ConditionSet::new();
        for round in 0..4i64 {
            for (i, t) in types.iter().enumerate() {
                let status = ConditionStatus::from_bool((round + i as i64) % 2 == 0);
                set.upsert(ConditionUpdate::new(*t, status, "", ""), at(round));
            }
        }
        assert_eq!(set.len(), types.len());
        let order: Vec<_> = set.iter().map(|c| c.type_).collect();
        assert_eq!(order, types);
    }

    #[test]
    fn update_at_ignores_mismatched_type() {
        let mut set = ConditionSet::new();
        let idx = set.upsert(ConditionUpdate::truthy(ConditionType::Reconciled), at(0));
        set.update_at(idx, ConditionUpdate::falsy(ConditionType::Ready, "X", "y"), at(1));
        assert!(set.is_true(ConditionType::Reconciled));
        assert!(set.get(ConditionType::Ready).is_none());
    }

    #[test]
    fn status_of_missing_type_is_unknown() {
        let set = ConditionSet::new();
        assert_eq!(set.status_of(ConditionType::Ready), ConditionStatus::Unknown);
        assert!(!set.is_true(ConditionType::Ready));
    }

    #[test]
    fn parsing_unmapped_type_is_an_error() {
        assert_eq!("ResourcesReady".parse::<ConditionType>(), Ok(ConditionType::ResourcesReady));
        let err = "Degraded".parse::<ConditionType>().unwrap_err();
        assert_eq!(err.to_string(), "unknown condition type: Degraded");
    }

    #[test]
    fn unknown_status_strings_read_as_unknown() {
        assert_eq!("True".parse::<ConditionStatus>().unwrap(), ConditionStatus::True);
        assert_eq!("maybe".parse::<ConditionStatus>().unwrap(), ConditionStatus::Unknown);
    }

    #[test]
    fn missing_update_time_is_detected() {
        let json = serde_json::json!({"type": "Started", "status": "False", "reason": "Error", "message": "m"});
        let c: Condition = serde_json::from_value(json).unwrap();
        assert!(!c.has_update_time());
    }
}
