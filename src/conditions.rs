/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/conditions.rs
*
* The condition ledger of an EphemeralCluster. Conditions are unique by type
* and keep the order in which each type first appeared, so the serialized
* list is stable across reconciliations. An upsert only rewrites an entry
* (and its transition time) when status, reason or message actually change,
* which keeps repeated passes from producing spurious status writes.
*
* SPDX-License-Identifier: Apache-2.0
*/

use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionType {
    /// Covers creating the ProwJob and the provisioning that follows.
    ClusterProvisioning,
    ClusterReady,
    TestCompleted,
    ProwJobCompleted,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
}

impl From<bool> for ConditionStatus {
    fn from(b: bool) -> Self {
        if b {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralClusterCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// RFC 3339, UTC, seconds precision.
    pub last_transition_time: String,
}

/// Ordered, type-unique set of conditions. Serialized as a plain list.
#[derive(Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(transparent)]
pub struct Conditions(Vec<EphemeralClusterCondition>);

// Stored lists may repeat a type; decoding collapses them to the last entry.
impl<'de> Deserialize<'de> for Conditions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Vec::<EphemeralClusterCondition>::deserialize(deserializer).map(Conditions::from)
    }
}

impl Conditions {
    pub fn get(&self, type_: ConditionType) -> Option<&EphemeralClusterCondition> {
        self.0.iter().find(|c| c.type_ == type_)
    }

    pub fn is_true(&self, type_: ConditionType) -> bool {
        self.get(type_)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }

    pub fn iter(&self) -> impl Iterator<Item = &EphemeralClusterCondition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Records a condition. Returns whether the ledger changed.
    ///
    /// An entry of the same type is replaced, and stamped with `now`, only when
    /// its status, reason or message differ. Otherwise the original transition
    /// time is kept. New types are appended.
    pub fn upsert(
        &mut self,
        type_: ConditionType,
        status: impl Into<ConditionStatus>,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let status = status.into();
        let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);

        match self.0.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return false;
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                existing.last_transition_time = stamp;
                true
            }
            None => {
                self.0.push(EphemeralClusterCondition {
                    type_,
                    status,
                    reason: reason.to_string(),
                    message: message.to_string(),
                    last_transition_time: stamp,
                });
                true
            }
        }
    }
}

impl From<Vec<EphemeralClusterCondition>> for Conditions {
    fn from(list: Vec<EphemeralClusterCondition>) -> Self {
        let mut conditions = Conditions::default();
        for c in list {
            match conditions.0.iter_mut().find(|e| e.type_ == c.type_) {
                Some(existing) => *existing = c,
                None => conditions.0.push(c),
            }
        }
        conditions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn appends_new_types_in_order() {
        let mut c = Conditions::default();
        assert!(c.upsert(ConditionType::ClusterProvisioning, true, "r", "", at(0)));
        assert!(c.upsert(ConditionType::ClusterReady, false, "", "kubeconfig not ready", at(1)));

        let types: Vec<_> = c.iter().map(|c| c.type_).collect();
        assert_eq!(types, vec![ConditionType::ClusterProvisioning, ConditionType::ClusterReady]);
        assert_eq!(c.get(ConditionType::ClusterReady).unwrap().last_transition_time, "2023-11-14T22:13:21Z");
    }

    #[test]
    fn identical_upsert_keeps_original_time() {
        let mut c = Conditions::default();
        c.upsert(ConditionType::ClusterReady, true, "", "", at(0));
        let before = c.clone();

        assert!(!c.upsert(ConditionType::ClusterReady, true, "", "", at(600)));
        assert_eq!(c, before);
    }

    #[test]
    fn changed_message_restamps_in_place() {
        let mut c = Conditions::default();
        c.upsert(ConditionType::ClusterProvisioning, true, "a", "", at(0));
        c.upsert(ConditionType::ClusterReady, false, "", "ci-operator namespace not found", at(0));

        assert!(c.upsert(ConditionType::ClusterReady, false, "", "kubeconfig not ready", at(30)));
        assert_eq!(c.len(), 2);
        let ready = c.get(ConditionType::ClusterReady).unwrap();
        assert_eq!(ready.message, "kubeconfig not ready");
        assert_eq!(ready.last_transition_time, at(30).to_rfc3339_opts(SecondsFormat::Secs, true));
        assert_eq!(c.iter().last().unwrap().type_, ConditionType::ClusterReady);
    }

    #[test]
    fn duplicates_on_the_wire_collapse_to_last() {
        let mut c: Conditions = serde_json::from_value(serde_json::json!([
            {"type": "ClusterReady", "status": "True", "lastTransitionTime": "2025-01-01T00:00:00Z"},
            {"type": "TestCompleted", "status": "False", "lastTransitionTime": "2025-01-01T00:00:00Z"},
            {"type": "TestCompleted", "status": "True", "lastTransitionTime": "2025-01-01T00:01:00Z"}
        ]))
        .unwrap();
        assert_eq!(c.len(), 2);
        assert!(c.is_true(ConditionType::TestCompleted));

        assert!(!c.upsert(ConditionType::TestCompleted, true, "", "", at(0)));
        assert_eq!(c.len(), 2);
        assert_eq!(
            c.get(ConditionType::TestCompleted).unwrap().last_transition_time,
            "2025-01-01T00:01:00Z"
        );
    }

    #[test]
    fn stored_status_is_decoded_type_unique() {
        let status: crate::crds::EphemeralClusterStatus = serde_json::from_value(serde_json::json!({
            "phase": "Ready",
            "conditions": [
                {"type": "TestCompleted", "status": "False", "lastTransitionTime": "2025-01-01T00:00:00Z"},
                {"type": "TestCompleted", "status": "True", "lastTransitionTime": "2025-01-01T00:01:00Z"}
            ]
        }))
        .unwrap();
        assert_eq!(status.conditions.len(), 1);
        assert!(status.conditions.is_true(ConditionType::TestCompleted));

        let wire = serde_json::to_value(&status.conditions).unwrap();
        assert_eq!(wire.as_array().map(Vec::len), Some(1));
    }
}
