//! Stored records: Container ⊇ Result ⊇ State.
//!
//! Field names match the documents other report tools query, so they stay
//! PascalCase on the wire.

use crate::manifest::{RawState, ScoreMap, TestMethod};
use chrono::{DateTime, Utc};
use ra_types::ObjectId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Length of the run-specific tail stripped for `ShortIdentifier`.
pub const SHORT_IDENTIFIER_TAIL: usize = 6;

/// Identifier without its last six characters; `None` when it is not longer
/// than that.
pub fn short_identifier(identifier: &str) -> Option<String> {
    let len = identifier.chars().count();
    if len <= SHORT_IDENTIFIER_TAIL {
        return None;
    }
    Some(identifier.chars().take(len - SHORT_IDENTIFIER_TAIL).collect())
}

/// One imported bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    #[serde(rename = "Identifier")]
    pub identifier: String,
    #[serde(rename = "ShortIdentifier", skip_serializing_if = "Option::is_none", default)]
    pub short_identifier: Option<String>,
    #[serde(rename = "Date")]
    pub date: DateTime<Utc>,
    #[serde(rename = "DisplayName", skip_serializing_if = "Option::is_none", default)]
    pub display_name: Option<String>,
    #[serde(rename = "TestEndpointMode", skip_serializing_if = "Option::is_none", default)]
    pub test_endpoint_mode: Option<String>,
    #[serde(rename = "ElapsedTime")]
    pub elapsed_time: i64,
    #[serde(rename = "FailedTests")]
    pub failed_tests: u64,
    #[serde(rename = "SucceededTests")]
    pub succeeded_tests: u64,
    #[serde(rename = "DisabledTests")]
    pub disabled_tests: u64,
    #[serde(rename = "StatesCount")]
    pub states_count: u64,
    #[serde(rename = "Score")]
    pub score: ScoreMap,
    /// One slot per result rank; `None` where a fragment failed to parse
    #[serde(rename = "TestResults")]
    pub test_results: Vec<Option<ObjectId>>,
    #[serde(rename = "TestResultClassMethodIndexMap")]
    pub class_method_index: BTreeMap<String, usize>,
    #[serde(rename = "KeylogfileStorageId")]
    pub keylog_storage_id: Option<ObjectId>,
    #[serde(rename = "PcapStorageId")]
    pub pcap_storage_id: Option<ObjectId>,
}

impl Container {
    pub fn result_id_for(&self, class_method_key: &str) -> Option<ObjectId> {
        let rank = *self.class_method_index.get(class_method_key)?;
        self.test_results.get(rank).copied().flatten()
    }
}

/// One test method execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    #[serde(rename = "ContainerId")]
    pub container_id: ObjectId,
    #[serde(rename = "TestMethod")]
    pub test_method: TestMethod,
    #[serde(rename = "Result")]
    pub result: String,
    #[serde(rename = "DisabledReason", skip_serializing_if = "Option::is_none", default)]
    pub disabled_reason: Option<String>,
    #[serde(rename = "FailedReason", skip_serializing_if = "Option::is_none", default)]
    pub failed_reason: Option<String>,
    #[serde(rename = "Stacktrace", skip_serializing_if = "Option::is_none", default)]
    pub stacktrace: Option<String>,
    #[serde(rename = "ElapsedTime")]
    pub elapsed_time: i64,
    #[serde(rename = "StatesCount")]
    pub states_count: u64,
    #[serde(rename = "States")]
    pub states: Vec<ObjectId>,
    #[serde(rename = "StateIndexMap")]
    pub state_index: BTreeMap<String, usize>,
    #[serde(rename = "Score")]
    pub score: ScoreMap,
    #[serde(
        rename = "FailureInducingCombinations",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub failure_inducing_combinations: Option<Vec<Value>>,
    #[serde(
        rename = "HasStateWithAdditionalResultInformation",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub has_state_with_additional_result_information: Option<bool>,
    #[serde(
        rename = "HasVaryingAdditionalResultInformation",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub has_varying_additional_result_information: Option<bool>,
}

/// One execution step of a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    #[serde(rename = "ContainerId")]
    pub container_id: ObjectId,
    #[serde(rename = "TestResultId")]
    pub test_result_id: ObjectId,
    #[serde(rename = "uuid")]
    pub uuid: String,
    #[serde(rename = "DisplayName", skip_serializing_if = "Option::is_none", default)]
    pub display_name: Option<String>,
    #[serde(rename = "Result", skip_serializing_if = "Option::is_none", default)]
    pub result: Option<String>,
    #[serde(rename = "AdditionalResultInformation")]
    pub additional_result_information: String,
    #[serde(rename = "AdditionalTestInformation")]
    pub additional_test_information: String,
    #[serde(rename = "SrcPort", skip_serializing_if = "Option::is_none", default)]
    pub src_port: Option<i64>,
    #[serde(rename = "DstPort", skip_serializing_if = "Option::is_none", default)]
    pub dst_port: Option<i64>,
    #[serde(rename = "StartTimestamp", skip_serializing_if = "Option::is_none", default)]
    pub start_timestamp: Option<String>,
    #[serde(rename = "EndTimestamp", skip_serializing_if = "Option::is_none", default)]
    pub end_timestamp: Option<String>,
    #[serde(rename = "DerivationContainer")]
    pub derivation_container: BTreeMap<String, Value>,
    #[serde(rename = "Stacktrace", skip_serializing_if = "Option::is_none", default)]
    pub stacktrace: Option<String>,
}

impl State {
    pub(crate) fn from_raw(raw: RawState, container_id: ObjectId, test_result_id: ObjectId) -> Self {
        Self {
            id: ObjectId::new(),
            container_id,
            test_result_id,
            uuid: raw.uuid,
            display_name: raw.display_name,
            result: raw.result,
            additional_result_information: raw.additional_result_information,
            additional_test_information: raw.additional_test_information,
            src_port: raw.src_port,
            dst_port: raw.dst_port,
            start_timestamp: raw.start_timestamp,
            end_timestamp: raw.end_timestamp,
            derivation_container: raw.derivation_container,
            stacktrace: raw.stacktrace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn short_identifier_strips_six_chars() {
        assert_eq!(short_identifier("run-000123-AB").as_deref(), Some("run-000123"));
        assert_eq!(short_identifier("1234567").as_deref(), Some("1"));
        assert_eq!(short_identifier("123456"), None);
        assert_eq!(short_identifier(""), None);
    }

    #[test]
    fn short_identifier_counts_characters() {
        assert_eq!(short_identifier("ä-abcdef").as_deref(), Some("ä-"));
    }

    proptest! {
        #[test]
        fn short_identifier_is_a_prefix(id in "[a-zA-Z0-9_-]{0,40}") {
            match short_identifier(&id) {
                Some(short) => {
                    prop_assert!(id.len() > SHORT_IDENTIFIER_TAIL);
                    prop_assert_eq!(short.len() + SHORT_IDENTIFIER_TAIL, id.len());
                    prop_assert!(id.starts_with(&short));
                }
                None => prop_assert!(id.len() <= SHORT_IDENTIFIER_TAIL),
            }
        }
    }

    #[test]
    fn container_serializes_ids_and_null_slots() {
        let id = ObjectId::new();
        let result_id = ObjectId::new();
        let container = Container {
            id,
            identifier: "run-000123-AB".to_string(),
            short_identifier: short_identifier("run-000123-AB"),
            date: DateTime::from_timestamp_millis(1_700_000_000_000).unwrap_or_default(),
            display_name: None,
            test_endpoint_mode: Some("CLIENT".to_string()),
            elapsed_time: 12,
            failed_tests: 0,
            succeeded_tests: 1,
            disabled_tests: 0,
            states_count: 0,
            score: ScoreMap::new(),
            test_results: vec![Some(result_id), None],
            class_method_index: BTreeMap::from([("A||m".to_string(), 0)]),
            keylog_storage_id: None,
            pcap_storage_id: None,
        };

        let value = serde_json::to_value(&container).unwrap();
        assert_eq!(value["_id"], id.to_hex());
        assert_eq!(value["ShortIdentifier"], "run-000123");
        assert_eq!(value["TestResults"][0], result_id.to_hex());
        assert!(value["TestResults"][1].is_null());
        assert!(value.get("DisplayName").is_none());
        assert!(value["KeylogfileStorageId"].is_null());
        assert_eq!(container.result_id_for("A||m"), Some(result_id));
        assert_eq!(container.result_id_for("B||m"), None);
    }
}
