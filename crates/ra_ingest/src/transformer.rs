//! Manifest → Container / Result / State records.
//!
//! Embedded results are processed inline; fragment files are read and parsed
//! concurrently, one task per fragment. Every result has a rank (embedded
//! first, fragments after, in discovery order) and the container's
//! class/method index stores that rank, whatever order the tasks finish in.

use crate::error::IngestError;
use crate::manifest::{RawManifest, RawResult};
use crate::models::{short_identifier, Container, State, TestResult};
use chrono::DateTime;
use ra_types::ObjectId;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Outcome written over a result whose state UUIDs repeat.
pub const PARSER_ERROR: &str = "PARSER_ERROR";

/// A result with its states, all linked to one container.
#[derive(Debug, Clone)]
pub struct ProcessedResult {
    pub result: TestResult,
    pub states: Vec<State>,
    /// False once a state UUID repeated
    pub uuids_unique: bool,
}

/// A fragment that could not be turned into a result.
#[derive(Debug)]
pub struct FragmentFailure {
    pub path: PathBuf,
    pub error: IngestError,
}

/// Flattened bundle, ready for the sequencer.
#[derive(Debug)]
pub struct Transformed {
    pub container: Container,
    pub results: Vec<TestResult>,
    pub states: Vec<State>,
    pub failures: Vec<FragmentFailure>,
}

/// Turn one raw result into linked records.
///
/// States are kept in order until the first repeated UUID. From there on
/// every state is dropped and the result is marked `PARSER_ERROR`.
pub fn process_result(raw: RawResult, container_id: ObjectId) -> ProcessedResult {
    let result_id = ObjectId::new();
    let qualified_name = raw.test_method.qualified_name();
    let mut outcome = raw.result;

    let mut seen = HashSet::with_capacity(raw.states.len());
    let mut uuids_unique = true;
    let mut states = Vec::with_capacity(raw.states.len());
    let mut state_index = BTreeMap::new();

    for raw_state in raw.states {
        if !uuids_unique {
            continue;
        }
        if !seen.insert(raw_state.uuid.clone()) {
            tracing::warn!(
                test = %qualified_name,
                uuid = %raw_state.uuid,
                "state uuids are not unique, marking result as {}",
                PARSER_ERROR
            );
            uuids_unique = false;
            outcome = PARSER_ERROR.to_string();
            continue;
        }
        state_index.insert(raw_state.uuid.clone(), states.len());
        states.push(State::from_raw(raw_state, container_id, result_id));
    }

    let result = TestResult {
        id: result_id,
        container_id,
        test_method: raw.test_method,
        result: outcome,
        disabled_reason: raw.disabled_reason,
        failed_reason: raw.failed_reason,
        stacktrace: raw.stacktrace,
        elapsed_time: raw.elapsed_time,
        states_count: raw.states_count.unwrap_or(states.len() as u64),
        states: states.iter().map(|s| s.id).collect(),
        state_index,
        score: raw.score,
        failure_inducing_combinations: raw.failure_inducing_combinations,
        has_state_with_additional_result_information: raw
            .has_state_with_additional_result_information,
        has_varying_additional_result_information: raw.has_varying_additional_result_information,
    };

    ProcessedResult {
        result,
        states,
        uuids_unique,
    }
}

/// Class/method key → result rank, shared by the fragment tasks of one
/// container.
#[derive(Clone, Default)]
struct ClassMethodIndex {
    inner: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl ClassMethodIndex {
    /// A key seen twice keeps its highest rank, whatever order the fragment
    /// tasks finish in.
    async fn record(&self, key: String, rank: usize) {
        let mut map = self.inner.lock().await;
        let slot = map.entry(key.clone()).or_insert(rank);
        if *slot != rank {
            let previous = *slot;
            *slot = previous.max(rank);
            tracing::debug!(%key, previous, rank, kept = *slot, "class/method key seen twice");
        }
    }

    async fn into_map(self) -> BTreeMap<String, usize> {
        std::mem::take(&mut *self.inner.lock().await)
    }
}

/// Flatten a bundle into records.
///
/// `identifier` is the final external identifier (suffix already applied).
/// Fragment failures are collected, never fatal.
pub async fn transform_bundle(
    mut manifest: RawManifest,
    identifier: String,
    fragment_paths: &[PathBuf],
) -> Transformed {
    let container_id = ObjectId::new();
    let embedded = manifest.take_tree().flatten();
    let first_fragment_rank = embedded.len();
    let mut slots: Vec<Option<ProcessedResult>> =
        Vec::with_capacity(first_fragment_rank + fragment_paths.len());
    let index = ClassMethodIndex::default();

    for (rank, raw) in embedded.into_iter().enumerate() {
        let processed = process_result(raw, container_id);
        index
            .record(processed.result.test_method.composite_key(), rank)
            .await;
        slots.push(Some(processed));
    }
    slots.resize_with(first_fragment_rank + fragment_paths.len(), || None);

    let mut tasks = JoinSet::new();
    for (offset, path) in fragment_paths.iter().enumerate() {
        let rank = first_fragment_rank + offset;
        let path = path.clone();
        let index = index.clone();
        let span = tracing::debug_span!("fragment", path = %path.display(), rank);
        tasks.spawn(
            async move {
                let outcome = load_fragment(&path, container_id).await;
                if let Ok(processed) = &outcome {
                    index
                        .record(processed.result.test_method.composite_key(), rank)
                        .await;
                }
                (rank, path, outcome)
            }
            .instrument(span),
        );
    }

    let mut failures = Vec::new();
    let mut settled = vec![false; fragment_paths.len()];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((rank, _, Ok(processed))) => {
                settled[rank - first_fragment_rank] = true;
                slots[rank] = Some(processed);
            }
            Ok((rank, path, Err(error))) => {
                settled[rank - first_fragment_rank] = true;
                tracing::error!(path = %path.display(), %error, "dropping result fragment");
                failures.push(FragmentFailure { path, error });
            }
            Err(join_error) => {
                tracing::error!(error = %join_error, "fragment task failed");
            }
        }
    }
    for (offset, done) in settled.into_iter().enumerate() {
        if !done {
            failures.push(FragmentFailure {
                path: fragment_paths[offset].clone(),
                error: IngestError::Task("fragment task did not complete".to_string()),
            });
        }
    }
    failures.sort_by(|a, b| a.path.cmp(&b.path));

    let class_method_index = index.into_map().await;
    let test_results = slots
        .iter()
        .map(|slot| slot.as_ref().map(|p| p.result.id))
        .collect();

    let mut results = Vec::with_capacity(slots.len());
    let mut states = Vec::new();
    for processed in slots.into_iter().flatten() {
        results.push(processed.result);
        states.extend(processed.states);
    }

    let container = Container {
        id: container_id,
        short_identifier: short_identifier(&identifier),
        identifier,
        date: DateTime::from_timestamp_millis(manifest.date_int).unwrap_or_default(),
        display_name: manifest.display_name,
        test_endpoint_mode: manifest.test_endpoint_mode,
        elapsed_time: manifest.elapsed_time.unwrap_or_default(),
        failed_tests: manifest.failed_tests,
        succeeded_tests: manifest.succeeded_tests,
        disabled_tests: manifest.disabled_tests,
        states_count: manifest.states_count.unwrap_or(states.len() as u64),
        score: manifest.score,
        test_results,
        class_method_index,
        keylog_storage_id: None,
        pcap_storage_id: None,
    };

    Transformed {
        container,
        results,
        states,
        failures,
    }
}

async fn load_fragment(path: &Path, container_id: ObjectId) -> Result<ProcessedResult, IngestError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| IngestError::io(path, e))?;
    let raw = RawResult::from_slice(&bytes, path)?;
    Ok(process_result(raw, container_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{RawState, TestMethod};
    use proptest::prelude::*;
    use serde_json::json;

    fn raw_result(class: &str, method: &str, uuids: &[&str]) -> RawResult {
        RawResult {
            test_method: TestMethod {
                class_name: class.to_string(),
                method_name: method.to_string(),
                ..TestMethod::default()
            },
            result: "SUCCEEDED".to_string(),
            states: uuids
                .iter()
                .map(|u| RawState {
                    uuid: u.to_string(),
                    ..RawState::default()
                })
                .collect(),
            ..RawResult::default()
        }
    }

    fn fragment_json(class: &str, method: &str, uuids: &[&str]) -> String {
        let states: Vec<_> = uuids.iter().map(|u| json!({"uuid": u})).collect();
        json!({
            "TestMethod": {"ClassName": class, "MethodName": method},
            "Result": "FAILED",
            "States": states,
        })
        .to_string()
    }

    #[test]
    fn repeated_uuid_drops_the_rest_and_marks_parser_error() {
        let container_id = ObjectId::new();
        let processed = process_result(raw_result("A", "m", &["a", "b", "a", "c"]), container_id);

        let kept: Vec<_> = processed.states.iter().map(|s| s.uuid.as_str()).collect();
        assert_eq!(kept, vec!["a", "b"]);
        assert_eq!(processed.result.result, PARSER_ERROR);
        assert!(!processed.uuids_unique);
        assert_eq!(processed.result.states.len(), 2);
        assert_eq!(processed.result.state_index.len(), 2);
        assert_eq!(processed.result.state_index["b"], 1);
    }

    #[test]
    fn unique_states_keep_the_outcome() {
        let container_id = ObjectId::new();
        let processed = process_result(raw_result("A", "m", &["x", "y"]), container_id);

        assert_eq!(processed.result.result, "SUCCEEDED");
        assert!(processed.uuids_unique);
        assert_eq!(processed.result.states_count, 2);
        for (i, state) in processed.states.iter().enumerate() {
            assert_eq!(state.container_id, container_id);
            assert_eq!(state.test_result_id, processed.result.id);
            assert_eq!(processed.result.states[i], state.id);
            assert_eq!(processed.result.state_index[&state.uuid], i);
        }
    }

    proptest! {
        #[test]
        fn kept_states_are_the_unique_prefix(uuids in proptest::collection::vec("[a-e]", 0..12)) {
            let refs: Vec<&str> = uuids.iter().map(String::as_str).collect();
            let processed = process_result(raw_result("P", "q", &refs), ObjectId::new());

            let mut seen = HashSet::new();
            let prefix: Vec<&str> = refs.iter().copied().take_while(|u| seen.insert(*u)).collect();
            let kept: Vec<&str> = processed.states.iter().map(|s| s.uuid.as_str()).collect();
            prop_assert_eq!(&kept, &prefix);
            prop_assert_eq!(processed.uuids_unique, prefix.len() == refs.len());
            prop_assert_eq!(processed.result.result == PARSER_ERROR, prefix.len() != refs.len());
            prop_assert_eq!(processed.result.states.len(), processed.result.state_index.len());
        }
    }

    #[tokio::test]
    async fn bundle_records_are_cross_linked() {
        let dir = tempfile::tempdir().unwrap();
        let fragment = dir.path().join("_containerResult.json");
        std::fs::write(&fragment, fragment_json("B", "n", &["s1", "s2"])).unwrap();

        let mut manifest = RawManifest {
            identifier: "run-000123-AB".to_string(),
            date_int: 1_700_000_000_000,
            ..RawManifest::default()
        };
        manifest.test_results = Some(vec![raw_result("A", "m", &["u1"])]);

        let out = transform_bundle(manifest, "run-000123-AB".to_string(), &[fragment]).await;
        assert!(out.failures.is_empty());
        assert_eq!(out.results.len(), 2);
        assert_eq!(out.states.len(), 3);
        assert_eq!(out.container.states_count, 3);
        assert_eq!(out.container.short_identifier.as_deref(), Some("run-000123"));
        assert_eq!(out.container.date.timestamp_millis(), 1_700_000_000_000);

        for result in &out.results {
            assert_eq!(result.container_id, out.container.id);
        }
        for state in &out.states {
            assert_eq!(state.container_id, out.container.id);
            let owner = out
                .results
                .iter()
                .find(|r| r.id == state.test_result_id)
                .expect("state owner present");
            assert!(owner.states.contains(&state.id));
        }
        assert_eq!(out.container.class_method_index["A||m"], 0);
        assert_eq!(out.container.class_method_index["B||n"], 1);
        assert_eq!(out.container.result_id_for("B||n"), Some(out.results[1].id));
    }

    #[tokio::test]
    async fn broken_fragment_leaves_an_empty_slot() {
        let dir = tempfile::tempdir().unwrap();
        let good_a = dir.path().join("a/_containerResult.json");
        let broken = dir.path().join("b/_containerResult.json");
        let good_c = dir.path().join("c/_containerResult.json");
        for path in [&good_a, &broken, &good_c] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        }
        std::fs::write(&good_a, fragment_json("pkg.A", "one", &["1"])).unwrap();
        std::fs::write(&broken, "{\"TestMethod\": ").unwrap();
        std::fs::write(&good_c, fragment_json("pkg.C", "three", &["3"])).unwrap();

        let out = transform_bundle(
            RawManifest::default(),
            "run-x".to_string(),
            &[good_a, broken.clone(), good_c],
        )
        .await;

        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].path, broken);
        assert!(matches!(out.failures[0].error, IngestError::Parse { .. }));

        assert_eq!(out.container.test_results.len(), 3);
        assert!(out.container.test_results[1].is_none());
        assert_eq!(out.container.class_method_index["pkg||A||one"], 0);
        assert_eq!(out.container.class_method_index["pkg||C||three"], 2);
        assert_eq!(
            out.container.result_id_for("pkg||C||three"),
            out.results.iter().find(|r| r.test_method.method_name == "three").map(|r| r.id)
        );
        assert_eq!(out.container.short_identifier, None);
    }

    #[tokio::test]
    async fn nested_classes_are_flattened_in_walk_order() {
        let mut inner = RawManifest::default();
        inner.test_results = Some(vec![raw_result("C", "inner", &[])]);
        let mut manifest = RawManifest {
            states_count: Some(42),
            ..RawManifest::default()
        };
        manifest.test_results = Some(vec![raw_result("C", "outer", &[])]);
        manifest.test_classes = Some(vec![inner]);

        let out = transform_bundle(manifest, "nested-report".to_string(), &[]).await;
        let names: Vec<_> = out
            .results
            .iter()
            .map(|r| r.test_method.method_name.as_str())
            .collect();
        assert_eq!(names, vec!["outer", "inner"]);
        assert_eq!(out.container.states_count, 42);
    }

    #[tokio::test]
    async fn repeated_class_method_keeps_the_highest_rank() {
        for ranks in [[4, 1], [1, 4]] {
            let index = ClassMethodIndex::default();
            for rank in ranks {
                index.record("A||m".to_string(), rank).await;
            }
            index.record("B||n".to_string(), 2).await;
            let map = index.into_map().await;
            assert_eq!(map["A||m"], 4, "order {ranks:?}");
            assert_eq!(map["B||n"], 2);
        }
    }
}
