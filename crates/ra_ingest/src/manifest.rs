//! On-disk report shapes as written by the test framework.
//!
//! A manifest (`summary.json`) carries aggregate counters and may embed the
//! result tree: `TestResults` are leaves, `TestClasses` are nested manifests.
//! Result fragments (`_containerResult.json`) have the `RawResult` shape.

use crate::error::IngestError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

/// Score of one test category.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Score {
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub reached: f64,
    #[serde(default)]
    pub percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity_level: Option<String>,
}

/// Category name → score.
pub type ScoreMap = BTreeMap<String, Score>;

/// Descriptor of the executed test method.
///
/// Descriptor fields other than the class/method/display names (TLS version,
/// RFC reference, key exchange, description) are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestMethod {
    #[serde(rename = "ClassName", default)]
    pub class_name: String,
    #[serde(rename = "MethodName", default)]
    pub method_name: String,
    #[serde(rename = "DisplayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "RFC", default, skip_serializing_if = "Option::is_none")]
    pub rfc: Option<Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl TestMethod {
    /// `Class.Method` with every dot replaced by `||`.
    ///
    /// Dots are not allowed in stored map keys, so the package separators of
    /// the class name are replaced as well.
    pub fn composite_key(&self) -> String {
        format!("{}.{}", self.class_name, self.method_name).replace('.', "||")
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.class_name, self.method_name)
    }
}

/// One execution step of a test method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawState {
    #[serde(rename = "uuid", default)]
    pub uuid: String,
    #[serde(rename = "DisplayName", default)]
    pub display_name: Option<String>,
    #[serde(rename = "Result", default)]
    pub result: Option<String>,
    #[serde(rename = "AdditionalResultInformation", default)]
    pub additional_result_information: String,
    #[serde(rename = "AdditionalTestInformation", default)]
    pub additional_test_information: String,
    #[serde(rename = "SrcPort", default)]
    pub src_port: Option<i64>,
    #[serde(rename = "DstPort", default)]
    pub dst_port: Option<i64>,
    #[serde(rename = "StartTimestamp", default)]
    pub start_timestamp: Option<String>,
    #[serde(rename = "EndTimestamp", default)]
    pub end_timestamp: Option<String>,
    #[serde(rename = "DerivationContainer", default)]
    pub derivation_container: BTreeMap<String, Value>,
    #[serde(rename = "Stacktrace", default)]
    pub stacktrace: Option<String>,
}

/// One test method execution, embedded or stored as a fragment file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawResult {
    #[serde(rename = "TestMethod", default)]
    pub test_method: TestMethod,
    #[serde(rename = "Result", default)]
    pub result: String,
    #[serde(rename = "DisabledReason", default)]
    pub disabled_reason: Option<String>,
    #[serde(rename = "FailedReason", default)]
    pub failed_reason: Option<String>,
    #[serde(rename = "Stacktrace", default)]
    pub stacktrace: Option<String>,
    #[serde(rename = "ElapsedTime", default)]
    pub elapsed_time: i64,
    #[serde(rename = "StatesCount", default)]
    pub states_count: Option<u64>,
    #[serde(rename = "Score", default)]
    pub score: ScoreMap,
    #[serde(rename = "FailureInducingCombinations", default)]
    pub failure_inducing_combinations: Option<Vec<Value>>,
    #[serde(rename = "HasStateWithAdditionalResultInformation", default)]
    pub has_state_with_additional_result_information: Option<bool>,
    #[serde(rename = "HasVaryingAdditionalResultInformation", default)]
    pub has_varying_additional_result_information: Option<bool>,
    #[serde(rename = "States", default)]
    pub states: Vec<RawState>,
}

/// Root report document of a bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawManifest {
    #[serde(rename = "Identifier", default)]
    pub identifier: String,
    /// Start of the run, epoch milliseconds
    #[serde(rename = "Date", default)]
    pub date_int: i64,
    #[serde(rename = "DisplayName", default)]
    pub display_name: Option<String>,
    #[serde(rename = "TestEndpointMode", default)]
    pub test_endpoint_mode: Option<String>,
    #[serde(rename = "ElapsedTime", default)]
    pub elapsed_time: Option<i64>,
    #[serde(rename = "FailedTests", default)]
    pub failed_tests: u64,
    #[serde(rename = "SucceededTests", default)]
    pub succeeded_tests: u64,
    #[serde(rename = "DisabledTests", default)]
    pub disabled_tests: u64,
    #[serde(rename = "StatesCount", default)]
    pub states_count: Option<u64>,
    #[serde(rename = "Score", default)]
    pub score: ScoreMap,
    #[serde(rename = "TestResults", default)]
    pub test_results: Option<Vec<RawResult>>,
    #[serde(rename = "TestClasses", default)]
    pub test_classes: Option<Vec<RawManifest>>,
}

impl RawManifest {
    pub fn from_slice(bytes: &[u8], path: &Path) -> Result<Self, IngestError> {
        serde_json::from_slice(bytes).map_err(|e| IngestError::parse(path, e))
    }

    /// Detach the embedded result tree. The manifest keeps only its scalars.
    pub fn take_tree(&mut self) -> ResultNode {
        let results = self.test_results.take().unwrap_or_default();
        let classes = self.test_classes.take().unwrap_or_default();

        let mut children = Vec::with_capacity(results.len() + classes.len());
        children.extend(results.into_iter().map(ResultNode::Leaf));
        children.extend(classes.into_iter().map(|mut class| class.take_tree()));
        ResultNode::Branch(children)
    }
}

impl RawResult {
    pub fn from_slice(bytes: &[u8], path: &Path) -> Result<Self, IngestError> {
        serde_json::from_slice(bytes).map_err(|e| IngestError::parse(path, e))
    }
}

/// Embedded result tree of a manifest.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultNode {
    Branch(Vec<ResultNode>),
    Leaf(RawResult),
}

impl ResultNode {
    /// Depth-first flatten. Consumes the tree; only the leaves survive, in
    /// walk order.
    pub fn flatten(self) -> Vec<RawResult> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            match node {
                Self::Leaf(result) => out.push(result),
                Self::Branch(children) => stack.extend(children.into_iter().rev()),
            }
        }
        out
    }
}
