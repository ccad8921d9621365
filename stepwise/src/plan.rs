//! Plan data model: steps, kind-specific parameters, retry policy.
//!
//! The wire format is a JSON document with a `steps` list; [`TaskPlan`] keeps the
//! steps keyed by id. Conversion goes through [`PlanDocument`] so duplicate ids and
//! malformed parameters are reported together, before any graph validation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::condition::Condition;
use crate::error::PlanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Command,
    Code,
    File,
    Api,
    Decision,
    Loop,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Code => "code",
            Self::File => "file",
            Self::Api => "api",
            Self::Decision => "decision",
            Self::Loop => "loop",
        }
    }
}

/// Informational risk tier; the core never gates execution on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTier {
    #[default]
    Low,
    Medium,
    High,
}

/// Explicit per-step failure strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStrategy {
    Retry,
    Skip,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(alias = "max")]
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 0,
            multiplier: 2.0,
            max_backoff_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> std::time::Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let raw = self.backoff_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_backoff_ms as f64).max(0.0);
        std::time::Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandParams {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default = "default_accept_codes")]
    pub accept_codes: Vec<i32>,
    /// Compensating command run on rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo: Option<String>,
}

fn default_accept_codes() -> Vec<i32> {
    vec![0]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeLanguage {
    Python,
    Shell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeParams {
    pub language: CodeLanguage,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase", deny_unknown_fields)]
pub enum FileParams {
    Read {
        path: String,
    },
    Write {
        path: String,
        content: String,
    },
    Append {
        path: String,
        content: String,
    },
    Replace {
        path: String,
        find: String,
        replace: String,
        /// Replace at most this many occurrences; all when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<usize>,
    },
    Delete {
        path: String,
    },
    Copy {
        from: String,
        to: String,
    },
    Move {
        from: String,
        to: String,
    },
}

impl FileParams {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Append { .. } => "append",
            Self::Replace { .. } => "replace",
            Self::Delete { .. } => "delete",
            Self::Copy { .. } => "copy",
            Self::Move { .. } => "move",
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Read { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiParams {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// String bodies are sent as-is, anything else as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Accepted status codes; 200..=399 when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept_status: Option<Vec<u16>>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl ApiParams {
    pub fn accepts(&self, status: u16) -> bool {
        match &self.accept_status {
            Some(codes) => codes.contains(&status),
            None => (200..=399).contains(&status),
        }
    }

    /// GET and HEAD requests are treated as read-only.
    pub fn is_read_only(&self) -> bool {
        matches!(self.method.to_ascii_uppercase().as_str(), "GET" | "HEAD")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionParams {
    pub condition: Condition,
    #[serde(default)]
    pub if_true: Vec<String>,
    #[serde(default)]
    pub if_false: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopSource {
    List(Vec<Value>),
    Range {
        start: i64,
        end: i64,
        #[serde(default = "default_range_step")]
        step: i64,
    },
    /// Pattern relative to the execution working directory.
    Glob(String),
    /// Template that must resolve to a list or an object.
    Variable(String),
}

fn default_range_step() -> i64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopParams {
    pub items: LoopSource,
    pub body: Vec<String>,
    #[serde(default)]
    pub parallel: bool,
}

/// Kind-specific parameters of a step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    Command(CommandParams),
    Code(CodeParams),
    File(FileParams),
    Api(ApiParams),
    Decision(DecisionParams),
    Loop(LoopParams),
}

impl StepAction {
    pub fn from_parts(kind: StepKind, params: Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            StepKind::Command => Self::Command(serde_json::from_value(params)?),
            StepKind::Code => Self::Code(serde_json::from_value(params)?),
            StepKind::File => Self::File(serde_json::from_value(params)?),
            StepKind::Api => Self::Api(serde_json::from_value(params)?),
            StepKind::Decision => Self::Decision(serde_json::from_value(params)?),
            StepKind::Loop => Self::Loop(serde_json::from_value(params)?),
        })
    }

    pub fn kind(&self) -> StepKind {
        match self {
            Self::Command(_) => StepKind::Command,
            Self::Code(_) => StepKind::Code,
            Self::File(_) => StepKind::File,
            Self::Api(_) => StepKind::Api,
            Self::Decision(_) => StepKind::Decision,
            Self::Loop(_) => StepKind::Loop,
        }
    }

    pub fn params(&self) -> Value {
        let value = match self {
            Self::Command(p) => serde_json::to_value(p),
            Self::Code(p) => serde_json::to_value(p),
            Self::File(p) => serde_json::to_value(p),
            Self::Api(p) => serde_json::to_value(p),
            Self::Decision(p) => serde_json::to_value(p),
            Self::Loop(p) => serde_json::to_value(p),
        };
        value.unwrap_or(Value::Null)
    }

    /// String parameters subject to `${...}` resolution.
    pub fn templates(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        match self {
            Self::Command(p) => {
                out.push(&p.command);
                out.extend(p.workdir.as_deref());
                out.extend(p.env.values().map(String::as_str));
                out.extend(p.stdin.as_deref());
                out.extend(p.undo.as_deref());
            }
            Self::Code(p) => out.push(&p.source),
            Self::File(p) => match p {
                FileParams::Read { path } | FileParams::Delete { path } => out.push(path),
                FileParams::Write { path, content } | FileParams::Append { path, content } => {
                    out.push(path);
                    out.push(content);
                }
                FileParams::Replace {
                    path, find, replace, ..
                } => {
                    out.push(path);
                    out.push(find);
                    out.push(replace);
                }
                FileParams::Copy { from, to } | FileParams::Move { from, to } => {
                    out.push(from);
                    out.push(to);
                }
            },
            Self::Api(p) => {
                out.push(&p.url);
                out.push(&p.method);
                out.extend(p.headers.values().map(String::as_str));
                if let Some(body) = &p.body {
                    collect_strings(body, &mut out);
                }
            }
            Self::Decision(_) => {}
            Self::Loop(p) => match &p.items {
                LoopSource::List(items) => {
                    for item in items {
                        collect_strings(item, &mut out);
                    }
                }
                LoopSource::Glob(template) | LoopSource::Variable(template) => out.push(template),
                LoopSource::Range { .. } => {}
            },
        }
        out
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, out)),
        Value::Object(map) => map.values().for_each(|item| collect_strings(item, out)),
        _ => {}
    }
}

/// One unit of work. Immutable once the plan is accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanStep {
    pub id: String,
    pub action: StepAction,
    pub depends_on: BTreeSet<String>,
    pub risk: RiskTier,
    pub retry: RetryPolicy,
    pub optional: bool,
    pub on_failure: Option<FailureStrategy>,
    pub timeout_secs: Option<u64>,
    pub description: Option<String>,
}

impl PlanStep {
    pub fn new(id: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            action,
            depends_on: BTreeSet::new(),
            risk: RiskTier::default(),
            retry: RetryPolicy::default(),
            optional: false,
            on_failure: None,
            timeout_secs: None,
            description: None,
        }
    }

    pub fn kind(&self) -> StepKind {
        self.action.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PlanDocument", into = "PlanDocument")]
pub struct TaskPlan {
    pub id: String,
    pub description: Option<String>,
    pub steps: BTreeMap<String, PlanStep>,
    /// Declared entry points; derived from the graph when absent.
    pub entry_points: Option<Vec<String>>,
    pub variables: Map<String, Value>,
}

impl TaskPlan {
    pub fn new(id: impl Into<String>, steps: impl IntoIterator<Item = PlanStep>) -> Self {
        Self {
            id: id.into(),
            description: None,
            steps: steps
                .into_iter()
                .map(|step| (step.id.clone(), step))
                .collect(),
            entry_points: None,
            variables: Map::new(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.get(id)
    }
}

/// JSON wire form of a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanDocument {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_points: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub variables: Map<String, Value>,
    pub steps: Vec<StepDocument>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDocument {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub risk: RiskTier,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<FailureStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl TryFrom<PlanDocument> for TaskPlan {
    type Error = PlanError;

    fn try_from(doc: PlanDocument) -> Result<Self, Self::Error> {
        let mut errors = Vec::new();
        let mut steps = BTreeMap::new();
        for step in doc.steps {
            if steps.contains_key(&step.id) {
                errors.push(format!("duplicate step id '{}'", step.id));
                continue;
            }
            let params = match step.params {
                Value::Null => Value::Object(Map::new()),
                other => other,
            };
            let action = match StepAction::from_parts(step.kind, params) {
                Ok(action) => action,
                Err(err) => {
                    errors.push(format!(
                        "step '{}': invalid {} params: {err}",
                        step.id,
                        step.kind.as_str()
                    ));
                    continue;
                }
            };
            let id = step.id.clone();
            steps.insert(
                id,
                PlanStep {
                    id: step.id,
                    action,
                    depends_on: step.depends_on.into_iter().collect(),
                    risk: step.risk,
                    retry: step.retry,
                    optional: step.optional,
                    on_failure: step.on_failure,
                    timeout_secs: step.timeout_secs,
                    description: step.description,
                },
            );
        }
        if !errors.is_empty() {
            return Err(PlanError::Invalid { errors });
        }
        Ok(Self {
            id: doc.id,
            description: doc.description,
            steps,
            entry_points: doc.entry_points,
            variables: doc.variables,
        })
    }
}

impl From<TaskPlan> for PlanDocument {
    fn from(plan: TaskPlan) -> Self {
        Self {
            id: plan.id,
            description: plan.description,
            entry_points: plan.entry_points,
            variables: plan.variables,
            steps: plan
                .steps
                .into_values()
                .map(|step| StepDocument {
                    params: step.action.params(),
                    kind: step.kind(),
                    id: step.id,
                    depends_on: step.depends_on.into_iter().collect(),
                    risk: step.risk,
                    retry: step.retry,
                    optional: step.optional,
                    on_failure: step.on_failure,
                    timeout_secs: step.timeout_secs,
                    description: step.description,
                })
                .collect(),
        }
    }
}
