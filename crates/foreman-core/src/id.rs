//! Structured string identifiers.
//!
//! Every entity id renders as a human-readable string so it stays grepable
//! in logs: `operator:poet:v2` for a config, `operator:poet[1]:v2` for a
//! live agent, `task:poem_generation:v1` / `task:poem_generation[3]:v1` for
//! task definitions and runs. All id types round-trip through
//! `Display`/`FromStr` and serialize as plain strings.

use crate::error::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two classes of workers the control plane knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Privileged worker with access to the control-plane operations.
    Supervisor,
    /// Subordinate worker that executes task runs.
    Operator,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Supervisor => write!(f, "supervisor"),
            AgentKind::Operator => write!(f, "operator"),
        }
    }
}

impl FromStr for AgentKind {
    type Err = ForemanError;

    fn from_str(s: &str) -> ForemanResult<Self> {
        match s {
            "supervisor" => Ok(AgentKind::Supervisor),
            "operator" => Ok(AgentKind::Operator),
            other => Err(ForemanError::NotFound(format!(
                "agent kind '{other}' is not recognized"
            ))),
        }
    }
}

/// Validate a free-form type label. Labels appear inside structured ids,
/// so the id delimiters are forbidden.
fn check_type_label(label: &str) -> ForemanResult<()> {
    if label.is_empty() {
        return Err(ForemanError::IllegalState("type label is empty".into()));
    }
    if label.contains([':', '[', ']']) {
        return Err(ForemanError::IllegalState(format!(
            "type label '{label}' contains a reserved delimiter"
        )));
    }
    Ok(())
}

/// Split `"v{n}"` into `n`.
fn parse_version(seg: &str, id: &str) -> ForemanResult<u32> {
    seg.strip_prefix('v')
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ForemanError::IllegalState(format!("malformed id '{id}'")))
}

/// Split `"{label}[{n}]"` into `(label, n)`.
fn parse_indexed(seg: &str, id: &str) -> ForemanResult<(String, u32)> {
    let open = seg
        .find('[')
        .ok_or_else(|| ForemanError::IllegalState(format!("malformed id '{id}'")))?;
    let close = seg
        .strip_suffix(']')
        .ok_or_else(|| ForemanError::IllegalState(format!("malformed id '{id}'")))?;
    let num = close[open + 1..]
        .parse()
        .map_err(|_| ForemanError::IllegalState(format!("malformed id '{id}'")))?;
    Ok((seg[..open].to_string(), num))
}

/// Identifies one version of an agent template: `{kind}:{type}:v{version}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentConfigId {
    pub kind: AgentKind,
    pub agent_type: String,
    pub version: u32,
}

impl AgentConfigId {
    pub fn new(kind: AgentKind, agent_type: impl Into<String>, version: u32) -> Self {
        Self {
            kind,
            agent_type: agent_type.into(),
            version,
        }
    }
}

impl fmt::Display for AgentConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:v{}", self.kind, self.agent_type, self.version)
    }
}

impl FromStr for AgentConfigId {
    type Err = ForemanError;

    fn from_str(s: &str) -> ForemanResult<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(ForemanError::IllegalState(format!("malformed id '{s}'")));
        }
        check_type_label(parts[1])?;
        Ok(Self {
            kind: parts[0].parse()?,
            agent_type: parts[1].to_string(),
            version: parse_version(parts[2], s)?,
        })
    }
}

impl TryFrom<String> for AgentConfigId {
    type Error = ForemanError;

    fn try_from(s: String) -> ForemanResult<Self> {
        s.parse()
    }
}

impl From<AgentConfigId> for String {
    fn from(id: AgentConfigId) -> String {
        id.to_string()
    }
}

/// Identifies a live agent instance: `{kind}:{type}[{num}]:v{version}`.
/// `num` starts at 1 per (kind, type, version).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentId {
    pub kind: AgentKind,
    pub agent_type: String,
    pub num: u32,
    pub version: u32,
}

impl AgentId {
    pub fn new(kind: AgentKind, agent_type: impl Into<String>, num: u32, version: u32) -> Self {
        Self {
            kind,
            agent_type: agent_type.into(),
            num,
            version,
        }
    }

    /// The config this instance was materialized from.
    pub fn config_id(&self) -> AgentConfigId {
        AgentConfigId::new(self.kind, self.agent_type.clone(), self.version)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}[{}]:v{}",
            self.kind, self.agent_type, self.num, self.version
        )
    }
}

impl FromStr for AgentId {
    type Err = ForemanError;

    fn from_str(s: &str) -> ForemanResult<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 {
            return Err(ForemanError::IllegalState(format!("malformed id '{s}'")));
        }
        let (agent_type, num) = parse_indexed(parts[1], s)?;
        check_type_label(&agent_type)?;
        Ok(Self {
            kind: parts[0].parse()?,
            agent_type,
            num,
            version: parse_version(parts[2], s)?,
        })
    }
}

impl TryFrom<String> for AgentId {
    type Error = ForemanError;

    fn try_from(s: String) -> ForemanResult<Self> {
        s.parse()
    }
}

impl From<AgentId> for String {
    fn from(id: AgentId) -> String {
        id.to_string()
    }
}

/// Identifies one version of a task definition: `task:{type}:v{version}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskConfigId {
    pub task_type: String,
    pub version: u32,
}

impl TaskConfigId {
    pub fn new(task_type: impl Into<String>, version: u32) -> Self {
        Self {
            task_type: task_type.into(),
            version,
        }
    }
}

impl fmt::Display for TaskConfigId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}:v{}", self.task_type, self.version)
    }
}

impl FromStr for TaskConfigId {
    type Err = ForemanError;

    fn from_str(s: &str) -> ForemanResult<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 || parts[0] != "task" {
            return Err(ForemanError::IllegalState(format!("malformed id '{s}'")));
        }
        check_type_label(parts[1])?;
        Ok(Self {
            task_type: parts[1].to_string(),
            version: parse_version(parts[2], s)?,
        })
    }
}

impl TryFrom<String> for TaskConfigId {
    type Error = ForemanError;

    fn try_from(s: String) -> ForemanResult<Self> {
        s.parse()
    }
}

impl From<TaskConfigId> for String {
    fn from(id: TaskConfigId) -> String {
        id.to_string()
    }
}

/// Identifies one run of a task definition: `task:{type}[{num}]:v{version}`.
/// `num` starts at 1 per (type, version).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskRunId {
    pub task_type: String,
    pub num: u32,
    pub version: u32,
}

impl TaskRunId {
    pub fn new(task_type: impl Into<String>, num: u32, version: u32) -> Self {
        Self {
            task_type: task_type.into(),
            num,
            version,
        }
    }

    /// The definition this run was instantiated from.
    pub fn config_id(&self) -> TaskConfigId {
        TaskConfigId::new(self.task_type.clone(), self.version)
    }
}

impl fmt::Display for TaskRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}[{}]:v{}", self.task_type, self.num, self.version)
    }
}

impl FromStr for TaskRunId {
    type Err = ForemanError;

    fn from_str(s: &str) -> ForemanResult<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 || parts[0] != "task" {
            return Err(ForemanError::IllegalState(format!("malformed id '{s}'")));
        }
        let (task_type, num) = parse_indexed(parts[1], s)?;
        check_type_label(&task_type)?;
        Ok(Self {
            task_type,
            num,
            version: parse_version(parts[2], s)?,
        })
    }
}

impl TryFrom<String> for TaskRunId {
    type Error = ForemanError;

    fn try_from(s: String) -> ForemanResult<Self> {
        s.parse()
    }
}

impl From<TaskRunId> for String {
    fn from(id: TaskRunId) -> String {
        id.to_string()
    }
}
