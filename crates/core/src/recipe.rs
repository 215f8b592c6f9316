//! Recipe model - the declarative template that expands into tasks.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A recipe describes one or more steps that expand into tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    /// Unique identifier
    pub id: String,

    /// Optional recipe kind (e.g. "Job")
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Human readable title
    #[serde(default)]
    pub title: String,

    /// Parameters the submitter may supply
    #[serde(default)]
    pub params: Vec<Param>,

    /// Steps, in declaration order
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A recipe parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name, as referenced from templates
    pub id: String,

    /// Display title
    #[serde(default)]
    pub title: String,

    /// Value type
    #[serde(rename = "type", default)]
    pub param_type: ParamType,

    /// Value used when the submitter supplies none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Type of a recipe parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    /// true / false
    Boolean,
    /// Whole number
    Integer,
    /// Any number
    Number,
    /// Free text
    #[default]
    Text,
    /// A file name
    Filename,
    /// A path to a file
    Filepath,
    /// A directory name
    Dirname,
    /// A path to a directory
    Dirpath,
    /// A `[start, end, step?]` range
    Range,
}

/// One step of a recipe. Every field except `id` may be a templated
/// expression, evaluated once per generated task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Step {
    /// Task id expression
    pub id: Value,

    /// Task title expression (defaults to the evaluated id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<Value>,

    /// Dependency expression, evaluated to a list of task ids
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends: Option<Value>,

    /// Container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<Value>,

    /// Tool to invoke inside the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<Value>,

    /// Working directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<Value>,

    /// Command line arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,

    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Map<String, Value>>,

    /// Loop variables and their range expressions, outermost first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplicity: Option<Map<String, Value>>,

    /// Input files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,

    /// Output files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,

    /// Relative amount of work
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<Value>,
}
