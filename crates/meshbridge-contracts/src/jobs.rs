use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One of the three parallel candidates produced by an options job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptionLabel {
    A,
    B,
    C,
}

impl OptionLabel {
    pub const ALL: [OptionLabel; 3] = [OptionLabel::A, OptionLabel::B, OptionLabel::C];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
            Self::C => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl fmt::Display for OptionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptionLabel {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "A" | "1" => Ok(Self::A),
            "B" | "2" => Ok(Self::B),
            "C" | "3" => Ok(Self::C),
            other => Err(format!("unknown option label '{other}' (expected A, B or C)")),
        }
    }
}

/// Camera positions captured by the 3D host for a mesh job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderView {
    Front,
    Right,
    Back,
    Left,
}

impl RenderView {
    pub const ALL: [RenderView; 4] = [
        RenderView::Front,
        RenderView::Right,
        RenderView::Back,
        RenderView::Left,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Front => "front",
            Self::Right => "right",
            Self::Back => "back",
            Self::Left => "left",
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}.png", self.as_str())
    }

    /// Camera yaw about the vertical axis, front looking down -Y.
    pub fn yaw_degrees(&self) -> f64 {
        match self {
            Self::Front => 0.0,
            Self::Right => 90.0,
            Self::Back => 180.0,
            Self::Left => 270.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Options,
    Mesh,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Options => "options",
            Self::Mesh => "mesh",
        }
    }
}

/// A filled workflow document ready for submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub kind: JobKind,
    pub correlation_id: String,
    pub payload: Map<String, Value>,
    pub seeds: Vec<i64>,
}

/// Handle returned once the server accepted a job.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedJob {
    pub kind: JobKind,
    pub correlation_id: String,
    pub prompt_id: String,
    pub submitted_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(rename = "type", default = "default_image_type")]
    pub kind: String,
}

fn default_image_type() -> String {
    "output".to_string()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotOutput {
    pub images: Vec<ImageRef>,
    pub texts: Vec<String>,
    pub model_file: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobResult {
    pub prompt_id: String,
    pub status: JobStatus,
    pub outputs: BTreeMap<String, SlotOutput>,
    pub message: Option<String>,
}

impl JobResult {
    pub fn pending(prompt_id: &str) -> Self {
        Self {
            prompt_id: prompt_id.to_string(),
            status: JobStatus::Pending,
            outputs: BTreeMap::new(),
            message: None,
        }
    }

    /// Interprets a `/history/{prompt_id}` response body. A missing key means
    /// the job has not been recorded yet.
    pub fn from_history(prompt_id: &str, history: &Value) -> Self {
        let Some(entry) = history.get(prompt_id).and_then(Value::as_object) else {
            return Self::pending(prompt_id);
        };

        let mut outputs = BTreeMap::new();
        if let Some(rows) = entry.get("outputs").and_then(Value::as_object) {
            for (slot_id, row) in rows {
                outputs.insert(slot_id.clone(), parse_slot_output(row));
            }
        }

        let status_obj = entry.get("status").and_then(Value::as_object);
        let status_str = status_obj
            .and_then(|status| status.get("status_str"))
            .and_then(Value::as_str)
            .map(|value| value.to_ascii_lowercase())
            .unwrap_or_default();
        let completed = status_obj
            .and_then(|status| status.get("completed"))
            .and_then(Value::as_bool);

        let (status, message) = if status_str == "error" {
            (JobStatus::Error, status_obj.and_then(execution_error_message))
        } else if completed == Some(true) || status_str == "success" {
            (JobStatus::Complete, None)
        } else if completed.is_none() && !outputs.is_empty() {
            (JobStatus::Complete, None)
        } else {
            (JobStatus::Running, None)
        };

        Self {
            prompt_id: prompt_id.to_string(),
            status,
            outputs,
            message,
        }
    }

    /// Image outputs in slot order. Slot ids are compared numerically when
    /// both parse as integers so node "10" sorts after node "9".
    pub fn images(&self) -> Vec<ImageRef> {
        self.ordered_slots()
            .into_iter()
            .flat_map(|slot| slot.images.iter().cloned())
            .collect()
    }

    pub fn texts(&self) -> Vec<String> {
        self.ordered_slots()
            .into_iter()
            .flat_map(|slot| slot.texts.iter().cloned())
            .collect()
    }

    pub fn model_files(&self) -> Vec<String> {
        self.ordered_slots()
            .into_iter()
            .filter_map(|slot| slot.model_file.clone())
            .collect()
    }

    fn ordered_slots(&self) -> Vec<&SlotOutput> {
        let mut keys: Vec<&String> = self.outputs.keys().collect();
        keys.sort_by(|left, right| match (left.parse::<u64>(), right.parse::<u64>()) {
            (Ok(l), Ok(r)) => l.cmp(&r),
            _ => left.cmp(right),
        });
        keys.into_iter()
            .filter_map(|key| self.outputs.get(key))
            .collect()
    }
}

fn parse_slot_output(row: &Value) -> SlotOutput {
    let images = row
        .get("images")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<ImageRef>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default();
    let texts = match row.get("text").or_else(|| row.get("texts")) {
        Some(Value::String(text)) => vec![text.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    let model_file = match row.get("model_file").or_else(|| row.get("mesh")) {
        Some(Value::String(path)) => Some(path.clone()),
        Some(Value::Array(items)) => items.iter().find_map(Value::as_str).map(str::to_string),
        _ => None,
    };
    SlotOutput {
        images,
        texts,
        model_file,
    }
}

fn execution_error_message(status: &Map<String, Value>) -> Option<String> {
    let messages = status.get("messages")?.as_array()?;
    messages.iter().rev().find_map(|message| {
        let pair = message.as_array()?;
        if pair.first()?.as_str()? != "execution_error" {
            return None;
        }
        let data = pair.get(1)?;
        let text = data
            .get("exception_message")
            .and_then(Value::as_str)
            .unwrap_or("execution error");
        let node = data.get("node_type").and_then(Value::as_str);
        Some(match node {
            Some(node) => format!("{node}: {}", text.trim()),
            None => text.trim().to_string(),
        })
    })
}

/// The option whose text and image feed the next mesh job.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedOption {
    pub label: OptionLabel,
    pub prompt_text: String,
    pub image_path: PathBuf,
    pub mesh_path: Option<PathBuf>,
}
