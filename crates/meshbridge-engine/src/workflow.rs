use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use meshbridge_contracts::{Job, JobKind, PipelineError, RenderView};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

const SEED_INPUTS: [&str; 2] = ["seed", "noise_seed"];
const MAX_SEED: i64 = 1 << 53;

/// Issues sampler seeds, never the same one twice.
#[derive(Debug)]
pub struct SeedSource {
    rng: StdRng,
    issued: HashSet<i64>,
}

impl Default for SeedSource {
    fn default() -> Self {
        Self {
            rng: StdRng::from_entropy(),
            issued: HashSet::new(),
        }
    }
}

impl SeedSource {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            issued: HashSet::new(),
        }
    }

    pub fn next_seed(&mut self) -> i64 {
        loop {
            let candidate = self.rng.gen_range(1..MAX_SEED);
            if self.issued.insert(candidate) {
                return candidate;
            }
        }
    }

    pub fn issued(&self) -> usize {
        self.issued.len()
    }
}

/// Values substituted into a workflow's named slots.
#[derive(Debug, Clone, Default)]
pub struct SlotInputs {
    pub prompt: Option<String>,
    pub views: Vec<(RenderView, PathBuf)>,
    pub option_image: Option<PathBuf>,
}

/// A generation-server workflow in API format: `{node_id: {class_type,
/// inputs, _meta: {title}}}`. Slots are found by input name (seeds) or by
/// node title (prompt text, images).
#[derive(Debug, Clone)]
pub struct WorkflowTemplate {
    path: PathBuf,
    nodes: Map<String, Value>,
}

impl WorkflowTemplate {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(PipelineError::MissingTemplate(path.to_path_buf()).into());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading workflow {}", path.display()))?;
        let parsed: Value = serde_json::from_str(&raw)
            .with_context(|| format!("workflow {} is not valid JSON", path.display()))?;
        Self::from_value(path, parsed)
    }

    pub fn from_value(path: &Path, value: Value) -> Result<Self> {
        let Value::Object(nodes) = value else {
            anyhow::bail!("workflow {} must be a JSON object of nodes", path.display());
        };
        Ok(Self {
            path: path.to_path_buf(),
            nodes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the filled document and the seeds written into it.
    pub fn fill(&self, inputs: &SlotInputs, seeds: &mut SeedSource) -> (Map<String, Value>, Vec<i64>) {
        let mut nodes = self.nodes.clone();
        let mut used = Vec::new();
        let mut prompt_slots = 0;

        for node in nodes.values_mut() {
            let title = node_title(node);
            let Some(node_inputs) = node.get_mut("inputs").and_then(Value::as_object_mut) else {
                continue;
            };

            for key in SEED_INPUTS {
                if node_inputs.contains_key(key) {
                    let seed = seeds.next_seed();
                    node_inputs.insert(key.to_string(), Value::from(seed));
                    used.push(seed);
                }
            }

            if title.starts_with("prompt") {
                if let Some(prompt) = &inputs.prompt {
                    node_inputs.insert("text".to_string(), Value::String(prompt.clone()));
                    prompt_slots += 1;
                }
            }

            if let Some(image) = image_for_title(&title, inputs) {
                node_inputs.insert(
                    "image".to_string(),
                    Value::String(image.to_string_lossy().to_string()),
                );
            }
        }

        if used.is_empty() {
            warn!(workflow = %self.path.display(), "workflow has no sampler seed slot");
        }
        if inputs.prompt.is_some() && prompt_slots == 0 {
            warn!(workflow = %self.path.display(), "workflow has no prompt slot");
        }
        (nodes, used)
    }
}

fn node_title(node: &Value) -> String {
    node.get("_meta")
        .and_then(|meta| meta.get("title"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn image_for_title<'a>(title: &str, inputs: &'a SlotInputs) -> Option<&'a PathBuf> {
    if title == "option_image" {
        return inputs.option_image.as_ref();
    }
    let view = title.strip_prefix("view_")?;
    inputs
        .views
        .iter()
        .find(|(candidate, _)| candidate.as_str() == view)
        .map(|(_, path)| path)
}

/// Builds options and mesh jobs from the two workflow templates.
///
/// Templates are re-read for every job so edits on disk apply to the next
/// submission.
#[derive(Debug)]
pub struct JobBuilder {
    options_template: PathBuf,
    mesh_template: PathBuf,
    seeds: SeedSource,
}

impl JobBuilder {
    pub fn new(options_template: impl Into<PathBuf>, mesh_template: impl Into<PathBuf>) -> Self {
        Self {
            options_template: options_template.into(),
            mesh_template: mesh_template.into(),
            seeds: SeedSource::default(),
        }
    }

    pub fn with_seeds(mut self, seeds: SeedSource) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn options_job(&mut self, prompt: &str, views: &[(RenderView, PathBuf)]) -> Result<Job> {
        let inputs = SlotInputs {
            prompt: Some(prompt.to_string()),
            views: views.to_vec(),
            option_image: None,
        };
        self.build(JobKind::Options, &inputs)
    }

    pub fn mesh_job(
        &mut self,
        prompt: &str,
        option_image: &Path,
        views: &[(RenderView, PathBuf)],
    ) -> Result<Job> {
        let inputs = SlotInputs {
            prompt: Some(prompt.to_string()),
            views: views.to_vec(),
            option_image: Some(option_image.to_path_buf()),
        };
        self.build(JobKind::Mesh, &inputs)
    }

    fn build(&mut self, kind: JobKind, inputs: &SlotInputs) -> Result<Job> {
        let path = match kind {
            JobKind::Options => &self.options_template,
            JobKind::Mesh => &self.mesh_template,
        };
        let template = WorkflowTemplate::load(path)?;
        let (payload, seeds) = template.fill(inputs, &mut self.seeds);
        Ok(Job {
            kind,
            correlation_id: Uuid::new_v4().to_string(),
            payload,
            seeds,
        })
    }
}
