//! Generation request configuration
//!
//! A [`GenerationConfig`] carries every recognised option of a generation
//! request. It can be built in code or loaded from YAML; all semantic checks
//! happen in [`GenerationConfig::validate`] so that a malformed request fails
//! before any model runs.

use candle_core::Device;
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::schedulers::SchedulerKind;

/// Raw prompt option as supplied by the caller.
///
/// Anything that is neither a string nor a list of strings is kept as
/// `Invalid` so the type error is reported by validation, not by the parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    Text(String),
    Batch(Vec<String>),
    Invalid(serde_json::Value),
}

impl From<&str> for PromptInput {
    fn from(prompt: &str) -> Self {
        PromptInput::Text(prompt.to_string())
    }
}

impl From<String> for PromptInput {
    fn from(prompt: String) -> Self {
        PromptInput::Text(prompt)
    }
}

impl From<Vec<String>> for PromptInput {
    fn from(prompts: Vec<String>) -> Self {
        PromptInput::Batch(prompts)
    }
}

impl From<Vec<&str>> for PromptInput {
    fn from(prompts: Vec<&str>) -> Self {
        PromptInput::Batch(prompts.into_iter().map(str::to_string).collect())
    }
}

/// A validated prompt batch. Its length is the batch size.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt(Vec<String>);

impl Prompt {
    pub fn batch_size(&self) -> usize {
        self.0.len()
    }

    pub fn texts(&self) -> &[String] {
        &self.0
    }

    /// Empty prompts used for the unconditional branch of guidance.
    pub fn unconditional(&self) -> Vec<String> {
        vec![String::new(); self.0.len()]
    }
}

impl TryFrom<&PromptInput> for Prompt {
    type Error = PipelineError;

    fn try_from(input: &PromptInput) -> Result<Self> {
        match input {
            PromptInput::Text(text) => Ok(Prompt(vec![text.clone()])),
            PromptInput::Batch(texts) if texts.is_empty() => Err(PipelineError::EmptyPrompt),
            PromptInput::Batch(texts) => Ok(Prompt(texts.clone())),
            PromptInput::Invalid(value) => Err(PipelineError::InvalidPrompt(describe_value(value))),
        }
    }
}

fn describe_value(value: &serde_json::Value) -> String {
    let kind = match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "a list with non-string items",
        serde_json::Value::Object(_) => "a mapping",
    };
    format!("{} ({})", kind, value)
}

/// Representation of the returned images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    /// Encoded `image::RgbImage` objects.
    Pil,
    /// Raw NHWC f32 pixel tensor in `[0, 1]`.
    Array,
}

impl std::str::FromStr for OutputType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pil" => Ok(OutputType::Pil),
            "array" | "np" | "numpy" | "tensor" => Ok(OutputType::Array),
            _ => Err(PipelineError::UnknownOutputType(s.to_string())),
        }
    }
}

fn default_size() -> usize {
    512
}

fn default_init_max_pixels() -> u64 {
    262_144
}

fn default_init_strength() -> f64 {
    0.8
}

fn default_steps() -> usize {
    50
}

fn default_guidance_scale() -> f64 {
    7.5
}

fn default_output_type() -> String {
    "pil".to_string()
}

fn default_scheduler() -> String {
    "pndm".to_string()
}

/// Distinguishes an absent key from an explicit `null`.
fn deserialize_some<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Options of a single generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub prompt: PromptInput,
    #[serde(default = "default_size")]
    pub height: usize,
    #[serde(default = "default_size")]
    pub width: usize,
    #[serde(default = "default_init_max_pixels")]
    pub init_max_pixels: u64,
    #[serde(default = "default_init_strength")]
    pub init_strength: f64,
    #[serde(default = "default_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default)]
    pub eta: f64,
    #[serde(default = "default_output_type")]
    pub output_type: String,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    /// Deprecated device override; `Some(None)` selects CUDA when available.
    /// Use `StableDiffusionPipeline::to` instead.
    #[serde(default, deserialize_with = "deserialize_some", skip_serializing_if = "Option::is_none")]
    pub torch_device: Option<Option<String>>,
}

impl GenerationConfig {
    pub fn new(prompt: impl Into<PromptInput>) -> Self {
        Self {
            prompt: prompt.into(),
            height: default_size(),
            width: default_size(),
            init_max_pixels: default_init_max_pixels(),
            init_strength: default_init_strength(),
            num_inference_steps: default_steps(),
            guidance_scale: default_guidance_scale(),
            eta: 0.0,
            output_type: default_output_type(),
            scheduler: default_scheduler(),
            torch_device: None,
        }
    }

    /// Classifier-free guidance is active above a scale of 1.0.
    pub fn do_classifier_free_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }

    pub fn output_type(&self) -> Result<OutputType> {
        self.output_type.parse()
    }

    pub fn scheduler_kind(&self) -> Result<SchedulerKind> {
        self.scheduler.parse()
    }

    /// Check every option that does not need a model, returning the prompt batch.
    pub fn validate(&self, has_init_image: bool) -> Result<Prompt> {
        let prompt = Prompt::try_from(&self.prompt)?;

        if has_init_image && (self.height % 8 != 0 || self.width % 8 != 0) {
            return Err(PipelineError::InvalidDimensions {
                height: self.height,
                width: self.width,
            });
        }

        if has_init_image && !(0.0..=1.0).contains(&self.init_strength) {
            return Err(PipelineError::InvalidStrength(self.init_strength));
        }

        if self.num_inference_steps == 0 {
            return Err(PipelineError::InvalidSteps(self.num_inference_steps));
        }

        self.output_type()?;
        self.scheduler_kind()?;
        if let Some(device) = &self.torch_device {
            parse_device(device.as_deref())?;
        }

        Ok(prompt)
    }
}

/// Resolve a device name; `None` picks CUDA when available.
pub fn parse_device(name: Option<&str>) -> Result<Device> {
    let name = match name {
        Some(name) => name.to_ascii_lowercase(),
        None if candle_core::utils::cuda_is_available() => "cuda".to_string(),
        None => "cpu".to_string(),
    };

    match name.as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(0)?),
        other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
            Some(Ok(ordinal)) => Ok(Device::new_cuda(ordinal)?),
            _ => Err(PipelineError::InvalidDevice(other.to_string())),
        },
    }
}

pub fn load_config(path: &Path) -> Result<GenerationConfig> {
    let config_str = fs::read_to_string(path).map_err(|e| {
        PipelineError::Config(format!("failed to read config file {}: {}", path.display(), e))
    })?;

    serde_yaml::from_str(&config_str)
        .map_err(|e| PipelineError::Config(format!("failed to parse YAML config: {}", e)))
}
