//! Request parameters: hard bounds reject, soft bounds normalize.

use crate::error::GenerationError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

pub const MAX_PROMPT_CHARS: usize = 5000;
pub const MIN_DIMENSION: u32 = 64;
pub const MAX_DIMENSION: u32 = 2048;
/// Resolutions at or above this many pixels get their batch size clamped.
const LARGE_RESOLUTION_PIXELS: u64 = 1024 * 1024;
const LARGE_RESOLUTION_MAX_BATCH: u32 = 2;

/// Closed sampler set accepted by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum SamplerName {
    #[serde(rename = "euler")]
    Euler,
    #[serde(rename = "euler_ancestral")]
    EulerAncestral,
    #[serde(rename = "heun")]
    Heun,
    #[serde(rename = "dpm_2")]
    Dpm2,
    #[serde(rename = "dpm_2_ancestral")]
    Dpm2Ancestral,
    #[serde(rename = "lms")]
    Lms,
    #[serde(rename = "dpm_fast")]
    DpmFast,
    #[serde(rename = "dpm_adaptive")]
    DpmAdaptive,
    #[serde(rename = "dpmpp_2s_ancestral")]
    Dpmpp2sAncestral,
    #[serde(rename = "dpmpp_sde")]
    DpmppSde,
    #[serde(rename = "dpmpp_2m")]
    Dpmpp2m,
    #[serde(rename = "dpmpp_3m_sde")]
    Dpmpp3mSde,
    #[serde(rename = "ddim")]
    Ddim,
    #[serde(rename = "uni_pc")]
    UniPc,
}

/// Closed scheduler set accepted by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Scheduler {
    Normal,
    Karras,
    Exponential,
    SgmUniform,
    Simple,
    DdimUniform,
}

fn default_seed() -> i64 {
    -1
}
fn default_dimension() -> u32 {
    1024
}
fn default_steps() -> u32 {
    20
}
fn default_cfg() -> f64 {
    7.0
}
fn default_sampler() -> SamplerName {
    SamplerName::Euler
}
fn default_scheduler() -> Scheduler {
    Scheduler::Normal
}
fn default_batch_size() -> u32 {
    1
}

/// User-facing generation request.
///
/// Hard bounds (steps, cfg, seed, batch_size) reject with a 422; soft
/// bounds (prompt length, dimensions, resolution-dependent batch limits)
/// normalize instead. `validate_and_normalize` is idempotent on its own
/// output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct GenerateRequest {
    pub positive_prompt: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,

    /// -1 requests a random seed, resolved at submission time.
    #[serde(default = "default_seed")]
    #[validate(range(min = -1, max = 4294967295_i64))]
    pub seed: i64,

    #[serde(default = "default_dimension")]
    pub width: u32,

    #[serde(default = "default_dimension")]
    pub height: u32,

    #[serde(default = "default_steps")]
    #[validate(range(min = 1, max = 100))]
    pub steps: u32,

    #[serde(default = "default_cfg")]
    #[validate(range(min = 1.0, max = 30.0))]
    pub cfg: f64,

    #[serde(default = "default_sampler")]
    pub sampler_name: SamplerName,

    #[serde(default = "default_scheduler")]
    pub scheduler: Scheduler,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denoise: Option<f64>,

    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 4))]
    pub batch_size: u32,

    /// URL, data URI, or filename of an input image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_image: Option<String>,

    #[serde(default)]
    pub return_base64: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_prefix: Option<String>,
}

impl GenerateRequest {
    /// Apply hard-bound validation, then normalization. Errors carry the
    /// first offending field path.
    pub fn validate_and_normalize(mut self) -> Result<Self, GenerationError> {
        self.validate().map_err(|errors| {
            let (field, field_errors) = errors
                .field_errors()
                .into_iter()
                .next()
                .expect("validation failed with no field errors");
            let message = field_errors
                .first()
                .and_then(|e| e.message.as_ref().map(ToString::to_string))
                .unwrap_or_else(|| format!("invalid value for {field}"));
            GenerationError::Validation {
                field: field.to_string(),
                message,
            }
        })?;

        self.positive_prompt = sanitize_prompt(&self.positive_prompt);
        if self.positive_prompt.is_empty() {
            return Err(GenerationError::Validation {
                field: "positive_prompt".to_string(),
                message: "prompt must not be empty".to_string(),
            });
        }
        self.negative_prompt = self
            .negative_prompt
            .as_deref()
            .map(sanitize_prompt)
            .filter(|p| !p.is_empty());

        self.width = normalize_dimension(self.width);
        self.height = normalize_dimension(self.height);

        let pixels = u64::from(self.width) * u64::from(self.height);
        if pixels >= LARGE_RESOLUTION_PIXELS {
            self.batch_size = self.batch_size.min(LARGE_RESOLUTION_MAX_BATCH);
        }

        Ok(self)
    }
}

/// Collapse whitespace, strip shell metacharacters, truncate.
fn sanitize_prompt(prompt: &str) -> String {
    let cleaned: String = prompt
        .chars()
        .filter(|c| !matches!(c, ';' | '&' | '|' | '`' | '$' | '\\'))
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_PROMPT_CHARS).collect()
}

/// Clamp into range, then round to the nearest multiple of 8.
fn normalize_dimension(value: u32) -> u32 {
    let clamped = value.clamp(MIN_DIMENSION, MAX_DIMENSION);
    let rounded = (clamped + 4) / 8 * 8;
    rounded.clamp(MIN_DIMENSION, MAX_DIMENSION)
}

/// Resolve a user seed: -1 means pick a random u32.
pub fn resolve_seed(seed: i64) -> u32 {
    if seed == -1 {
        rand::rng().random_range(0..=u32::MAX)
    } else {
        seed as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: serde_json::Value) -> GenerateRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_minimal_request_defaults() {
        let req = request(json!({"positive_prompt": "a red cube"}))
            .validate_and_normalize()
            .unwrap();
        assert_eq!(req.seed, -1);
        assert_eq!(req.width, 1024);
        assert_eq!(req.steps, 20);
        assert_eq!(req.sampler_name, SamplerName::Euler);
        assert_eq!(req.batch_size, 1);
        assert!(!req.return_base64);
    }

    #[test]
    fn test_whitespace_normalization() {
        let req = request(json!({"positive_prompt": "  multiple   spaces\n\t here  "}))
            .validate_and_normalize()
            .unwrap();
        assert_eq!(req.positive_prompt, "multiple spaces here");
    }

    #[test]
    fn test_shell_metacharacters_stripped() {
        let req = request(json!({"positive_prompt": "a cube`; rm $HOME | x & y\\"}))
            .validate_and_normalize()
            .unwrap();
        for c in [';', '&', '|', '`', '$', '\\'] {
            assert!(!req.positive_prompt.contains(c), "found {c:?}");
        }
    }

    #[test]
    fn test_long_prompt_truncated_not_rejected() {
        let long = "word ".repeat(2000);
        let req = request(json!({"positive_prompt": long}))
            .validate_and_normalize()
            .unwrap();
        assert_eq!(req.positive_prompt.chars().count(), MAX_PROMPT_CHARS);
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let err = request(json!({"positive_prompt": "   "}))
            .validate_and_normalize()
            .unwrap_err();
        assert!(matches!(err, GenerationError::Validation { ref field, .. } if field == "positive_prompt"));
    }

    #[test]
    fn test_dimension_rounding() {
        let req = request(json!({"positive_prompt": "x", "width": 513, "height": 766}))
            .validate_and_normalize()
            .unwrap();
        assert_eq!(req.width, 512);
        assert_eq!(req.height, 768);
    }

    #[test]
    fn test_dimension_clamping() {
        let req = request(json!({"positive_prompt": "x", "width": 4096, "height": 16}))
            .validate_and_normalize()
            .unwrap();
        assert_eq!(req.width, MAX_DIMENSION);
        assert_eq!(req.height, MIN_DIMENSION);
    }

    #[test]
    fn test_steps_out_of_range_rejected() {
        let err = request(json!({"positive_prompt": "x", "steps": 200}))
            .validate_and_normalize()
            .unwrap_err();
        assert!(matches!(err, GenerationError::Validation { ref field, .. } if field == "steps"));

        assert!(request(json!({"positive_prompt": "x", "steps": 0}))
            .validate_and_normalize()
            .is_err());
        assert!(request(json!({"positive_prompt": "x", "steps": 1}))
            .validate_and_normalize()
            .is_ok());
        assert!(request(json!({"positive_prompt": "x", "steps": 100}))
            .validate_and_normalize()
            .is_ok());
    }

    #[test]
    fn test_cfg_bounds() {
        assert!(request(json!({"positive_prompt": "x", "cfg": 0.5}))
            .validate_and_normalize()
            .is_err());
        assert!(request(json!({"positive_prompt": "x", "cfg": 30.0}))
            .validate_and_normalize()
            .is_ok());
        assert!(request(json!({"positive_prompt": "x", "cfg": 30.1}))
            .validate_and_normalize()
            .is_err());
    }

    #[test]
    fn test_seed_bounds() {
        assert!(request(json!({"positive_prompt": "x", "seed": -1}))
            .validate_and_normalize()
            .is_ok());
        assert!(request(json!({"positive_prompt": "x", "seed": 4294967295i64}))
            .validate_and_normalize()
            .is_ok());
        assert!(request(json!({"positive_prompt": "x", "seed": -2}))
            .validate_and_normalize()
            .is_err());
        assert!(request(json!({"positive_prompt": "x", "seed": 4294967296i64}))
            .validate_and_normalize()
            .is_err());
    }

    #[test]
    fn test_invalid_sampler_rejected_at_parse() {
        let result: Result<GenerateRequest, _> = serde_json::from_value(json!({
            "positive_prompt": "x",
            "sampler_name": "turbo_magic"
        }));
        assert!(result.is_err());

        let req = request(json!({"positive_prompt": "x", "sampler_name": "dpmpp_3m_sde"}));
        assert_eq!(req.sampler_name, SamplerName::Dpmpp3mSde);
    }

    #[test]
    fn test_invalid_scheduler_rejected_at_parse() {
        let result: Result<GenerateRequest, _> = serde_json::from_value(json!({
            "positive_prompt": "x",
            "scheduler": "banana"
        }));
        assert!(result.is_err());

        let req = request(json!({"positive_prompt": "x", "scheduler": "sgm_uniform"}));
        assert_eq!(req.scheduler, Scheduler::SgmUniform);
    }

    #[test]
    fn test_batch_downclamped_at_large_resolution() {
        let req = request(json!({
            "positive_prompt": "x",
            "width": 1024,
            "height": 1024,
            "batch_size": 4
        }))
        .validate_and_normalize()
        .unwrap();
        assert_eq!(req.batch_size, 2);

        let small = request(json!({
            "positive_prompt": "x",
            "width": 512,
            "height": 512,
            "batch_size": 4
        }))
        .validate_and_normalize()
        .unwrap();
        assert_eq!(small.batch_size, 4);
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let once = request(json!({
            "positive_prompt": "  a   red `cube`  ",
            "width": 513,
            "height": 1027,
            "batch_size": 4
        }))
        .validate_and_normalize()
        .unwrap();
        let twice = once.clone().validate_and_normalize().unwrap();

        assert_eq!(once.positive_prompt, twice.positive_prompt);
        assert_eq!(once.width, twice.width);
        assert_eq!(once.height, twice.height);
        assert_eq!(once.batch_size, twice.batch_size);
    }

    #[test]
    fn test_resolve_seed() {
        assert_eq!(resolve_seed(42), 42);
        // -1 resolves to some valid u32; just ensure it does not panic.
        let _ = resolve_seed(-1);
    }
}
