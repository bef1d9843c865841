//! Parameter injection: user parameters -> workflow node fields.

use serde_json::Value;
use tracing::{debug, warn};

/// Fixed mapping from parameter name to (node id, input field).
///
/// The node ids follow the canonical text-to-image template the build
/// pipeline emits: text-encode nodes for the prompts, the sampler node for
/// sampling settings, the empty-latent node for geometry, plus the LoRA,
/// model-sampling, and save nodes.
const PARAM_MAP: &[(&str, &str, &str)] = &[
    ("positive_prompt", "20", "text"),
    ("prompt", "20", "text"),
    ("negative_prompt", "21", "text"),
    ("seed", "17", "seed"),
    ("steps", "17", "steps"),
    ("cfg", "17", "cfg"),
    ("sampler_name", "17", "sampler_name"),
    ("scheduler", "17", "scheduler"),
    ("denoise", "17", "denoise"),
    ("width", "6", "width"),
    ("height", "6", "height"),
    ("batch_size", "6", "batch_size"),
    ("lora_strength", "41", "strength_model"),
    ("lora_strength_clip", "41", "strength_clip"),
    ("shift", "2", "shift"),
    ("filename_prefix", "26", "filename_prefix"),
];

fn lookup(param: &str) -> Option<(&'static str, &'static str)> {
    PARAM_MAP
        .iter()
        .find(|(name, _, _)| *name == param)
        .map(|(_, node, field)| (*node, *field))
}

/// Write recognized parameters into a deep copy of the workflow.
///
/// Parameters with no mapping, null values, and mappings whose node is
/// absent from this particular workflow are skipped. Idempotent: applying
/// the same parameters twice yields the same workflow.
pub fn inject_parameters(workflow: &Value, parameters: &Value) -> Value {
    let mut injected = workflow.clone();
    let Some(params) = parameters.as_object() else {
        return injected;
    };

    for (name, value) in params {
        if value.is_null() {
            continue;
        }
        let Some((node_id, field)) = lookup(name) else {
            debug!(param = %name, "Unknown parameter ignored");
            continue;
        };

        let inputs = injected
            .get_mut(node_id)
            .and_then(|node| node.get_mut("inputs"))
            .and_then(Value::as_object_mut);
        match inputs {
            Some(inputs) => {
                debug!(param = %name, node = node_id, "Injected parameter");
                inputs.insert(field.to_string(), value.clone());
            }
            None => {
                warn!(param = %name, node = node_id, "Node not found in workflow for parameter");
            }
        }
    }

    injected
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workflow() -> Value {
        json!({
            "20": {"class_type": "CLIPTextEncode", "inputs": {"text": "placeholder"}},
            "17": {"class_type": "KSampler", "inputs": {"seed": 0, "steps": 9, "cfg": 1.0}},
            "6": {"class_type": "EmptyLatentImage", "inputs": {"width": 1024, "height": 1024, "batch_size": 1}},
        })
    }

    #[test]
    fn test_injects_mapped_parameters() {
        let params = json!({
            "positive_prompt": "a red cube",
            "seed": 42,
            "steps": 8,
            "width": 512,
        });
        let injected = inject_parameters(&workflow(), &params);

        assert_eq!(injected["20"]["inputs"]["text"], "a red cube");
        assert_eq!(injected["17"]["inputs"]["seed"], 42);
        assert_eq!(injected["17"]["inputs"]["steps"], 8);
        assert_eq!(injected["6"]["inputs"]["width"], 512);
        // Untouched fields survive.
        assert_eq!(injected["17"]["inputs"]["cfg"], 1.0);
    }

    #[test]
    fn test_unknown_parameters_are_ignored() {
        let params = json!({"positive_prompt": "x", "definitely_not_a_param": 7});
        let injected = inject_parameters(&workflow(), &params);
        assert_eq!(injected["20"]["inputs"]["text"], "x");
        assert!(injected.get("definitely_not_a_param").is_none());
    }

    #[test]
    fn test_null_values_are_skipped() {
        let params = json!({"seed": null});
        let injected = inject_parameters(&workflow(), &params);
        assert_eq!(injected["17"]["inputs"]["seed"], 0);
    }

    #[test]
    fn test_missing_node_is_skipped() {
        // This workflow has no LoRA node 41.
        let params = json!({"lora_strength": 0.5});
        let injected = inject_parameters(&workflow(), &params);
        assert_eq!(injected, workflow());
    }

    #[test]
    fn test_injection_is_idempotent() {
        let params = json!({"positive_prompt": "a red cube", "seed": 42, "batch_size": 2});
        let once = inject_parameters(&workflow(), &params);
        let twice = inject_parameters(&once, &params);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_original_workflow_untouched() {
        let original = workflow();
        let params = json!({"seed": 99});
        let _ = inject_parameters(&original, &params);
        assert_eq!(original["17"]["inputs"]["seed"], 0);
    }
}
