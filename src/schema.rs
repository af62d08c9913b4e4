//! Declarative description of one provider's wire contract.
//!
//! A [`SchemaDoc`] is loaded once from JSON, validated, and never mutated
//! again — it is shared by `Arc` across every [`crate::context::Context`]
//! bound to it, and across threads.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SchemaError;

/// One provider's complete wire contract, as loaded from a schema JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDoc {
    /// Provider identity block.
    pub provider: ProviderInfo,
    /// Endpoint and transport-level API info.
    pub api: ApiInfo,
    /// Authentication descriptor.
    #[serde(default)]
    pub authentication: Option<Authentication>,
    /// Header templates.
    #[serde(default)]
    pub headers: Headers,
    /// Model availability.
    #[serde(default)]
    pub models: Models,
    /// JSON skeleton used as the base of every synthesized request.
    pub request_template: Value,
    /// Declarative parameter constraints, keyed by parameter/field name.
    #[serde(default)]
    pub parameters: HashMap<String, ParamConstraint>,
    /// Roles this provider's messages may use.
    pub message_roles: Vec<String>,
    /// Whether and how a system message is carried.
    #[serde(default)]
    pub system_message: SystemMessageSpec,
    /// Multimodal (image) support.
    #[serde(default)]
    pub multimodal: MultimodalSpec,
    /// Message and content shape descriptors.
    pub message_format: MessageFormat,
    /// Response/error/stream extraction paths.
    pub response_format: ResponseFormat,
    /// Context-length and rate-limit hints (advisory; not enforced by the core).
    #[serde(default)]
    pub limits: Limits,
    /// Capability flags.
    #[serde(default)]
    pub features: Features,
    /// HTTP status code -> semantic error type name.
    #[serde(default)]
    pub error_codes: HashMap<String, String>,
    /// Structural validation rules for requests built from this schema.
    #[serde(default)]
    pub validation: ValidationRules,
}

/// `provider` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Canonical provider name, used as the registry key.
    pub name: String,
    /// Human-readable display name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Schema document revision.
    #[serde(default)]
    pub version: Option<String>,
    /// Upstream API version this schema targets.
    #[serde(default)]
    pub api_version: Option<String>,
}

/// `api` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiInfo {
    /// Full endpoint URL the Sink should POST to.
    pub endpoint: String,
    /// HTTP method — always `"POST"` for every schema currently expressible.
    #[serde(default = "default_method")]
    pub method: String,
    /// Request timeout hint, in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Advisory retry count; the core never retries on its own.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_method() -> String {
    "POST".to_string()
}

/// `authentication` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authentication {
    /// Authentication mechanism; currently only `"header"` is implemented.
    #[serde(rename = "type")]
    pub auth_type: String,
    /// Header name the API key is carried in.
    pub key_name: String,
    /// Prefix prepended to the key value (e.g. `"Bearer "`).
    #[serde(default)]
    pub key_prefix: String,
    /// Placeholder token appearing in `headers.required`/`headers.optional`
    /// that gets substituted with the resolved API key.
    #[serde(default = "default_key_placeholder")]
    pub key_placeholder: String,
}

fn default_key_placeholder() -> String {
    "<YOUR_API_KEY>".to_string()
}

/// `headers` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Headers {
    /// Headers that must be present on every request.
    #[serde(default)]
    pub required: HashMap<String, String>,
    /// Headers included only if a value is available.
    #[serde(default)]
    pub optional: HashMap<String, String>,
}

/// `models` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Models {
    /// Currently supported model identifiers.
    #[serde(default)]
    pub available: Vec<String>,
    /// Still-accepted but discouraged model identifiers.
    #[serde(default)]
    pub deprecated: Vec<String>,
    /// Model used when the caller never calls `set_model`.
    #[serde(default)]
    pub default: Option<String>,
}

/// One parameter's declarative constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamConstraint {
    /// Declared kind.
    #[serde(rename = "type")]
    pub kind: ParamKind,
    /// Whether `build_request` must fail if this parameter is unset.
    #[serde(default)]
    pub required: bool,
    /// Inclusive minimum, for numeric kinds.
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive maximum, for numeric kinds.
    #[serde(default)]
    pub max: Option<f64>,
    /// Default value applied if the caller never sets this parameter.
    #[serde(default)]
    pub default: Option<Value>,
    /// Allowed values, for enumerated parameters.
    #[serde(default)]
    pub r#enum: Option<Vec<Value>>,
}

/// Declarative parameter kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// Whole number.
    Integer,
    /// Floating-point number.
    Float,
    /// Boolean flag.
    Boolean,
    /// Free-form or enumerated string.
    String,
    /// JSON array.
    Array,
}

/// `system_message` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemMessageSpec {
    /// Whether this provider accepts a system message at all.
    #[serde(default)]
    pub supported: bool,
    /// Top-level request field name to place the system text in, when the
    /// provider carries it outside the message list (Anthropic-style). If
    /// absent, the system message is prepended as a `role: "system"` Message.
    #[serde(default)]
    pub field: Option<String>,
    /// Declared JSON type of that field (informational only).
    #[serde(default)]
    pub r#type: Option<String>,
    /// Role name used when the system message is prepended as a Message.
    #[serde(default = "default_system_role")]
    pub role: String,
}

fn default_system_role() -> String {
    "system".to_string()
}

/// `multimodal` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MultimodalSpec {
    /// Whether image content parts are accepted.
    #[serde(default)]
    pub supported: bool,
    /// Accepted content-part kinds, e.g. `["text", "image"]`.
    #[serde(default)]
    pub supported_types: Vec<String>,
    /// Accepted image MIME subtypes, e.g. `["png", "jpeg"]`.
    #[serde(default)]
    pub image_formats: Vec<String>,
    /// Maximum image payload size in bytes, if declared.
    #[serde(default)]
    pub max_image_size: Option<u64>,
    /// Maximum number of images per message, if declared.
    #[serde(default)]
    pub max_images_per_message: Option<u32>,
}

/// `message_format` section: shape templates used to synthesize message and
/// content-part JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFormat {
    /// Template for one message object, e.g. `{"role": "<ROLE>", "content": "<TEXT_CONTENT>"}`.
    pub structure: Value,
    /// Template for the system message, when carried as a top-level field.
    #[serde(default)]
    pub system_structure: Option<Value>,
    /// Content-part templates, keyed by `"text"` / `"image"`.
    pub content_types: ContentTypes,
}

/// `message_format.content_types` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentTypes {
    /// Template for a text content part.
    pub text: Value,
    /// Template for an image content part.
    #[serde(default)]
    pub image: Option<Value>,
}

/// `response_format` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFormat {
    /// Paths used to extract a successful response.
    pub success: SuccessPaths,
    /// Paths used to extract an error response.
    #[serde(default)]
    pub error: ErrorPaths,
    /// Paths used to parse streaming deltas.
    #[serde(default)]
    pub stream: StreamPaths,
}

/// `response_format.success` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessPaths {
    /// Path to the assistant's text (or content-item array).
    pub text_path: ExtractionPath,
    /// Path to the full content value, returned verbatim.
    #[serde(default)]
    pub content_path: Option<ExtractionPath>,
    /// Path to usage statistics.
    #[serde(default)]
    pub usage_path: Option<ExtractionPath>,
    /// Path to the model name actually used.
    #[serde(default)]
    pub model_path: Option<ExtractionPath>,
    /// Path to the stop/finish reason.
    #[serde(default)]
    pub stop_reason_path: Option<ExtractionPath>,
}

/// `response_format.error` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorPaths {
    /// Path to a human-readable error message.
    #[serde(default)]
    pub error_path: Option<ExtractionPath>,
    /// Path to a machine-readable error type.
    #[serde(default)]
    pub error_type_path: Option<ExtractionPath>,
    /// Path to a machine-readable error code.
    #[serde(default)]
    pub error_code_path: Option<ExtractionPath>,
}

/// `response_format.stream` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamPaths {
    /// Event type names this provider's stream may send (informational).
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Path to the incremental text delta within one SSE data frame.
    #[serde(default)]
    pub content_delta_path: Option<ExtractionPath>,
    /// Path to incremental usage statistics within one SSE data frame.
    #[serde(default)]
    pub usage_delta_path: Option<ExtractionPath>,
}

/// An ordered sequence of field names / array indices used to walk a
/// response JSON tree to a leaf value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtractionPath(pub Vec<PathSegment>);

impl ExtractionPath {
    /// Render the path as a human-readable debug string, e.g. `choices.0.message.content`.
    pub fn display(&self) -> Vec<String> {
        self.0.iter().map(|s| s.to_string()).collect()
    }
}

/// One segment of an [`ExtractionPath`]: either an object field name or an
/// array index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// Object field name.
    Field(String),
    /// Array index.
    Index(u64),
}

impl std::fmt::Display for PathSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSegment::Field(s) => write!(f, "{s}"),
            PathSegment::Index(i) => write!(f, "{i}"),
        }
    }
}

/// `limits` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Limits {
    /// Maximum total context length in tokens, if declared.
    #[serde(default)]
    pub max_context_length: Option<u64>,
    /// Maximum output tokens, if declared.
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
    /// Free-form rate-limit hints (advisory; the core does not enforce these).
    #[serde(default)]
    pub rate_limits: HashMap<String, Value>,
}

/// `features` capability flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Features {
    /// Whether this provider supports streaming (`stream: true` / SSE).
    #[serde(default)]
    pub streaming: bool,
    /// Whether this provider supports function/tool calling. Declared but
    /// not synthesized by the core in this revision.
    #[serde(default)]
    pub function_calling: bool,
    /// Whether this provider supports a strict JSON output mode.
    #[serde(default)]
    pub json_mode: bool,
    /// Whether this provider accepts image content parts.
    #[serde(default)]
    pub vision: bool,
    /// Whether this provider accepts a system message.
    #[serde(default)]
    pub system_messages: bool,
    /// Whether this provider is stateless per-request (always true for the
    /// providers this engine targets) or maintains server-side history.
    #[serde(default)]
    pub message_history: bool,
}

/// `validation` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationRules {
    /// Field names that `build_request` must confirm are non-null before emitting.
    #[serde(default)]
    pub required_fields: Vec<String>,
    /// Message-list shape rules.
    #[serde(default)]
    pub message_validation: MessageValidation,
}

/// `validation.message_validation` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageValidation {
    /// Minimum number of messages a request must carry.
    #[serde(default)]
    pub min_messages: Option<usize>,
    /// Whether consecutive messages must alternate roles.
    #[serde(default)]
    pub alternating_roles: bool,
    /// Role the last message in the list must have, if constrained.
    #[serde(default)]
    pub last_message_role: Option<String>,
}

impl SchemaDoc {
    /// Parse and structurally validate a schema document from raw JSON text.
    ///
    /// `provider_hint` is used only to produce clearer error messages; the
    /// authoritative provider name is `provider.name` inside the document.
    pub fn parse(provider_hint: &str, text: &str) -> Result<Self, SchemaError> {
        let doc: SchemaDoc =
            serde_json::from_str(text).map_err(|source| SchemaError::MalformedJson {
                provider: provider_hint.to_string(),
                source,
            })?;
        doc.validate()?;
        Ok(doc)
    }

    /// Run the structural checks described in §4.1 of the specification.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let provider = self.provider.name.clone();
        let fail = |reason: String| SchemaError::Invalid {
            provider: provider.clone(),
            reason,
        };

        if self.provider.name.trim().is_empty() {
            return Err(fail("provider.name must not be empty".to_string()));
        }
        if self.api.endpoint.trim().is_empty() {
            return Err(fail("api.endpoint must not be empty".to_string()));
        }
        if self.api.method.to_uppercase() != "POST" {
            return Err(fail(format!(
                "api.method must be POST, got {}",
                self.api.method
            )));
        }
        if !self.request_template.is_object() {
            return Err(fail("request_template must be a JSON object".to_string()));
        }
        if self.message_roles.is_empty() {
            return Err(fail("message_roles must not be empty".to_string()));
        }
        if self.response_format.success.text_path.0.is_empty() {
            return Err(fail(
                "response_format.success.text_path must not be empty".to_string(),
            ));
        }
        if self.headers.required.is_empty() && self.authentication.is_none() {
            return Err(fail(
                "schema must declare headers.required or an authentication block".to_string(),
            ));
        }

        for (name, constraint) in &self.parameters {
            if let (Some(min), Some(max)) = (constraint.min, constraint.max) {
                if min > max {
                    return Err(fail(format!(
                        "parameter {name}: min ({min}) must be <= max ({max})"
                    )));
                }
            }
            if matches!(constraint.kind, ParamKind::String) {
                if let Some(values) = &constraint.r#enum {
                    if values.is_empty() {
                        return Err(fail(format!(
                            "parameter {name}: enum constraint must not be empty"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Union of `models.available` and `models.deprecated`.
    pub fn all_known_models(&self) -> Vec<&str> {
        self.models
            .available
            .iter()
            .chain(self.models.deprecated.iter())
            .map(String::as_str)
            .collect()
    }

    /// Whether `name` appears in `models.deprecated` (and not in `available`).
    pub fn is_deprecated_model(&self, name: &str) -> bool {
        self.models.deprecated.iter().any(|m| m == name) && !self.models.available.iter().any(|m| m == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_openai_json() -> &'static str {
        r#"{
            "provider": { "name": "openai", "display_name": "OpenAI" },
            "api": { "endpoint": "https://api.openai.com/v1/chat/completions", "method": "POST" },
            "authentication": { "type": "header", "key_name": "Authorization", "key_prefix": "Bearer ", "key_placeholder": "<YOUR_API_KEY>" },
            "headers": { "required": { "Content-Type": "application/json" } },
            "models": { "available": ["gpt-4o"], "deprecated": ["gpt-3.5-turbo"], "default": "gpt-4o" },
            "request_template": { "model": "gpt-4o", "messages": [] },
            "parameters": {
                "temperature": { "type": "float", "required": false, "min": 0.0, "max": 2.0, "default": 1.0 },
                "max_tokens": { "type": "integer", "required": false, "min": 1, "max": 4096 }
            },
            "message_roles": ["system", "user", "assistant"],
            "system_message": { "supported": true, "role": "system" },
            "multimodal": { "supported": false },
            "message_format": {
                "structure": { "role": "<ROLE>", "content": "<TEXT_CONTENT>" },
                "content_types": { "text": "<TEXT_CONTENT>" }
            },
            "response_format": {
                "success": { "text_path": ["choices", 0, "message", "content"] },
                "error": { "error_path": ["error", "message"] },
                "stream": { "content_delta_path": ["choices", 0, "delta", "content"] }
            },
            "features": { "streaming": true, "system_messages": true }
        }"#
    }

    #[test]
    fn parses_and_validates_minimal_openai_schema() {
        let doc = SchemaDoc::parse("openai", sample_openai_json()).unwrap();
        assert_eq!(doc.provider.name, "openai");
        assert_eq!(
            doc.response_format.success.text_path.0,
            vec![
                PathSegment::Field("choices".into()),
                PathSegment::Index(0),
                PathSegment::Field("message".into()),
                PathSegment::Field("content".into()),
            ]
        );
        assert!(doc.features.streaming);
        assert!(!doc.multimodal.supported);
    }

    #[test]
    fn rejects_missing_text_path() {
        let mut value: Value = serde_json::from_str(sample_openai_json()).unwrap();
        value["response_format"]["success"]["text_path"] = serde_json::json!([]);
        let text = serde_json::to_string(&value).unwrap();
        let err = SchemaDoc::parse("openai", &text).unwrap_err();
        assert!(matches!(err, SchemaError::Invalid { .. }));
    }

    #[test]
    fn rejects_min_greater_than_max() {
        let mut value: Value = serde_json::from_str(sample_openai_json()).unwrap();
        value["parameters"]["temperature"]["min"] = serde_json::json!(3.0);
        let text = serde_json::to_string(&value).unwrap();
        let err = SchemaDoc::parse("openai", &text).unwrap_err();
        assert!(matches!(err, SchemaError::Invalid { .. }));
    }

    #[test]
    fn rejects_non_post_method() {
        let mut value: Value = serde_json::from_str(sample_openai_json()).unwrap();
        value["api"]["method"] = serde_json::json!("GET");
        let text = serde_json::to_string(&value).unwrap();
        let err = SchemaDoc::parse("openai", &text).unwrap_err();
        assert!(matches!(err, SchemaError::Invalid { .. }));
    }

    #[test]
    fn all_known_models_unions_available_and_deprecated() {
        let doc = SchemaDoc::parse("openai", sample_openai_json()).unwrap();
        let known = doc.all_known_models();
        assert!(known.contains(&"gpt-4o"));
        assert!(known.contains(&"gpt-3.5-turbo"));
        assert!(doc.is_deprecated_model("gpt-3.5-turbo"));
        assert!(!doc.is_deprecated_model("gpt-4o"));
    }
}
