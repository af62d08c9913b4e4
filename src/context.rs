//! Mutable per-conversation state bound to one [`SchemaDoc`].
//!
//! A `Context` accumulates messages, parameters, and a model selection, and
//! knows how to turn that state into a request body shaped exactly the way
//! its schema describes — and how to pull an assistant's reply back out of
//! an arbitrarily-shaped response.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{Error, ResponseShapeError, SchemaError, ValidationError};
use crate::schema::{ExtractionPath, ParamConstraint, ParamKind, PathSegment, SchemaDoc};

/// A single leaf payload inside a message: either text or an inline image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text itself.
        text: String,
    },
    /// An inline, base64-encoded image.
    Image {
        /// MIME subtype, e.g. `"image/png"`.
        media_type: String,
        /// Base64-encoded image bytes.
        base64_data: String,
    },
}

/// One turn in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role, drawn from the schema's declared role set.
    pub role: String,
    /// Ordered content parts making up this turn.
    pub content: Vec<ContentPart>,
}

/// Ctor-time defaults overlaid onto a schema's own parameter defaults.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Whether mutation and request-synthesis operations enforce schema
    /// constraints. Disabling this is intended for trusted, pre-validated
    /// callers only.
    pub enable_validation: bool,
    /// Whether streaming-related bookkeeping (the `stream` field) is honored.
    pub enable_streaming_support: bool,
    /// Default value for a `max_tokens`-shaped parameter, if the schema
    /// declares one under that name.
    pub default_max_tokens: Option<u64>,
    /// Default value for a `temperature`-shaped parameter, if the schema
    /// declares one under that name.
    pub default_temperature: Option<f64>,
    /// Additional parameter defaults applied at construction and on `reset`.
    pub custom_parameters: HashMap<String, Value>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            enable_validation: true,
            enable_streaming_support: true,
            default_max_tokens: None,
            default_temperature: None,
            custom_parameters: HashMap::new(),
        }
    }
}

/// Mutable conversation state bound to exactly one [`SchemaDoc`].
#[derive(Debug)]
pub struct Context {
    schema: Arc<SchemaDoc>,
    config: ContextConfig,
    model: String,
    system_message: Option<String>,
    parameters: HashMap<String, Value>,
    api_key: Option<Secret<String>>,
    messages: Vec<Message>,
}

impl Context {
    /// Construct a new Context bound to `schema`, with `config`'s defaults
    /// overlaid onto the schema's own parameter defaults.
    pub fn new(schema: Arc<SchemaDoc>, config: ContextConfig) -> Result<Self, Error> {
        let parameters = Self::default_parameters(&schema, &config);
        let model = schema.models.default.clone().unwrap_or_default();
        Ok(Self {
            schema,
            config,
            model,
            system_message: None,
            parameters,
            api_key: None,
            messages: Vec::new(),
        })
    }

    fn default_parameters(schema: &SchemaDoc, config: &ContextConfig) -> HashMap<String, Value> {
        let mut parameters = HashMap::new();
        for (name, constraint) in &schema.parameters {
            if let Some(default) = &constraint.default {
                parameters.insert(name.clone(), default.clone());
            }
        }
        if let Some(mt) = config.default_max_tokens {
            if schema.parameters.contains_key("max_tokens") {
                parameters.insert("max_tokens".to_string(), json!(mt));
            }
        }
        if let Some(temp) = config.default_temperature {
            if schema.parameters.contains_key("temperature") {
                parameters.insert("temperature".to_string(), json!(temp));
            }
        }
        for (k, v) in &config.custom_parameters {
            parameters.insert(k.clone(), v.clone());
        }
        parameters
    }

    /// The schema this context is bound to.
    pub fn schema(&self) -> &Arc<SchemaDoc> {
        &self.schema
    }

    /// Currently selected model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Currently set system message text, if any.
    pub fn system_message(&self) -> Option<&str> {
        self.system_message.as_deref()
    }

    /// Current parameter map.
    pub fn parameters(&self) -> &HashMap<String, Value> {
        &self.parameters
    }

    /// Messages in transmission order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Select the active model. If validation is enabled and the schema
    /// declares any models, `name` must be in the union of `available` and
    /// `deprecated`.
    pub fn set_model(&mut self, name: impl Into<String>) -> Result<&mut Self, Error> {
        let name = name.into();
        if self.config.enable_validation {
            let has_model_list =
                !self.schema.models.available.is_empty() || !self.schema.models.deprecated.is_empty();
            if has_model_list && !self.schema.all_known_models().contains(&name.as_str()) {
                return Err(ValidationError::UnknownModel(name).into());
            }
            if self.schema.is_deprecated_model(&name) {
                warn!(
                    "model {name} is deprecated for provider {}",
                    self.schema.provider.name
                );
            }
        }
        self.model = name;
        Ok(self)
    }

    /// Set the system message. Requires `system_message.supported` on the schema.
    pub fn set_system_message(&mut self, text: impl Into<String>) -> Result<&mut Self, Error> {
        if self.config.enable_validation && !self.schema.system_message.supported {
            return Err(ValidationError::SystemMessageUnsupported.into());
        }
        self.system_message = Some(text.into());
        Ok(self)
    }

    /// Set one parameter, validating its kind/range/enum against the
    /// schema's declared constraint when validation is enabled.
    pub fn set_parameter(&mut self, key: impl Into<String>, value: Value) -> Result<&mut Self, Error> {
        let key = key.into();
        if self.config.enable_validation {
            let constraint = self
                .schema
                .parameters
                .get(&key)
                .ok_or_else(|| ValidationError::UnknownParameter(key.clone()))?;
            if value.is_null() {
                if constraint.required {
                    return Err(ValidationError::RequiredParameterNull(key).into());
                }
            } else {
                validate_param_value(&key, constraint, &value)?;
            }
        }
        if value.is_null() {
            self.parameters.remove(&key);
        } else {
            self.parameters.insert(key, value);
        }
        Ok(self)
    }

    /// Apply `set_parameter` entry-wise.
    pub fn set_parameters(&mut self, params: HashMap<String, Value>) -> Result<&mut Self, Error> {
        for (key, value) in params {
            self.set_parameter(key, value)?;
        }
        Ok(self)
    }

    /// Remove every parameter override (schema/config defaults are not reapplied).
    pub fn clear_parameters(&mut self) -> &mut Self {
        self.parameters.clear();
        self
    }

    /// Remove every message.
    pub fn clear_messages(&mut self) -> &mut Self {
        self.messages.clear();
        self
    }

    /// Remove the most recently added message if its role is `"user"`,
    /// returning it. Used by the facade's "replace the last user turn"
    /// send option; a no-op (returns `None`) if the conversation is empty or
    /// its last turn belongs to some other role.
    pub fn pop_last_user_message(&mut self) -> Option<Message> {
        if self.messages.last().map(|m| m.role == "user").unwrap_or(false) {
            self.messages.pop()
        } else {
            None
        }
    }

    /// Clear messages and reset parameters back to schema/config defaults.
    pub fn reset(&mut self) -> &mut Self {
        self.messages.clear();
        self.parameters = Self::default_parameters(&self.schema, &self.config);
        self
    }

    /// Set the API key used to authenticate outgoing requests.
    pub fn set_api_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.api_key = Some(Secret::new(key.into()));
        self
    }

    /// Whether an API key has been set.
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Append a user-role message, optionally carrying an inline image.
    ///
    /// If `media_data` is already base64-encoded text it is used as-is;
    /// otherwise it is treated as a filesystem path, read, and encoded.
    pub fn add_user_message(
        &mut self,
        text: impl Into<String>,
        media_type: Option<&str>,
        media_data: Option<&str>,
    ) -> Result<&mut Self, Error> {
        self.add_message("user", text, media_type, media_data)
    }

    /// Append a text-only assistant-role message.
    pub fn add_assistant_message(&mut self, text: impl Into<String>) -> Result<&mut Self, Error> {
        self.add_message("assistant", text, None, None)
    }

    /// Append a message with an explicit role, which must be declared in
    /// the schema's `message_roles`.
    pub fn add_message(
        &mut self,
        role: impl Into<String>,
        text: impl Into<String>,
        media_type: Option<&str>,
        media_data: Option<&str>,
    ) -> Result<&mut Self, Error> {
        let role = role.into();
        if !self.schema.message_roles.iter().any(|r| r == &role) {
            return Err(ValidationError::UnknownRole(role).into());
        }

        let mut content = vec![ContentPart::Text { text: text.into() }];
        if let Some(mt) = media_type {
            if self.config.enable_validation && !self.schema.multimodal.supported {
                return Err(ValidationError::MultimodalUnsupported.into());
            }
            let data = media_data.ok_or_else(|| {
                Error::from(ValidationError::ParameterConstraint {
                    name: "media_data".to_string(),
                    reason: "media_type was set without media_data".to_string(),
                })
            })?;
            content.push(ContentPart::Image {
                media_type: mt.to_string(),
                base64_data: resolve_media_data(data)?,
            });
        }

        if self.config.enable_validation && self.schema.validation.message_validation.alternating_roles {
            if let Some(last) = self.messages.last() {
                if last.role == role {
                    return Err(ValidationError::AlternatingRoleViolation(role).into());
                }
            }
        }

        self.messages.push(Message { role, content });
        Ok(self)
    }

    /// Whether `build_request` would currently succeed, without building it.
    pub fn is_valid_request(&self) -> bool {
        self.validate_for_request().is_ok()
    }

    fn validate_for_request(&self) -> Result<(), Error> {
        let rules = &self.schema.validation.message_validation;
        let min_messages = rules.min_messages.unwrap_or(1).max(1);
        if self.messages.len() < min_messages {
            return Err(ValidationError::EmptyMessageList.into());
        }
        if rules.alternating_roles {
            for pair in self.messages.windows(2) {
                if pair[0].role == pair[1].role {
                    return Err(ValidationError::AlternatingRoleViolation(pair[1].role.clone()).into());
                }
            }
        }
        if let Some(expected) = &rules.last_message_role {
            if self.messages.last().map(|m| &m.role) != Some(expected) {
                return Err(ValidationError::LastMessageRole(expected.clone()).into());
            }
        }
        Ok(())
    }

    /// Synthesize a request body per §4.2: template copy, model, parameters,
    /// messages, system-message placement, streaming flag, null stripping,
    /// and (when validation is enabled) structural assertions.
    pub fn build_request(&self, streaming: bool) -> Result<Value, Error> {
        if self.config.enable_validation {
            self.validate_for_request()?;
        }

        let mut request = self.schema.request_template.clone();
        {
            let obj = request
                .as_object_mut()
                .ok_or_else(|| SchemaError::Invalid {
                    provider: self.schema.provider.name.clone(),
                    reason: "request_template is not a JSON object".to_string(),
                })?;

            obj.insert("model".to_string(), Value::String(self.model.clone()));

            for (key, value) in &self.parameters {
                obj.insert(key.clone(), value.clone());
            }

            let mut all_messages: Vec<Message> = Vec::new();
            if let Some(sys_text) = &self.system_message {
                match &self.schema.system_message.field {
                    Some(field_name) => {
                        obj.insert(field_name.clone(), Value::String(sys_text.clone()));
                    }
                    None => {
                        all_messages.push(Message {
                            role: self.schema.system_message.role.clone(),
                            content: vec![ContentPart::Text {
                                text: sys_text.clone(),
                            }],
                        });
                    }
                }
            }
            all_messages.extend(self.messages.iter().cloned());

            let mut rendered_messages = Vec::with_capacity(all_messages.len());
            for message in &all_messages {
                rendered_messages.push(self.render_message(message)?);
            }
            obj.insert("messages".to_string(), Value::Array(rendered_messages));

            if self.schema.features.streaming && self.config.enable_streaming_support {
                obj.insert("stream".to_string(), Value::Bool(streaming));
            }
        }

        strip_nulls(&mut request);

        if self.config.enable_validation {
            for field in &self.schema.validation.required_fields {
                match request.get(field) {
                    Some(v) if !v.is_null() => {}
                    _ => return Err(ValidationError::MissingRequiredField(field.clone()).into()),
                }
            }
        }

        Ok(request)
    }

    fn render_message(&self, message: &Message) -> Result<Value, Error> {
        let mut rendered = self.schema.message_format.structure.clone();
        substitute_in_place(&mut rendered, "<ROLE>", &message.role);

        let flat_text_mode = rendered
            .get("content")
            .map(|v| v == &Value::String("<TEXT_CONTENT>".to_string()))
            .unwrap_or(false)
            && message.content.len() == 1
            && matches!(message.content.first(), Some(ContentPart::Text { .. }));

        if flat_text_mode {
            if let Some(ContentPart::Text { text }) = message.content.first() {
                if let Some(obj) = rendered.as_object_mut() {
                    obj.insert("content".to_string(), Value::String(text.clone()));
                }
            }
        } else {
            let mut parts = Vec::with_capacity(message.content.len());
            for part in &message.content {
                let part_json = match part {
                    ContentPart::Text { text } => {
                        let mut part_template = self.schema.message_format.content_types.text.clone();
                        substitute_in_place(&mut part_template, "<TEXT_CONTENT>", text);
                        part_template
                    }
                    ContentPart::Image {
                        media_type,
                        base64_data,
                    } => {
                        let template = self
                            .schema
                            .message_format
                            .content_types
                            .image
                            .as_ref()
                            .ok_or_else(|| SchemaError::Invalid {
                                provider: self.schema.provider.name.clone(),
                                reason: "schema has no image content-type template".to_string(),
                            })?;
                        let mut part_template = template.clone();
                        substitute_in_place(&mut part_template, "<MEDIA_TYPE>", media_type);
                        substitute_in_place(&mut part_template, "<MEDIA_DATA>", base64_data);
                        part_template
                    }
                };
                parts.push(part_json);
            }
            if let Some(obj) = rendered.as_object_mut() {
                obj.insert("content".to_string(), Value::Array(parts));
            }
        }

        Ok(rendered)
    }

    /// Clone the schema's header templates and substitute the API-key
    /// placeholder using its authentication descriptor.
    pub fn build_headers(&self) -> Result<HashMap<String, String>, Error> {
        let mut headers: HashMap<String, String> = HashMap::new();
        for (k, v) in self.schema.headers.required.iter().chain(self.schema.headers.optional.iter()) {
            headers.insert(k.clone(), v.clone());
        }

        if let Some(auth) = &self.schema.authentication {
            let key = self
                .api_key
                .as_ref()
                .map(|s| s.expose_secret().as_str())
                .unwrap_or("");

            // Header templates that already embed the placeholder carry any
            // prefix (e.g. "Bearer ") as literal text around it, so only the
            // bare key is substituted in. The key_prefix is applied only when
            // we fall back to inserting a fresh header below.
            let mut substituted_any = false;
            for value in headers.values_mut() {
                if value.contains(auth.key_placeholder.as_str()) {
                    *value = value.replace(auth.key_placeholder.as_str(), key);
                    substituted_any = true;
                }
            }
            if !substituted_any {
                let resolved = format!("{}{}", auth.key_prefix, key);
                headers.entry(auth.key_name.clone()).or_insert(resolved);
            }
        }

        Ok(headers)
    }

    /// Walk `text_path`, returning the assistant's text. If the terminal
    /// value is a string, it's returned directly; if it's an array of
    /// content items, the `text` field of every item whose `type` is
    /// `"text"` is concatenated.
    pub fn extract_text_response(&self, response: &Value) -> Result<String, ResponseShapeError> {
        let path = &self.schema.response_format.success.text_path;
        let leaf = walk_path(response, path)?;
        match leaf {
            Value::String(s) => Ok(s.clone()),
            Value::Array(items) => {
                let mut out = String::new();
                for item in items {
                    if item.get("type").and_then(Value::as_str) == Some("text") {
                        if let Some(text) = item.get("text").and_then(Value::as_str) {
                            out.push_str(text);
                        }
                    }
                }
                Ok(out)
            }
            _ => Err(ResponseShapeError::UnexpectedLeafType(path.display())),
        }
    }

    /// Return the value at `content_path` verbatim.
    pub fn extract_full_response(&self, response: &Value) -> Result<Value, ResponseShapeError> {
        let path = self
            .schema
            .response_format
            .success
            .content_path
            .as_ref()
            .ok_or_else(|| ResponseShapeError::PathNotFound {
                path: vec![],
                missing: "content_path".to_string(),
            })?;
        Ok(walk_path(response, path)?.clone())
    }

    /// Walk `error_path`; return the string found there, or an empty string
    /// if the schema declares no error path or it can't be resolved.
    ///
    /// If `error_path` resolves to nothing (or the schema doesn't declare
    /// one), falls back to whatever bare machine-readable code or type
    /// `error_code_path`/`error_type_path` resolve to.
    pub fn extract_error(&self, response: &Value) -> String {
        let paths = &self.schema.response_format.error;

        if let Some(path) = &paths.error_path {
            if let Ok(value) = walk_path(response, path) {
                let message = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if !message.is_empty() {
                    return message;
                }
            }
        }

        for path in [&paths.error_code_path, &paths.error_type_path].into_iter().flatten() {
            if let Ok(value) = walk_path(response, path) {
                return match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
            }
        }

        String::new()
    }

    /// The schema's declared semantic name for an HTTP status code (e.g.
    /// `"400"` -> `"invalid_request_error"`), if one is declared. Used by the
    /// facade to enrich a transport error when the response body carried no
    /// extractable error message of its own.
    pub fn error_code_for_status(&self, status: u16) -> Option<&str> {
        self.schema.error_codes.get(&status.to_string()).map(String::as_str)
    }

    /// Walk `content_delta_path` against one already-JSON-parsed streaming
    /// frame. Missing deltas (e.g. a ping or usage-only frame) are tolerated
    /// and reported as `Ok(None)`; only a schema with no declared delta path
    /// at all is an error.
    pub fn extract_stream_delta(&self, frame: &Value) -> Result<Option<String>, ResponseShapeError> {
        let path = self
            .schema
            .response_format
            .stream
            .content_delta_path
            .as_ref()
            .ok_or_else(|| ResponseShapeError::PathNotFound {
                path: vec![],
                missing: "content_delta_path".to_string(),
            })?;
        match walk_path(frame, path) {
            Ok(Value::String(s)) if !s.is_empty() => Ok(Some(s.clone())),
            _ => Ok(None),
        }
    }

    /// Serialize `{model, system_message, parameters, messages}` plus the
    /// bound provider name.
    pub fn export_state(&self) -> Value {
        json!({
            "provider": self.schema.provider.name,
            "model": self.model,
            "system_message": self.system_message,
            "parameters": self.parameters,
            "messages": self.messages,
        })
    }

    /// Replace state atomically from a previously exported snapshot. The
    /// snapshot's provider must match this context's schema.
    pub fn import_state(&mut self, snapshot: Value) -> Result<(), Error> {
        let provider = snapshot
            .get("provider")
            .and_then(Value::as_str)
            .ok_or_else(|| SchemaError::Invalid {
                provider: self.schema.provider.name.clone(),
                reason: "state snapshot is missing a provider field".to_string(),
            })?;
        if provider != self.schema.provider.name {
            return Err(ValidationError::ProviderMismatch {
                snapshot: provider.to_string(),
                context: self.schema.provider.name.clone(),
            }
            .into());
        }

        let messages: Vec<Message> = serde_json::from_value(
            snapshot.get("messages").cloned().unwrap_or(Value::Array(vec![])),
        )
        .map_err(|_| SchemaError::Invalid {
            provider: self.schema.provider.name.clone(),
            reason: "state snapshot messages did not match the expected shape".to_string(),
        })?;
        let parameters: HashMap<String, Value> = serde_json::from_value(
            snapshot.get("parameters").cloned().unwrap_or(Value::Object(Default::default())),
        )
        .map_err(|_| SchemaError::Invalid {
            provider: self.schema.provider.name.clone(),
            reason: "state snapshot parameters did not match the expected shape".to_string(),
        })?;
        let model = snapshot
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.model.clone());
        let system_message = snapshot
            .get("system_message")
            .and_then(Value::as_str)
            .map(str::to_string);

        self.model = model;
        self.system_message = system_message;
        self.parameters = parameters;
        self.messages = messages;
        Ok(())
    }
}

fn resolve_media_data(data: &str) -> Result<String, Error> {
    let path = Path::new(data);
    if path.is_file() {
        let bytes = std::fs::read(path).map_err(|source| SchemaError::Io {
            path: data.to_string(),
            source,
        })?;
        Ok(BASE64.encode(bytes))
    } else {
        Ok(data.to_string())
    }
}

fn validate_param_value(name: &str, constraint: &ParamConstraint, value: &Value) -> Result<(), ValidationError> {
    let mismatch = |kind: &str| ValidationError::ParameterConstraint {
        name: name.to_string(),
        reason: format!("expected a {kind} value, got {value}"),
    };

    match constraint.kind {
        ParamKind::Integer => {
            let n = value.as_i64().ok_or_else(|| mismatch("integer"))?;
            check_range(name, constraint, n as f64)?;
        }
        ParamKind::Float => {
            let n = value.as_f64().ok_or_else(|| mismatch("float"))?;
            check_range(name, constraint, n)?;
        }
        ParamKind::Boolean => {
            value.as_bool().ok_or_else(|| mismatch("boolean"))?;
        }
        ParamKind::String => {
            let s = value.as_str().ok_or_else(|| mismatch("string"))?;
            if let Some(allowed) = &constraint.r#enum {
                if !allowed.iter().any(|v| v.as_str() == Some(s)) {
                    return Err(ValidationError::ParameterConstraint {
                        name: name.to_string(),
                        reason: format!("{s} is not one of the allowed values"),
                    });
                }
            }
        }
        ParamKind::Array => {
            value.as_array().ok_or_else(|| mismatch("array"))?;
        }
    }
    Ok(())
}

fn check_range(name: &str, constraint: &ParamConstraint, n: f64) -> Result<(), ValidationError> {
    if let Some(min) = constraint.min {
        if n < min {
            return Err(ValidationError::ParameterConstraint {
                name: name.to_string(),
                reason: format!("{n} is below minimum {min}"),
            });
        }
    }
    if let Some(max) = constraint.max {
        if n > max {
            return Err(ValidationError::ParameterConstraint {
                name: name.to_string(),
                reason: format!("{n} is above maximum {max}"),
            });
        }
    }
    Ok(())
}

fn walk_path<'a>(value: &'a Value, path: &ExtractionPath) -> Result<&'a Value, ResponseShapeError> {
    let mut current = value;
    for segment in &path.0 {
        current = match segment {
            PathSegment::Field(name) => current.get(name),
            PathSegment::Index(idx) => current.get(*idx as usize),
        }
        .ok_or_else(|| ResponseShapeError::PathNotFound {
            path: path.display(),
            missing: segment.to_string(),
        })?;
    }
    Ok(current)
}

/// Replace `placeholder` wherever it appears inside a JSON string leaf,
/// whether the leaf is the placeholder verbatim (`"<ROLE>"` -> `"user"`) or
/// the placeholder is embedded in a larger template string (a data-URI
/// combining `<MEDIA_TYPE>` and `<MEDIA_DATA>` into one field, for example).
fn substitute_in_place(value: &mut Value, placeholder: &str, replacement: &str) {
    match value {
        Value::String(s) if s.contains(placeholder) => {
            *s = s.replace(placeholder, replacement);
        }
        Value::Array(items) => {
            for item in items {
                substitute_in_place(item, placeholder, replacement);
            }
        }
        Value::Object(map) => {
            for v in map.values_mut() {
                substitute_in_place(v, placeholder, replacement);
            }
        }
        _ => {}
    }
}

fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let null_keys: Vec<String> = map
                .iter()
                .filter(|(_, v)| v.is_null())
                .map(|(k, _)| k.clone())
                .collect();
            for key in null_keys {
                map.remove(&key);
            }
            for v in map.values_mut() {
                strip_nulls(v);
            }
        }
        Value::Array(items) => {
            items.retain(|v| !v.is_null());
            for v in items.iter_mut() {
                strip_nulls(v);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaDoc;

    fn openai_schema() -> Arc<SchemaDoc> {
        let json = r#"{
            "provider": { "name": "openai" },
            "api": { "endpoint": "https://api.openai.com/v1/chat/completions", "method": "POST" },
            "authentication": { "type": "header", "key_name": "Authorization", "key_prefix": "Bearer ", "key_placeholder": "<YOUR_API_KEY>" },
            "headers": { "required": { "Content-Type": "application/json", "Authorization": "Bearer <YOUR_API_KEY>" } },
            "models": { "available": ["gpt-4o"], "default": "gpt-4o" },
            "request_template": { "model": "gpt-4o", "messages": [] },
            "parameters": {
                "temperature": { "type": "float", "min": 0.0, "max": 2.0 },
                "max_tokens": { "type": "integer", "min": 1, "max": 4096 }
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
            "validation": { "message_validation": { "min_messages": 1, "last_message_role": "user" } },
            "features": { "streaming": true, "system_messages": true }
        }"#;
        Arc::new(SchemaDoc::parse("openai", json).unwrap())
    }

    fn anthropic_schema() -> Arc<SchemaDoc> {
        let json = r#"{
            "provider": { "name": "anthropic" },
            "api": { "endpoint": "https://api.anthropic.com/v1/messages", "method": "POST" },
            "authentication": { "type": "header", "key_name": "x-api-key", "key_prefix": "", "key_placeholder": "<YOUR_ANTHROPIC_API_KEY>" },
            "headers": { "required": { "Content-Type": "application/json" } },
            "models": { "available": ["claude-3-5-sonnet-20241022"], "default": "claude-3-5-sonnet-20241022" },
            "request_template": { "model": "claude-3-5-sonnet-20241022", "max_tokens": 1024, "messages": [] },
            "parameters": { "max_tokens": { "type": "integer", "min": 1, "max": 8192, "required": true } },
            "message_roles": ["user", "assistant"],
            "system_message": { "supported": true, "field": "system" },
            "multimodal": { "supported": true, "supported_types": ["text", "image"], "image_formats": ["png", "jpeg"] },
            "message_format": {
                "structure": { "role": "<ROLE>", "content": "<CONTENT_PARTS>" },
                "content_types": {
                    "text": { "type": "text", "text": "<TEXT_CONTENT>" },
                    "image": { "type": "image", "source": { "type": "base64", "media_type": "<MEDIA_TYPE>", "data": "<MEDIA_DATA>" } }
                }
            },
            "response_format": {
                "success": { "text_path": ["content"] },
                "error": { "error_path": ["error", "message"] },
                "stream": { "content_delta_path": ["delta", "text"] }
            },
            "features": { "streaming": true, "system_messages": true, "vision": true }
        }"#;
        Arc::new(SchemaDoc::parse("anthropic", json).unwrap())
    }

    #[test]
    fn scenario_single_turn_openai_shaped() {
        let schema = openai_schema();
        let mut ctx = Context::new(schema, ContextConfig::default()).unwrap();
        ctx.set_model("gpt-4o").unwrap();
        ctx.add_user_message("Ping", None, None).unwrap();

        let request = ctx.build_request(false).unwrap();
        assert_eq!(request["model"], "gpt-4o");
        assert_eq!(request["messages"][0]["role"], "user");
        assert_eq!(request["messages"][0]["content"], "Ping");
        assert_eq!(request["stream"], false);

        let response = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "Pong" } }]
        });
        let text = ctx.extract_text_response(&response).unwrap();
        assert_eq!(text, "Pong");

        ctx.add_assistant_message(&text).unwrap();
        assert_eq!(ctx.messages().len(), 2);
    }

    #[test]
    fn scenario_anthropic_system_field() {
        let schema = anthropic_schema();
        let mut ctx = Context::new(schema, ContextConfig::default()).unwrap();
        ctx.set_system_message("You are terse.").unwrap();
        ctx.add_user_message("Hi", None, None).unwrap();

        let request = ctx.build_request(false).unwrap();
        assert_eq!(request["system"], "You are terse.");
        assert_eq!(
            request["messages"],
            serde_json::json!([{ "role": "user", "content": [{ "type": "text", "text": "Hi" }] }])
        );
    }

    #[test]
    fn scenario_multimodal_claude_shaped() {
        let schema = anthropic_schema();
        let mut ctx = Context::new(schema, ContextConfig::default()).unwrap();
        // 1x1 transparent PNG, base64-encoded already.
        let tiny_png_b64 = "iVBORw0KGgoAAAANSUhEUgAAAAEAAAABCAQAAAC1HAwCAAAAC0lEQVR42mNk+A8AAQUBAScY42YAAAAASUVORK5CYII=";
        ctx.add_user_message("what is this", Some("image/png"), Some(tiny_png_b64))
            .unwrap();

        let request = ctx.build_request(false).unwrap();
        let content = &request["messages"][0]["content"];
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], "what is this");
        assert_eq!(content[1]["type"], "image");
        assert_eq!(content[1]["source"]["media_type"], "image/png");
        assert_eq!(content[1]["source"]["data"], tiny_png_b64);
    }

    #[test]
    fn rejects_multimodal_when_unsupported() {
        let schema = openai_schema();
        let mut ctx = Context::new(schema, ContextConfig::default()).unwrap();
        let err = ctx
            .add_user_message("hi", Some("image/png"), Some("ZGF0YQ=="))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::MultimodalUnsupported)));
    }

    #[test]
    fn empty_message_list_is_invalid() {
        let schema = openai_schema();
        let ctx = Context::new(schema, ContextConfig::default()).unwrap();
        assert!(!ctx.is_valid_request());
        let err = ctx.build_request(false).unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::EmptyMessageList)));
    }

    #[test]
    fn temperature_above_schema_max_is_rejected() {
        let schema = openai_schema();
        let mut ctx = Context::new(schema, ContextConfig::default()).unwrap();
        let err = ctx.set_parameter("temperature", json!(2.5)).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::ParameterConstraint { .. })
        ));
        assert!(ctx.set_parameter("temperature", json!(2.0)).is_ok());
    }

    #[test]
    fn reset_clears_messages_and_reapplies_defaults() {
        let schema = openai_schema();
        let config = ContextConfig {
            default_temperature: Some(0.5),
            ..ContextConfig::default()
        };
        let mut ctx = Context::new(schema, config).unwrap();
        ctx.add_user_message("hi", None, None).unwrap();
        ctx.set_parameter("max_tokens", json!(100)).unwrap();

        ctx.reset();

        assert!(ctx.messages().is_empty());
        assert_eq!(ctx.parameters().get("temperature"), Some(&json!(0.5)));
        assert_eq!(ctx.parameters().get("max_tokens"), None);
    }

    #[test]
    fn export_import_state_round_trips() {
        let schema = openai_schema();
        let mut ctx = Context::new(schema.clone(), ContextConfig::default()).unwrap();
        ctx.set_model("gpt-4o").unwrap();
        ctx.add_user_message("Hello", None, None).unwrap();
        ctx.add_assistant_message("Hi there").unwrap();
        ctx.set_parameter("temperature", json!(0.3)).unwrap();

        let snapshot = ctx.export_state();

        let mut ctx2 = Context::new(schema, ContextConfig::default()).unwrap();
        ctx2.import_state(snapshot.clone()).unwrap();

        assert_eq!(ctx2.export_state(), snapshot);
    }

    #[test]
    fn import_state_rejects_provider_mismatch() {
        let schema = openai_schema();
        let mut ctx = Context::new(schema, ContextConfig::default()).unwrap();
        let snapshot = json!({ "provider": "anthropic", "model": "x", "parameters": {}, "messages": [] });
        let err = ctx.import_state(snapshot).unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::ProviderMismatch { .. })));
    }

    #[test]
    fn alternating_role_violation_is_rejected_eagerly() {
        let schema = anthropic_schema();
        let mut ctx = Context::new(schema, ContextConfig::default()).unwrap();
        ctx.add_user_message("one", None, None).unwrap();
        let err = ctx.add_user_message("two", None, None).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::AlternatingRoleViolation(_))
        ));
    }

    #[test]
    fn pop_last_user_message_only_pops_trailing_user_turns() {
        let schema = openai_schema();
        let mut ctx = Context::new(schema, ContextConfig::default()).unwrap();
        assert!(ctx.pop_last_user_message().is_none());

        ctx.add_user_message("first draft", None, None).unwrap();
        ctx.add_assistant_message("a reply").unwrap();
        assert!(ctx.pop_last_user_message().is_none());
        assert_eq!(ctx.messages().len(), 2);

        ctx.clear_messages();
        ctx.add_user_message("first draft", None, None).unwrap();
        let popped = ctx.pop_last_user_message().unwrap();
        assert_eq!(popped.role, "user");
        assert!(ctx.messages().is_empty());
    }

    #[test]
    fn unknown_role_is_rejected() {
        let schema = openai_schema();
        let mut ctx = Context::new(schema, ContextConfig::default()).unwrap();
        let err = ctx.add_message("narrator", "hi", None, None).unwrap_err();
        assert!(matches!(err, Error::Validation(ValidationError::UnknownRole(_))));
    }

    #[test]
    fn build_headers_substitutes_key_placeholder() {
        let schema = openai_schema();
        let mut ctx = Context::new(schema, ContextConfig::default()).unwrap();
        ctx.set_api_key("sk-test-123");
        let headers = ctx.build_headers().unwrap();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer sk-test-123");
    }

    #[test]
    fn build_headers_inserts_key_header_when_no_placeholder_present() {
        let schema = anthropic_schema();
        let mut ctx = Context::new(schema, ContextConfig::default()).unwrap();
        ctx.set_api_key("anthropic-secret");
        let headers = ctx.build_headers().unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "anthropic-secret");
    }

    fn schema_without_streaming_support() -> Arc<SchemaDoc> {
        let json = r#"{
            "provider": { "name": "openai" },
            "api": { "endpoint": "https://api.openai.com/v1/chat/completions", "method": "POST" },
            "authentication": { "type": "header", "key_name": "Authorization", "key_prefix": "Bearer " },
            "headers": { "required": { "Content-Type": "application/json" } },
            "request_template": { "model": "gpt-4o", "messages": [] },
            "message_roles": ["user", "assistant"],
            "message_format": {
                "structure": { "role": "<ROLE>", "content": "<TEXT_CONTENT>" },
                "content_types": { "text": "<TEXT_CONTENT>" }
            },
            "response_format": {
                "success": { "text_path": ["choices", 0, "message", "content"] }
            },
            "features": { "streaming": false }
        }"#;
        Arc::new(SchemaDoc::parse("openai", json).unwrap())
    }

    #[test]
    fn stream_field_is_gated_on_schemas_streaming_feature_not_just_config() {
        let schema = schema_without_streaming_support();
        let mut ctx = Context::new(schema, ContextConfig::default()).unwrap();
        ctx.add_user_message("hi", None, None).unwrap();

        let request = ctx.build_request(true).unwrap();
        assert!(request.get("stream").is_none());
    }

    #[test]
    fn stream_field_is_omitted_when_config_disables_streaming_support_even_if_schema_allows_it() {
        let schema = openai_schema();
        let config = ContextConfig {
            enable_streaming_support: false,
            ..ContextConfig::default()
        };
        let mut ctx = Context::new(schema, config).unwrap();
        ctx.add_user_message("hi", None, None).unwrap();

        let request = ctx.build_request(true).unwrap();
        assert!(request.get("stream").is_none());
    }

    #[test]
    fn extract_stream_delta_concatenates() {
        let schema = openai_schema();
        let ctx = Context::new(schema, ContextConfig::default()).unwrap();
        let frame1 = json!({ "choices": [{ "delta": { "content": "Hel" } }] });
        let frame2 = json!({ "choices": [{ "delta": { "content": "lo" } }] });
        let mut out = String::new();
        out.push_str(&ctx.extract_stream_delta(&frame1).unwrap().unwrap());
        out.push_str(&ctx.extract_stream_delta(&frame2).unwrap().unwrap());
        assert_eq!(out, "Hello");
    }

    fn schema_with_error_codes() -> Arc<SchemaDoc> {
        let json = r#"{
            "provider": { "name": "openai" },
            "api": { "endpoint": "https://api.openai.com/v1/chat/completions", "method": "POST" },
            "authentication": { "type": "header", "key_name": "Authorization", "key_prefix": "Bearer " },
            "headers": { "required": { "Content-Type": "application/json" } },
            "request_template": { "model": "gpt-4o", "messages": [] },
            "message_roles": ["user", "assistant"],
            "message_format": {
                "structure": { "role": "<ROLE>", "content": "<TEXT_CONTENT>" },
                "content_types": { "text": "<TEXT_CONTENT>" }
            },
            "response_format": {
                "success": { "text_path": ["choices", 0, "message", "content"] },
                "error": { "error_path": ["error", "message"], "error_code_path": ["error", "code"] }
            },
            "error_codes": { "400": "invalid_request_error", "429": "rate_limit_error" }
        }"#;
        Arc::new(SchemaDoc::parse("openai", json).unwrap())
    }

    #[test]
    fn extract_error_prefers_message_over_code() {
        let schema = schema_with_error_codes();
        let ctx = Context::new(schema, ContextConfig::default()).unwrap();
        let body = json!({ "error": { "message": "you sent no messages", "code": "invalid_request_error" } });
        assert_eq!(ctx.extract_error(&body), "you sent no messages");
    }

    #[test]
    fn extract_error_falls_back_to_bare_code_when_message_absent() {
        let schema = schema_with_error_codes();
        let ctx = Context::new(schema, ContextConfig::default()).unwrap();
        let body = json!({ "error": { "code": "invalid_request_error" } });
        assert_eq!(ctx.extract_error(&body), "invalid_request_error");
    }

    #[test]
    fn error_code_for_status_looks_up_schemas_error_codes_map() {
        let schema = schema_with_error_codes();
        let ctx = Context::new(schema, ContextConfig::default()).unwrap();
        assert_eq!(ctx.error_code_for_status(429), Some("rate_limit_error"));
        assert_eq!(ctx.error_code_for_status(404), None);
    }
}
