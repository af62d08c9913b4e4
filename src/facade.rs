//! Orchestrates a [`Context`] and an [`HttpSink`] into blocking, async, and
//! streaming sends.
//!
//! A send only ever appends the assistant's reply to the context after a
//! successful extraction — a transport failure, a non-2xx status, or a
//! response that doesn't match the schema's extraction paths all leave the
//! context's message history untouched.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tracing::instrument;

use crate::context::Context;
use crate::error::{Error, SchemaError, TransportError};
use crate::sink::{CancelPredicate, HttpSink, Response};
use crate::stream::{SseDecoder, SseFrame};

/// A never-cancelling predicate, useful when a caller has no cancellation
/// source of its own.
pub fn never_cancel() -> CancelPredicate {
    Arc::new(|| false)
}

/// Orchestrates sends against one [`HttpSink`] implementation.
#[derive(Debug, Clone)]
pub struct ChatClient<S: HttpSink> {
    sink: S,
}

impl<S: HttpSink> ChatClient<S> {
    /// Build a facade around `sink`.
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    /// Add a user turn (optionally replacing the conversation's previous
    /// user turn), build a request from `context`, send it, and append the
    /// assistant's reply on success. Blocks the calling thread.
    ///
    /// If `replace_last_user_turn` is set and the conversation's most recent
    /// message has role `"user"`, that turn is popped before the new one is
    /// appended — useful for "edit and resend" flows. A send failure leaves
    /// `context` exactly as it was before the call plus the user turn this
    /// call itself appended; no assistant turn is ever appended on failure.
    #[instrument(skip(self, context, cancel), fields(model = %context.model()))]
    pub fn send(
        &self,
        context: &mut Context,
        text: impl Into<String>,
        media_type: Option<&str>,
        media_data: Option<&str>,
        replace_last_user_turn: bool,
        cancel: CancelPredicate,
    ) -> Result<String, Error> {
        add_user_turn(context, text, media_type, media_data, replace_last_user_turn)?;
        let (url, headers, body) = prepare_request(context, false)?;
        let response = self.sink.post(&url, &headers, &body, cancel)?;
        handle_response(context, response)
    }

    /// Async counterpart to [`Self::send`].
    #[instrument(skip(self, context, cancel), fields(model = %context.model()))]
    pub async fn send_async(
        &self,
        context: &mut Context,
        text: impl Into<String>,
        media_type: Option<&str>,
        media_data: Option<&str>,
        replace_last_user_turn: bool,
        cancel: CancelPredicate,
    ) -> Result<String, Error> {
        add_user_turn(context, text, media_type, media_data, replace_last_user_turn)?;
        let (url, headers, body) = prepare_request(context, false)?;
        let response = self.sink.post_async(&url, &headers, &body, cancel).await?;
        handle_response(context, response)
    }

    /// Add a user turn, send with `stream: true`, and invoke `on_chunk` with
    /// each incremental text delta as it arrives. `on_chunk` may return
    /// `false` to request early termination of the stream; whatever text has
    /// accumulated by then is still treated as the completed reply.
    /// `on_complete` fires exactly once, with the fully concatenated text,
    /// right before that text is appended to `context` as the assistant's
    /// reply.
    #[instrument(skip(self, context, cancel, on_chunk, on_complete), fields(model = %context.model()))]
    pub async fn send_streaming<F, C>(
        &self,
        context: &mut Context,
        text: impl Into<String>,
        media_type: Option<&str>,
        media_data: Option<&str>,
        replace_last_user_turn: bool,
        cancel: CancelPredicate,
        mut on_chunk: F,
        on_complete: C,
    ) -> Result<String, Error>
    where
        F: FnMut(&str) -> bool + Send,
        C: FnOnce(&str) + Send,
    {
        add_user_turn(context, text, media_type, media_data, replace_last_user_turn)?;
        let (url, headers, body) = prepare_request(context, true)?;
        let mut byte_stream = self
            .sink
            .post_stream(&url, &headers, &body, Arc::clone(&cancel))
            .await?;

        let mut decoder = SseDecoder::new();
        let mut full_text = String::new();

        'outer: while let Some(chunk) = byte_stream.next().await {
            let bytes = chunk?;
            for frame in decoder.feed(&bytes)? {
                match frame {
                    SseFrame::Done => break 'outer,
                    SseFrame::Data(value) => {
                        if let Some(delta) = context.extract_stream_delta(&value)? {
                            full_text.push_str(&delta);
                            if !on_chunk(&delta) {
                                break 'outer;
                            }
                        }
                    }
                }
            }
        }

        on_complete(&full_text);
        context.add_assistant_message(&full_text)?;
        Ok(full_text)
    }
}

/// Append the new user turn, first popping the previous one if asked to
/// replace it.
fn add_user_turn(
    context: &mut Context,
    text: impl Into<String>,
    media_type: Option<&str>,
    media_data: Option<&str>,
    replace_last_user_turn: bool,
) -> Result<(), Error> {
    if replace_last_user_turn {
        context.pop_last_user_message();
    }
    context.add_user_message(text, media_type, media_data)?;
    Ok(())
}

fn prepare_request(
    context: &Context,
    streaming: bool,
) -> Result<(String, std::collections::HashMap<String, String>, Vec<u8>), Error> {
    let request = context.build_request(streaming)?;
    let headers = context.build_headers()?;
    let body = serde_json::to_vec(&request).map_err(|source| SchemaError::MalformedJson {
        provider: context.schema().provider.name.clone(),
        source,
    })?;
    let url = context.schema().api.endpoint.clone();
    Ok((url, headers, body))
}

fn handle_response(context: &mut Context, response: Response) -> Result<String, Error> {
    let parsed: Value = serde_json::from_slice(&response.body).unwrap_or(Value::Null);

    if !response.is_success() {
        // Preference order per §9's open question: the schema's extracted
        // error string, then its declared semantic name for this HTTP status,
        // then the raw body, then a bare status code.
        let message = if parsed.is_null() {
            String::new()
        } else {
            context.extract_error(&parsed)
        };
        let message = if !message.is_empty() {
            message
        } else if let Some(semantic) = context.error_code_for_status(response.status) {
            semantic.to_string()
        } else if !response.body.is_empty() {
            String::from_utf8_lossy(&response.body).to_string()
        } else {
            format!("HTTP {}", response.status)
        };
        return Err(TransportError::Http {
            status: Some(response.status),
            message,
        }
        .into());
    }

    let text = context.extract_text_response(&parsed)?;
    context.add_assistant_message(&text)?;
    Ok(text)
}
