//! Dialect translation: Anthropic requests into OpenAI form, and OpenAI
//! responses (buffered and SSE-streaming) into Anthropic form.

use axum::body::Bytes;
use futures::{Stream, StreamExt, stream};
use serde_json::{Map, Value, json};
use std::io;

/// Converts an Anthropic Messages request to an OpenAI Chat Completions
/// request. Known fields map; unknown top-level fields pass through verbatim.
pub fn anthropic_request_to_openai(body: &Value) -> Value {
    let Some(source) = body.as_object() else {
        return body.clone();
    };

    let mut out = Map::new();
    for (key, value) in source {
        match key.as_str() {
            "model" | "temperature" | "top_p" | "stream" => {
                out.insert(key.clone(), value.clone());
            }
            "max_tokens" => {
                out.insert("max_completion_tokens".to_string(), value.clone());
            }
            "stop_sequences" => {
                out.insert("stop".to_string(), value.clone());
            }
            "system" | "messages" => {}
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    let mut messages = Vec::new();
    if let Some(system) = source.get("system")
        && let Some(text) = system_text(system)
    {
        messages.push(json!({"role": "system", "content": text}));
    }
    if let Some(items) = source.get("messages").and_then(|m| m.as_array()) {
        for message in items {
            messages.push(convert_message(message));
        }
    }
    out.insert("messages".to_string(), Value::Array(messages));

    Value::Object(out)
}

/// Anthropic's `system` is either a plain string or an array of content
/// blocks whose text fields concatenate.
fn system_text(system: &Value) -> Option<String> {
    match system {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
                .collect();
            if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            }
        }
        _ => None,
    }
}

fn convert_message(message: &Value) -> Value {
    let Some(blocks) = message.get("content").and_then(|c| c.as_array()) else {
        // string content passes through unchanged
        return message.clone();
    };

    let converted: Vec<Value> = blocks.iter().map(convert_block).collect();

    let mut out = message.as_object().cloned().unwrap_or_default();
    // a lone text block flattens to a plain string
    if converted.len() == 1
        && converted[0].get("type").and_then(|t| t.as_str()) == Some("text")
        && let Some(text) = converted[0].get("text")
    {
        out.insert("content".to_string(), text.clone());
    } else {
        out.insert("content".to_string(), Value::Array(converted));
    }
    Value::Object(out)
}

fn convert_block(block: &Value) -> Value {
    match block.get("type").and_then(|t| t.as_str()) {
        Some("text") => {
            json!({"type": "text", "text": block.get("text").cloned().unwrap_or(Value::Null)})
        }
        Some("image")
            if block.pointer("/source/type").and_then(|t| t.as_str()) == Some("base64") =>
        {
            let media_type = block
                .pointer("/source/media_type")
                .and_then(|m| m.as_str())
                .unwrap_or("application/octet-stream");
            let data = block
                .pointer("/source/data")
                .and_then(|d| d.as_str())
                .unwrap_or_default();
            json!({
                "type": "image_url",
                "image_url": {"url": format!("data:{};base64,{}", media_type, data)}
            })
        }
        _ => block.clone(),
    }
}

fn map_finish_reason(finish_reason: &str) -> &'static str {
    match finish_reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        _ => "end_turn",
    }
}

fn anthropic_message_id(id: Option<&str>) -> String {
    match id {
        Some(id) if id.starts_with("msg_") => id.to_string(),
        Some(id) => format!("msg_{}", id),
        None => format!("msg_{}", uuid::Uuid::new_v4().simple()),
    }
}

/// Converts a buffered OpenAI Chat Completions response to an Anthropic
/// Messages response. `original_model` is the client-declared model name,
/// not the upstream target.
pub fn openai_response_to_anthropic(body: &Value, original_model: &str) -> Value {
    let mut out = Map::new();
    out.insert(
        "id".to_string(),
        Value::String(anthropic_message_id(body.get("id").and_then(|i| i.as_str()))),
    );
    out.insert("type".to_string(), Value::String("message".to_string()));
    out.insert("role".to_string(), Value::String("assistant".to_string()));
    out.insert(
        "model".to_string(),
        Value::String(original_model.to_string()),
    );

    let choice = body.pointer("/choices/0");
    let content = match choice.and_then(|c| c.pointer("/message/content")) {
        Some(Value::String(text)) => vec![json!({"type": "text", "text": text})],
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
            .map(|block| {
                json!({"type": "text", "text": block.get("text").cloned().unwrap_or(Value::Null)})
            })
            .collect(),
        _ => Vec::new(),
    };
    out.insert("content".to_string(), Value::Array(content));

    let stop_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(|f| f.as_str())
        .map(map_finish_reason)
        .unwrap_or("end_turn");
    out.insert(
        "stop_reason".to_string(),
        Value::String(stop_reason.to_string()),
    );
    out.insert("stop_sequence".to_string(), Value::Null);

    let usage = body.get("usage");
    out.insert(
        "usage".to_string(),
        json!({
            "input_tokens": usage.and_then(|u| u.get("prompt_tokens")).cloned().unwrap_or(json!(0)),
            "output_tokens": usage.and_then(|u| u.get("completion_tokens")).cloned().unwrap_or(json!(0)),
        }),
    );

    Value::Object(out)
}

/// Per-stream translation state; owned by one pipeline invocation.
struct StreamState {
    original_model: String,
    message_id: String,
    message_start_emitted: bool,
    content_block_started: bool,
    input_tokens: u64,
    output_tokens: u64,
    stop_reason: Option<&'static str>,
}

impl StreamState {
    fn new(original_model: String) -> Self {
        Self {
            original_model,
            message_id: String::new(),
            message_start_emitted: false,
            content_block_started: false,
            input_tokens: 0,
            output_tokens: 0,
            stop_reason: None,
        }
    }

    /// Translates one OpenAI `data:` payload into zero or more Anthropic
    /// events. Unparseable payloads log and skip without aborting the stream.
    fn on_payload(&mut self, payload: &str) -> String {
        let chunk: Value = match serde_json::from_str(payload) {
            Ok(chunk) => chunk,
            Err(err) => {
                tracing::warn!("skipping malformed stream chunk: {}", err);
                return String::new();
            }
        };

        let mut events = String::new();

        if let Some(usage) = chunk.get("usage") {
            if let Some(prompt) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
                self.input_tokens = prompt;
            }
            if let Some(completion) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
                self.output_tokens = completion;
            }
        }

        if !self.message_start_emitted {
            self.message_id =
                anthropic_message_id(chunk.get("id").and_then(|i| i.as_str()));
            events.push_str(&sse_event(
                "message_start",
                &json!({
                    "type": "message_start",
                    "message": {
                        "id": self.message_id,
                        "type": "message",
                        "role": "assistant",
                        "content": [],
                        "model": self.original_model,
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": {"input_tokens": self.input_tokens, "output_tokens": 0}
                    }
                }),
            ));
            self.message_start_emitted = true;
        }

        if let Some(content) = chunk
            .pointer("/choices/0/delta/content")
            .and_then(|c| c.as_str())
            && !content.is_empty()
        {
            if !self.content_block_started {
                events.push_str(&sse_event(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": 0,
                        "content_block": {"type": "text", "text": ""}
                    }),
                ));
                self.content_block_started = true;
            }
            events.push_str(&sse_event(
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "text_delta", "text": content}
                }),
            ));
            self.output_tokens += 1;
        }

        if let Some(finish_reason) = chunk
            .pointer("/choices/0/finish_reason")
            .and_then(|f| f.as_str())
        {
            self.stop_reason = Some(map_finish_reason(finish_reason));
        }

        events
    }

    /// Terminal events emitted on `[DONE]`.
    fn on_done(&mut self) -> String {
        let mut events = String::new();
        if self.content_block_started {
            events.push_str(&sse_event(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": 0}),
            ));
        }
        events.push_str(&sse_event(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": self.stop_reason.unwrap_or("end_turn"),
                    "stop_sequence": null
                },
                "usage": {"output_tokens": self.output_tokens}
            }),
        ));
        events.push_str(&sse_event("message_stop", &json!({"type": "message_stop"})));
        events
    }
}

fn sse_event(name: &str, data: &Value) -> String {
    format!("event: {}\ndata: {}\n\n", name, data)
}

/// Reframes an OpenAI SSE stream as an Anthropic SSE stream, consuming
/// chunks incrementally as they arrive.
pub fn openai_stream_to_anthropic<S, E>(
    upstream: S,
    original_model: String,
) -> impl Stream<Item = Result<Bytes, io::Error>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Unpin + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    struct Translation<S> {
        upstream: S,
        buffer: Vec<u8>,
        state: StreamState,
        done: bool,
    }

    let initial = Translation {
        upstream,
        buffer: Vec::new(),
        state: StreamState::new(original_model),
        done: false,
    };

    stream::unfold(initial, |mut t| async move {
        loop {
            if t.done {
                return None;
            }

            if let Some(pos) = t.buffer.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = t.buffer.drain(0..=pos).collect();
                let line_str = String::from_utf8_lossy(&line_bytes);
                let line = line_str.trim();

                if let Some(payload) = line.strip_prefix("data:").map(str::trim_start) {
                    if payload == "[DONE]" {
                        t.done = true;
                        let events = t.state.on_done();
                        return Some((Ok(Bytes::from(events)), t));
                    }
                    let events = t.state.on_payload(payload);
                    if !events.is_empty() {
                        return Some((Ok(Bytes::from(events)), t));
                    }
                }
                // event:/comment/blank lines carry no payload
                continue;
            }

            match t.upstream.next().await {
                Some(Ok(bytes)) => t.buffer.extend_from_slice(&bytes),
                Some(Err(err)) => {
                    tracing::warn!("upstream stream error, terminating translation: {}", err);
                    return Some((Err(io::Error::other(err)), t));
                }
                None => return None,
            }
        }
    })
}
