//! Backend wire formats.
//!
//! The format is resolved once when the client is built. Everything that
//! differs between backends (endpoint, authentication, request body, where
//! the text sits in a response) lives behind [`WireFormat`].

use serde_json::{json, Value};

use sage_core::config::{LlmConfig, WireFormatSetting};
use sage_core::{Message, Role};

use crate::client::ResponseSchema;

const GEMINI_HOST: &str = "generativelanguage.googleapis.com";

/// How requests are shaped and responses read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `/chat/completions` with `choices[0].delta.content` token deltas.
    OpenAi,
    /// `models/{model}:generateContent` with `candidates[0].content.parts`.
    Gemini,
}

impl WireFormat {
    /// Resolve the configured setting against the backend base URL.
    pub fn resolve(setting: WireFormatSetting, base_url: &str) -> Self {
        match setting {
            WireFormatSetting::OpenAi => WireFormat::OpenAi,
            WireFormatSetting::Gemini => WireFormat::Gemini,
            WireFormatSetting::Auto if base_url.contains(GEMINI_HOST) => WireFormat::Gemini,
            WireFormatSetting::Auto => WireFormat::OpenAi,
        }
    }

    /// Build the HTTP request, without its body.
    pub fn request(
        &self,
        http: &reqwest::Client,
        config: &LlmConfig,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let base = config.base_url.trim_end_matches('/');
        match self {
            WireFormat::OpenAi => {
                let builder = http.post(format!("{}/chat/completions", base));
                match config.api_key.as_deref() {
                    Some(key) => builder.bearer_auth(key),
                    None => builder,
                }
            }
            WireFormat::Gemini => {
                let method = if stream {
                    "streamGenerateContent"
                } else {
                    "generateContent"
                };
                let mut query: Vec<(&str, &str)> = Vec::new();
                if stream {
                    query.push(("alt", "sse"));
                }
                if let Some(key) = config.api_key.as_deref() {
                    query.push(("key", key));
                }
                http.post(format!("{}/models/{}:{}", base, config.model, method))
                    .query(&query)
            }
        }
    }

    /// Build the JSON request body.
    pub fn body(
        &self,
        config: &LlmConfig,
        messages: &[Message],
        schema: Option<&ResponseSchema>,
        stream: bool,
    ) -> Value {
        match self {
            WireFormat::OpenAi => openai_body(config, messages, schema, stream),
            WireFormat::Gemini => gemini_body(config, messages, schema),
        }
    }

    /// Text of a complete (non-streaming) response.
    pub fn extract_full(&self, body: &Value) -> Option<String> {
        match self {
            WireFormat::OpenAi => {
                let choice = body.get("choices")?.get(0)?;
                choice
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .or_else(|| choice.get("text"))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            }
            WireFormat::Gemini => gemini_text(body),
        }
    }

    /// Text fragment carried by one streamed event.
    ///
    /// Gemini events hold a whole candidate object, so the text is read back
    /// out of it rather than from a delta field.
    pub fn extract_fragment(&self, event: &Value) -> Option<String> {
        match self {
            WireFormat::OpenAi => event
                .get("choices")?
                .get(0)?
                .get("delta")?
                .get("content")?
                .as_str()
                .map(str::to_string),
            WireFormat::Gemini => gemini_text(event),
        }
    }
}

fn openai_body(
    config: &LlmConfig,
    messages: &[Message],
    schema: Option<&ResponseSchema>,
    stream: bool,
) -> Value {
    let mut body = json!({
        "messages": messages,
        "model": config.model,
        "stop": config.stop,
        "max_tokens": config.max_tokens,
        "temperature": config.temperature,
        "stream": stream,
    });
    if let Some(schema) = schema {
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {
                "name": schema.name,
                "strict": true,
                "schema": schema.schema,
            }
        });
    }
    body
}

fn gemini_body(config: &LlmConfig, messages: &[Message], schema: Option<&ResponseSchema>) -> Value {
    let mut system = Vec::new();
    let mut contents = Vec::new();
    for message in messages {
        match message.role {
            Role::System => system.push(message.content.as_str()),
            Role::User => contents.push(gemini_content("user", &message.content)),
            Role::Assistant => contents.push(gemini_content("model", &message.content)),
        }
    }

    // Gemini rejects a request without contents; a system-only prompt is
    // sent as the user turn instead.
    let instruction = system.join("\n\n");
    let mut body = if contents.is_empty() {
        json!({ "contents": [gemini_content("user", &instruction)] })
    } else if instruction.is_empty() {
        json!({ "contents": contents })
    } else {
        json!({
            "systemInstruction": { "parts": [{ "text": instruction }] },
            "contents": contents,
        })
    };

    let mut generation = json!({
        "temperature": config.temperature,
        "maxOutputTokens": config.max_tokens,
    });
    if !config.stop.is_empty() {
        generation["stopSequences"] = json!(config.stop.iter().take(5).collect::<Vec<_>>());
    }
    if let Some(schema) = schema {
        generation["responseMimeType"] = json!("application/json");
        generation["responseSchema"] = schema.schema.clone();
    }
    body["generationConfig"] = generation;
    body
}

fn gemini_content(role: &str, text: &str) -> Value {
    json!({ "role": role, "parts": [{ "text": text }] })
}

fn gemini_text(body: &Value) -> Option<String> {
    let parts = body
        .get("candidates")?
        .get(0)?
        .get("content")?
        .get("parts")?
        .as_array()?;
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    Some(text)
}
