//! Response schemas for structured chat.
//!
//! A schema is an ordered list of `(key, description)` pairs. The description
//! is shown to the model; the keys define the exact shape of the reply.

use crate::{GatewayError, GatewayResult};
use serde_json::{Map, Value};

/// Reply of a structured chat call: a JSON object with exactly the schema keys.
pub type StructuredReply = Map<String, Value>;

/// Ordered key → description mapping a structured reply must satisfy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseSchema {
    fields: Vec<(String, String)>,
}

impl ResponseSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field. Re-adding a key replaces its description in place.
    pub fn field(mut self, key: impl Into<String>, description: impl Into<String>) -> Self {
        let key = key.into();
        let description = description.into();
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = description,
            None => self.fields.push((key, description)),
        }
        self
    }

    /// Build a schema from a JSON object of `key: description`.
    ///
    /// Non-string descriptions are rendered as compact JSON.
    pub fn from_object(object: &Map<String, Value>) -> Self {
        object.iter().fold(Self::new(), |schema, (key, value)| {
            let description = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            schema.field(key.clone(), description)
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Instruction appended to the system prompt describing the reply format.
    pub fn instruction(&self) -> String {
        let mut body = String::from("{\n");
        for (i, (key, description)) in self.fields.iter().enumerate() {
            let sep = if i + 1 == self.fields.len() { "" } else { "," };
            body.push_str(&format!(
                "    {}: {}{}\n",
                Value::String(key.clone()),
                Value::String(description.clone()),
                sep
            ));
        }
        body.push('}');
        format!(
            "Reply EXACTLY with the following JSON format.\n{body}\n\
             DO NOT MISS ANY FIELDS AND MAKE SURE THE JSON FORMAT IS CORRECT!"
        )
    }

    /// Follow-up user message sent once after a malformed reply.
    pub fn repair_prompt(&self, reason: &str) -> String {
        let keys: Vec<&str> = self.keys().collect();
        format!(
            "Your previous reply could not be used ({reason}). Reply again with ONLY a valid JSON \
             object whose keys are exactly: {}. No prose, no code fences.",
            keys.join(", ")
        )
    }

    /// Parse raw reply text into a reply with exactly the schema keys.
    ///
    /// The whole text is tried first, then the first balanced JSON object
    /// embedded in it. Extra keys are dropped; missing keys are an error.
    pub fn parse(&self, raw: &str) -> GatewayResult<StructuredReply> {
        let object = parse_object(raw).ok_or_else(|| {
            GatewayError::MalformedResponse("reply is not a JSON object".to_string())
        })?;

        let missing: Vec<&str> = self.keys().filter(|k| !object.contains_key(*k)).collect();
        if !missing.is_empty() {
            return Err(GatewayError::MalformedResponse(format!(
                "missing keys: {}",
                missing.join(", ")
            )));
        }

        let mut reply = Map::new();
        for key in self.keys() {
            if let Some(value) = object.get(key) {
                reply.insert(key.to_string(), value.clone());
            }
        }
        Ok(reply)
    }
}

/// Read a field as text: strings verbatim, anything else as compact JSON.
pub fn text_field(reply: &StructuredReply, key: &str) -> String {
    match reply.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn parse_object(raw: &str) -> Option<Map<String, Value>> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw.trim()) {
        return Some(map);
    }
    let extracted = extract_first_json_object(raw)?;
    match serde_json::from_str::<Value>(extracted) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// First balanced `{...}` in `raw`, respecting JSON string literals.
fn extract_first_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in raw[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..start + idx + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
