//! Embedding socket protocol - newline-delimited JSON frames
//!
//! Requests are written as one JSON object per line. The server may answer
//! with any number of `{"status":"processing"}` heartbeats before the frame
//! that completes the request.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::error::EmbeddingError;

/// A request sent to the embedding server
#[derive(Debug, Clone)]
pub enum Request<'a> {
    Embed { text: &'a str },
    BatchEmbed { texts: Vec<&'a str> },
    Health,
    Bulk(BulkRequest),
}

impl Request<'_> {
    /// Encode as a single line, newline included
    pub fn encode(&self) -> String {
        let value = match self {
            Self::Embed { text } => json!({"type": "embed", "text": text}),
            Self::BatchEmbed { texts } => json!({"type": "batch_embed", "texts": texts}),
            Self::Health => json!({"type": "health"}),
            Self::Bulk(bulk) => bulk.to_value(),
        };
        let mut line = value.to_string();
        line.push('\n');
        line
    }

    /// Short name used in logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Embed { .. } => "embed",
            Self::BatchEmbed { .. } => "batch_embed",
            Self::Health => "health",
            Self::Bulk(bulk) => bulk.target.flag(),
        }
    }
}

/// Which table a server-side bulk pass should fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkTarget {
    Files,
    Definitions,
}

impl BulkTarget {
    fn flag(&self) -> &'static str {
        match self {
            Self::Files => "process_codebase",
            Self::Definitions => "process_code_definitions",
        }
    }
}

/// Server-side "embed everything missing" request.
///
/// The server reads rows without embeddings from the project's store,
/// embeds them, and writes them back itself.
#[derive(Debug, Clone)]
pub struct BulkRequest {
    pub target: BulkTarget,
    pub batch_size: usize,
    /// 0 means no limit
    pub limit: usize,
    pub project_path: String,
    pub schema: String,
    pub db_path: String,
}

impl BulkRequest {
    fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert(self.target.flag().to_string(), Value::Bool(true));
        map.insert("batch_size".into(), json!(self.batch_size));
        map.insert("limit".into(), json!(self.limit));
        map.insert("project_path".into(), json!(self.project_path));
        map.insert("schema".into(), json!(self.schema));
        map.insert("db_path".into(), json!(self.db_path));
        Value::Object(map)
    }
}

/// Result of a server-side bulk pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOutcome {
    pub processed: usize,
    pub errors: usize,
    pub remaining: usize,
}

/// A frame received from the embedding server
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Interim keep-alive; the real payload is still coming
    Heartbeat,
    Embedding(Vec<f32>),
    /// Individual entries may be null
    Batch(Vec<Option<Vec<f32>>>),
    Bulk(BulkOutcome),
    Health(Value),
    Error(String),
}

impl ServerFrame {
    /// Parse one line from the socket.
    ///
    /// Anything that is valid JSON but not one of the known shapes is
    /// rejected as an invalid response.
    pub fn parse(line: &str) -> Result<Self, EmbeddingError> {
        let value: Value = serde_json::from_str(line.trim())?;
        let obj = value
            .as_object()
            .ok_or_else(|| EmbeddingError::invalid("frame is not a JSON object"))?;

        if let Some(err) = obj.get("error") {
            let message = match err {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(Self::Error(message));
        }

        if let Some(embedding) = obj.get("embedding") {
            return parse_vector(embedding)
                .map(Self::Embedding)
                .ok_or_else(|| EmbeddingError::invalid("embedding is not a numeric array"));
        }

        if let Some(embeddings) = obj.get("embeddings") {
            let items = embeddings
                .as_array()
                .ok_or_else(|| EmbeddingError::invalid("embeddings is not an array"))?;
            return Ok(Self::Batch(items.iter().map(parse_vector).collect()));
        }

        if obj.get("status").and_then(Value::as_str) == Some("processing") {
            return Ok(Self::Heartbeat);
        }

        if let Some(processed) = obj.get("processed").and_then(Value::as_u64) {
            let count = |key: &str| obj.get(key).and_then(Value::as_u64).unwrap_or(0) as usize;
            return Ok(Self::Bulk(BulkOutcome {
                processed: processed as usize,
                errors: count("errors"),
                remaining: count("remaining"),
            }));
        }

        if obj.contains_key("status") || obj.contains_key("ready") {
            return Ok(Self::Health(value));
        }

        Err(EmbeddingError::invalid(format!(
            "unrecognized frame with keys [{}]",
            obj.keys().cloned().collect::<Vec<_>>().join(", ")
        )))
    }
}

fn parse_vector(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

/// Keep an embedding only if its dimension lies in `[min, max]`.
pub fn validate_dimension(embedding: Vec<f32>, min: usize, max: usize) -> Option<Vec<f32>> {
    if (min..=max).contains(&embedding.len()) {
        Some(embedding)
    } else {
        tracing::debug!(
            dimension = embedding.len(),
            min,
            max,
            "Discarding embedding with out-of-range dimension"
        );
        None
    }
}

/// Deterministic truncation to a character budget (never splits a char).
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
