//! Prometheus text exposition decoding for `x_metrics_decode`.

use std::collections::BTreeMap;

use kassert_core::{Args, FnError, Value};
use serde_json::{json, Value as Json};

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl Sample {
    pub fn to_json(&self) -> Json {
        json!({ "name": self.name, "labels": self.labels, "value": self.value })
    }
}

pub(crate) async fn metrics_decode(args: Vec<Value>) -> Result<Value, FnError> {
    let text = Args::new(&args).string(0)?;
    let samples = decode(&text).map_err(|m| FnError::eval("metrics_decode", m))?;
    Ok(Value::Json(Json::Array(samples.iter().map(Sample::to_json).collect())))
}

/// Parse every sample line; `#` comments (HELP/TYPE) and blank lines are skipped.
pub fn decode(text: &str) -> Result<Vec<Sample>, String> {
    let mut out = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        out.push(parse_line(line).map_err(|m| format!("line {}: {m}", n + 1))?);
    }
    Ok(out)
}

fn parse_line(line: &str) -> Result<Sample, String> {
    let name_end = line.find(|c: char| c == '{' || c.is_whitespace()).unwrap_or(line.len());
    let name = &line[..name_end];
    if name.is_empty() {
        return Err("missing metric name".into());
    }
    let mut rest = &line[name_end..];
    let mut labels = BTreeMap::new();
    if let Some(body) = rest.strip_prefix('{') {
        let (parsed, after) = parse_labels(body)?;
        labels = parsed;
        rest = after;
    }
    let mut fields = rest.split_whitespace();
    let raw = fields.next().ok_or("missing value")?;
    let value = parse_value(raw).ok_or_else(|| format!("invalid value {raw:?}"))?;
    Ok(Sample { name: name.to_string(), labels, value })
}

/// Labels up to the closing brace; returns them and the remainder.
fn parse_labels(body: &str) -> Result<(BTreeMap<String, String>, &str), String> {
    let mut labels = BTreeMap::new();
    let mut chars = body.char_indices().peekable();
    loop {
        while matches!(chars.peek(), Some((_, c)) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        match chars.peek() {
            Some((i, '}')) => {
                let i = *i;
                return Ok((labels, &body[i + 1..]));
            }
            None => return Err("unterminated label set".into()),
            _ => {}
        }
        let mut key = String::new();
        while let Some((_, c)) = chars.peek() {
            if *c == '=' || c.is_whitespace() {
                break;
            }
            key.push(*c);
            chars.next();
        }
        while matches!(chars.peek(), Some((_, c)) if c.is_whitespace()) {
            chars.next();
        }
        if !matches!(chars.next(), Some((_, '='))) || !matches!(chars.next(), Some((_, '"'))) {
            return Err(format!("malformed label {key:?}"));
        }
        let mut value = String::new();
        loop {
            match chars.next() {
                Some((_, '"')) => break,
                Some((_, '\\')) => match chars.next() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, c)) => value.push(c),
                    None => return Err("unterminated escape".into()),
                },
                Some((_, c)) => value.push(c),
                None => return Err(format!("unterminated value for label {key:?}")),
            }
        }
        labels.insert(key, value);
    }
}

fn parse_value(raw: &str) -> Option<f64> {
    match raw {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        other => other.parse().ok(),
    }
}
