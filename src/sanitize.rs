use serde_json::Value;

/// Truncate to at most `max` characters, on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Render a JSON value as display text: strings stay bare, everything else
/// keeps its JSON form.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Bound a list of model-provided values: each rendered as text and truncated
/// to `max_len` chars, keeping at most `max_items` entries.
pub fn bounded_string_list(values: &[Value], max_len: usize, max_items: usize) -> Vec<String> {
    values
        .iter()
        .take(max_items)
        .map(|v| truncate_chars(&value_to_text(v), max_len))
        .collect()
}

/// Coerce a model-provided error percentage into [0, 100], defaulting to 50
/// when absent or unparsable.
pub fn coerce_percentage(value: Option<&Value>) -> u8 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) => (v as i64).clamp(0, 100) as u8,
        None => 50,
    }
}

/// Coerce a model-provided value to an integer, if possible.
pub fn coerce_i64(value: Option<&Value>) -> Option<i64> {
    match value {
        Some(Value::Number(n)) => n.as_f64().map(|v| v as i64),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok().map(|v| v as i64),
        _ => None,
    }
}

/// Coerce a model-provided value to a float, if possible.
pub fn coerce_f64(value: Option<&Value>) -> Option<f64> {
    match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Round to two decimal places, as exposed by aggregate views.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
