//! Camera parameter store
//!
//! An ordered key/value table holding the textual camera configuration.
//! The whole table travels to and from the framework as a single
//! `key=value;key=value` blob.

/// Renders a float so it reads back as a float (`30` becomes `30.0`).
fn format_float(value: f32) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamStore {
    entries: Vec<(String, String)>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Raw text of a value, exactly as it was stored.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    fn set(&mut self, key: &str, value: String) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn set_int(&mut self, key: &str, value: i32) {
        self.set(key, value.to_string());
    }

    pub fn set_float(&mut self, key: &str, value: f32) {
        self.set(key, format_float(value));
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.set(key, value.to_string());
    }

    /// Integer read. Decimal text is truncated toward zero.
    pub fn get_int(&self, key: &str) -> Option<i32> {
        let text = self.get(key)?.trim();
        if let Ok(v) = text.parse::<i32>() {
            return Some(v);
        }
        text.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= f64::from(i32::MIN) && *v <= f64::from(i32::MAX))
            .map(|v| v as i32)
    }

    pub fn get_float(&self, key: &str) -> Option<f32> {
        self.get(key)?
            .trim()
            .parse::<f32>()
            .ok()
            .filter(|v| v.is_finite())
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.get(key).map(str::to_string)
    }

    /// Serializes the store as `key=value;key=value`.
    pub fn flatten(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Merges a `key=value;key=value` blob into the store. Pairs without a
    /// `=` or with an empty key are skipped.
    pub fn unflatten(&mut self, text: &str) {
        for pair in text.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            if key.is_empty() {
                continue;
            }
            self.set(key, value.to_string());
        }
    }

    pub fn from_flattened(text: &str) -> Self {
        let mut store = Self::new();
        store.unflatten(text);
        store
    }
}
