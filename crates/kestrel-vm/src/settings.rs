//! Layered key/value settings.
//!
//! Keys are addressed by `(section, key)`. [`LayeredSettings`] stacks a global layer, an optional
//! per-title layer and an optional per-input-profile layer; lookups consult the most specific layer
//! first.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl From<bool> for SettingValue {
    fn from(v: bool) -> Self {
        SettingValue::Bool(v)
    }
}

impl From<i64> for SettingValue {
    fn from(v: i64) -> Self {
        SettingValue::Int(v)
    }
}

impl From<f64> for SettingValue {
    fn from(v: f64) -> Self {
        SettingValue::Float(v)
    }
}

impl From<&str> for SettingValue {
    fn from(v: &str) -> Self {
        SettingValue::String(v.to_string())
    }
}

impl From<String> for SettingValue {
    fn from(v: String) -> Self {
        SettingValue::String(v)
    }
}

/// `section -> key -> value`, matching the JSON form `{"Audio": {"Volume": 80}}`.
pub type SettingsLayer = BTreeMap<String, BTreeMap<String, SettingValue>>;

/// Read/write access to emulator settings.
///
/// The typed getters coerce where the conversion is unambiguous (`1`/`0` for booleans, integers for
/// floats, `"true"`/`"false"` strings) and fall back to `default` otherwise.
pub trait SettingsSource: Send {
    fn get(&self, section: &str, key: &str) -> Option<SettingValue>;
    fn set(&mut self, section: &str, key: &str, value: SettingValue);
    /// Keys present in `section` across all layers, sorted and deduplicated.
    fn list_keys(&self, section: &str) -> Vec<String>;

    fn contains(&self, section: &str, key: &str) -> bool {
        self.get(section, key).is_some()
    }

    fn get_bool_or(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get(section, key) {
            Some(SettingValue::Bool(v)) => v,
            Some(SettingValue::Int(v)) => v != 0,
            Some(SettingValue::String(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => default,
            },
            _ => default,
        }
    }

    fn get_int_or(&self, section: &str, key: &str, default: i64) -> i64 {
        match self.get(section, key) {
            Some(SettingValue::Int(v)) => v,
            Some(SettingValue::Bool(v)) => v as i64,
            Some(SettingValue::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    fn get_float_or(&self, section: &str, key: &str, default: f64) -> f64 {
        match self.get(section, key) {
            Some(SettingValue::Float(v)) => v,
            Some(SettingValue::Int(v)) => v as f64,
            Some(SettingValue::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    fn get_string_or(&self, section: &str, key: &str, default: &str) -> String {
        match self.get(section, key) {
            Some(SettingValue::String(s)) => s,
            Some(SettingValue::Bool(v)) => v.to_string(),
            Some(SettingValue::Int(v)) => v.to_string(),
            Some(SettingValue::Float(v)) => v.to_string(),
            None => default.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LayerKind {
    Global,
    Title,
    InputProfile,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayeredSettings {
    global: SettingsLayer,
    title: Option<SettingsLayer>,
    input_profile: Option<SettingsLayer>,
}

impl LayeredSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layer(&self, kind: LayerKind) -> Option<&SettingsLayer> {
        match kind {
            LayerKind::Global => Some(&self.global),
            LayerKind::Title => self.title.as_ref(),
            LayerKind::InputProfile => self.input_profile.as_ref(),
        }
    }

    pub fn set_layer(&mut self, kind: LayerKind, layer: SettingsLayer) {
        match kind {
            LayerKind::Global => self.global = layer,
            LayerKind::Title => self.title = Some(layer),
            LayerKind::InputProfile => self.input_profile = Some(layer),
        }
    }

    /// Removes a per-title or per-profile layer. The global layer is emptied instead.
    pub fn clear_layer(&mut self, kind: LayerKind) {
        match kind {
            LayerKind::Global => self.global.clear(),
            LayerKind::Title => self.title = None,
            LayerKind::InputProfile => self.input_profile = None,
        }
    }

    /// Replaces `kind` with the layer encoded in `json`.
    pub fn load_json(&mut self, kind: LayerKind, json: &str) -> serde_json::Result<()> {
        let layer: SettingsLayer = serde_json::from_str(json)?;
        self.set_layer(kind, layer);
        Ok(())
    }

    pub fn to_json(&self, kind: LayerKind) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.layer(kind).cloned().unwrap_or_default())
    }

    /// Writes into a specific layer, creating it if needed.
    pub fn set_in(&mut self, kind: LayerKind, section: &str, key: &str, value: SettingValue) {
        let layer = match kind {
            LayerKind::Global => &mut self.global,
            LayerKind::Title => self.title.get_or_insert_with(Default::default),
            LayerKind::InputProfile => self.input_profile.get_or_insert_with(Default::default),
        };
        layer
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    fn layers(&self) -> impl Iterator<Item = &SettingsLayer> {
        [self.input_profile.as_ref(), self.title.as_ref(), Some(&self.global)]
            .into_iter()
            .flatten()
    }
}

impl SettingsSource for LayeredSettings {
    fn get(&self, section: &str, key: &str) -> Option<SettingValue> {
        self.layers()
            .find_map(|layer| layer.get(section)?.get(key))
            .cloned()
    }

    /// Writes to the global layer.
    fn set(&mut self, section: &str, key: &str, value: SettingValue) {
        self.set_in(LayerKind::Global, section, key, value);
    }

    fn list_keys(&self, section: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .layers()
            .filter_map(|layer| layer.get(section))
            .flat_map(|entries| entries.keys().cloned())
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }
}
