//! Label domain types.
//!
//! Labels cover both true labels (Gmail) and the folders and categories that
//! stand in for them on folder-based providers. The `label_type` value is
//! provider vocabulary and is never compared across providers.

use serde::{Deserialize, Serialize};

/// Display colors for a label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelColor {
    pub background_color: String,
    pub text_color: String,
}

/// A label, folder or category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
    /// Provider-specific origin, e.g. `system`, `user`, `folder`, `category`.
    #[serde(rename = "type")]
    pub label_type: String,
    pub color: Option<LabelColor>,
}

impl Label {
    /// Creates a label without a color.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        label_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            label_type: label_type.into(),
            color: None,
        }
    }
}

/// Payload for creating or renaming a label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelInput {
    pub name: String,
    pub color: Option<LabelColor>,
}

impl LabelInput {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            color: None,
        }
    }
}

/// Labels to add to and remove from a set of messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelChanges {
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

impl LabelChanges {
    /// Returns true when there is nothing to add or remove.
    pub fn is_empty(&self) -> bool {
        self.add_labels.is_empty() && self.remove_labels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_type_serializes_as_type() {
        let label = Label::new("Label_1", "Work", "user");
        let json = serde_json::to_value(&label).unwrap();
        assert_eq!(json["type"], "user");
        assert!(json["color"].is_null());
    }

    #[test]
    fn label_color_serialization() {
        let mut label = Label::new("Label_2", "Travel", "user");
        label.color = Some(LabelColor {
            background_color: "#16a766".to_string(),
            text_color: "#ffffff".to_string(),
        });

        let json = serde_json::to_string(&label).unwrap();
        assert!(json.contains("backgroundColor"));

        let deserialized: Label = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, label);
    }

    #[test]
    fn label_changes_empty() {
        assert!(LabelChanges::default().is_empty());

        let changes = LabelChanges {
            add_labels: vec!["STARRED".to_string()],
            remove_labels: vec![],
        };
        assert!(!changes.is_empty());
    }
}
