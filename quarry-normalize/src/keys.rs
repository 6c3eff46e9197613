//! Field name to payload key translation.

use quarry_core::{inflector, TypeSchema};
use std::collections::HashSet;

/// How default payload keys are derived from field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyStyle {
    /// Field names are used as-is (`firstName`).
    #[default]
    AsIs,
    /// Field names are dasherized (`first-name`).
    Dasherized,
}

impl KeyStyle {
    pub fn apply(&self, name: &str) -> String {
        match self {
            KeyStyle::AsIs => name.to_string(),
            KeyStyle::Dasherized => inflector::dasherize(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Attribute,
    Relationship,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldKey {
    pub name: String,
    pub kind: FieldKind,
    pub key: String,
    /// Declared in the schema rather than computed.
    pub explicit: bool,
    /// The computed key is claimed by another field's explicit key.
    pub shadowed: bool,
}

/// Bidirectional key table for one resource type.
///
/// Explicit keys always win. A field whose computed key equals another
/// field's explicit key is shadowed: it is neither read from nor written to
/// that key, so the two fields never receive each other's values.
#[derive(Debug, Clone, Default)]
pub struct KeyMap {
    fields: Vec<FieldKey>,
}

impl KeyMap {
    pub fn for_type(schema: &TypeSchema, style: KeyStyle) -> Self {
        let declared = schema
            .attributes
            .iter()
            .map(|a| (a.name.as_str(), a.key.as_deref(), FieldKind::Attribute))
            .chain(
                schema
                    .relationships
                    .iter()
                    .map(|r| (r.name.as_str(), r.key.as_deref(), FieldKind::Relationship)),
            );

        let mut fields: Vec<FieldKey> = declared
            .map(|(name, key, kind)| FieldKey {
                name: name.to_string(),
                kind,
                key: key.map(str::to_string).unwrap_or_else(|| style.apply(name)),
                explicit: key.is_some(),
                shadowed: false,
            })
            .collect();

        let claimed: HashSet<String> = fields
            .iter()
            .filter(|f| f.explicit)
            .map(|f| f.key.clone())
            .collect();
        for field in fields.iter_mut().filter(|f| !f.explicit) {
            field.shadowed = claimed.contains(&field.key);
        }
        Self { fields }
    }

    /// The field a payload key feeds, if any.
    pub fn field_for_key(&self, key: &str) -> Option<&FieldKey> {
        self.fields
            .iter()
            .find(|f| f.explicit && f.key == key)
            .or_else(|| self.fields.iter().find(|f| !f.shadowed && f.key == key))
    }

    pub fn attribute_for_key(&self, key: &str) -> Option<&str> {
        self.field_for_key(key)
            .filter(|f| f.kind == FieldKind::Attribute)
            .map(|f| f.name.as_str())
    }

    pub fn relationship_for_key(&self, key: &str) -> Option<&str> {
        self.field_for_key(key)
            .filter(|f| f.kind == FieldKind::Relationship)
            .map(|f| f.name.as_str())
    }

    fn key_for(&self, name: &str, kind: FieldKind) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.kind == kind && f.name == name && !f.shadowed)
            .map(|f| f.key.as_str())
    }

    /// Payload key of an attribute; `None` when unknown or shadowed.
    pub fn key_for_attribute(&self, name: &str) -> Option<&str> {
        self.key_for(name, FieldKind::Attribute)
    }

    pub fn key_for_relationship(&self, name: &str) -> Option<&str> {
        self.key_for(name, FieldKind::Relationship)
    }

    pub fn fields(&self) -> &[FieldKey] {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::RelationshipSchema;

    fn villain() -> TypeSchema {
        TypeSchema::new("super-villain")
            .attr_with_key("firstName", "name")
            .attr("name")
            .attr("lastName")
            .relationship(RelationshipSchema::belongs_to("homePlanet", "home-planet").with_key("planet"))
    }

    #[test]
    fn test_explicit_key_wins_over_computed_key() {
        let keys = KeyMap::for_type(&villain(), KeyStyle::AsIs);
        assert_eq!(keys.attribute_for_key("name"), Some("firstName"));
        assert_eq!(keys.key_for_attribute("firstName"), Some("name"));
    }

    #[test]
    fn test_shadowed_field_is_not_cross_assigned() {
        let keys = KeyMap::for_type(&villain(), KeyStyle::AsIs);
        assert_eq!(keys.key_for_attribute("name"), None);
        // The declared field name itself is not a payload key once overridden.
        assert_eq!(keys.attribute_for_key("firstName"), None);
    }

    #[test]
    fn test_dasherized_style() {
        let keys = KeyMap::for_type(&villain(), KeyStyle::Dasherized);
        assert_eq!(keys.attribute_for_key("last-name"), Some("lastName"));
        assert_eq!(keys.key_for_relationship("homePlanet"), Some("planet"));
        assert_eq!(keys.relationship_for_key("planet"), Some("homePlanet"));
        assert_eq!(keys.relationship_for_key("home-planet"), None);
    }
}
