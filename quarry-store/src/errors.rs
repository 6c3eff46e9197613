//! Per-field validation errors of a record in an invalid state.

use quarry_core::{inflector, FieldError, TypeSchema};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Validation errors grouped by the attribute or relationship they point at.
///
/// Errors whose pointer names no member (`/data`) are base errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordErrors {
    members: BTreeMap<String, Vec<FieldError>>,
    base: Vec<FieldError>,
}

impl RecordErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group server errors by field name.
    ///
    /// Pointers may use the payload key (`first-name`) or the field name
    /// (`firstName`); both resolve to the field when the schema knows it.
    pub fn from_field_errors(schema: &TypeSchema, errors: Vec<FieldError>) -> Self {
        let mut grouped = Self::new();
        for error in errors {
            match error.member().map(|member| field_name(schema, member)) {
                Some(name) => grouped.add(&name, error),
                None => grouped.base.push(error),
            }
        }
        grouped
    }

    pub fn add(&mut self, member: &str, error: FieldError) {
        self.members.entry(member.to_string()).or_default().push(error);
    }

    pub fn get(&self, member: &str) -> &[FieldError] {
        self.members.get(member).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Error details for one field.
    pub fn messages(&self, member: &str) -> Vec<&str> {
        self.get(member).iter().map(|e| e.detail.as_str()).collect()
    }

    pub fn base(&self) -> &[FieldError] {
        &self.base
    }

    pub fn has(&self, member: &str) -> bool {
        self.members.contains_key(member)
    }

    /// Drop the errors of one field. Returns whether any were present.
    pub fn remove(&mut self, member: &str) -> bool {
        self.members.remove(member).is_some()
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.base.clear();
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.members.values().map(Vec::len).sum::<usize>() + self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.base.is_empty()
    }
}

fn field_name(schema: &TypeSchema, member: &str) -> String {
    let known = |name: &str| {
        schema.attribute(name).is_some() || schema.relationship_schema(name).is_some()
    };
    if known(member) {
        return member.to_string();
    }
    if let Some(attr) = schema
        .attributes
        .iter()
        .find(|attr| attr.key.as_deref() == Some(member))
    {
        return attr.name.clone();
    }
    let camelized = inflector::camelize(member);
    if known(&camelized) {
        return camelized;
    }
    member.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::ErrorSource;

    fn schema() -> TypeSchema {
        TypeSchema::new("user")
            .attr("firstName")
            .attr_with_key("email", "mail")
    }

    #[test]
    fn test_errors_grouped_by_field_name() {
        let errors = RecordErrors::from_field_errors(
            &schema(),
            vec![
                FieldError::for_attribute("first-name", "is too short"),
                FieldError::for_attribute("first-name", "is reserved"),
                FieldError::for_attribute("mail", "is taken"),
                FieldError {
                    title: "Invalid".to_string(),
                    detail: "record is locked".to_string(),
                    source: ErrorSource {
                        pointer: "/data".to_string(),
                    },
                },
            ],
        );

        assert_eq!(errors.len(), 4);
        assert_eq!(errors.messages("firstName"), vec!["is too short", "is reserved"]);
        assert_eq!(errors.messages("email"), vec!["is taken"]);
        assert_eq!(errors.base().len(), 1);
        assert_eq!(errors.members().collect::<Vec<_>>(), vec!["email", "firstName"]);
    }

    #[test]
    fn test_remove_field_errors() {
        let mut errors = RecordErrors::from_field_errors(
            &schema(),
            vec![FieldError::for_attribute("firstName", "blank")],
        );
        assert!(errors.has("firstName"));
        assert!(errors.remove("firstName"));
        assert!(!errors.remove("firstName"));
        assert!(errors.is_empty());
    }

    #[test]
    fn test_unknown_member_kept_verbatim() {
        let errors = RecordErrors::from_field_errors(
            &schema(),
            vec![FieldError::for_attribute("nickname", "unknown")],
        );
        assert_eq!(errors.messages("nickname"), vec!["unknown"]);
    }
}
