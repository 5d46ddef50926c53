use crate::analysis::catalog::FieldCatalog;
use crate::models::document::ProfileDocument;
use crate::models::field::{FieldDefinition, FieldKind, ListPolicy};
use crate::models::snapshot::{CompletionSnapshot, IncompleteFieldReport};
use serde_json::Value;

/// Score a document against the catalog, stamped with the current time.
pub fn score(document: &ProfileDocument, catalog: &FieldCatalog) -> CompletionSnapshot {
    score_at(document, catalog, chrono::Utc::now().timestamp_millis())
}

/// Score a document with an explicit timestamp.
///
/// Pure: the same document, catalog and timestamp always give an equal
/// snapshot.
pub fn score_at(document: &ProfileDocument, catalog: &FieldCatalog, computed_at: i64) -> CompletionSnapshot {
    let mut earned_total: u64 = 0;
    let mut incomplete_fields = Vec::new();

    for field in catalog.all_fields() {
        let earned = earned_weight(document, field);
        earned_total += u64::from(earned);

        if earned < field.required_weight {
            incomplete_fields.push(IncompleteFieldReport {
                field: field.name.clone(),
                display_name: field.display_name.clone(),
                human_message: human_message(field, earned),
                required_weight: field.required_weight,
                current_weight: earned,
            });
        }
    }

    let total = u64::from(catalog.total_required_weight());
    let ratio = if total == 0 {
        1.0
    } else {
        (earned_total as f64 / total as f64).clamp(0.0, 1.0)
    };

    CompletionSnapshot {
        ratio,
        incomplete_fields,
        is_complete: ratio >= 1.0,
        computed_at,
    }
}

impl CompletionSnapshot {
    /// Snapshot of a document with nothing filled in.
    pub fn empty(catalog: &FieldCatalog, computed_at: i64) -> Self {
        score_at(&ProfileDocument::new(), catalog, computed_at)
    }
}

/// Weight a single field earns, never more than its required weight.
pub fn earned_weight(document: &ProfileDocument, field: &FieldDefinition) -> u32 {
    let value = match document.typed_value(field) {
        Ok(Some(value)) => value,
        Ok(None) => return 0,
        Err(err) => {
            log::debug!("scoring {} as unsatisfied: {err}", field.name);
            return 0;
        }
    };

    let full = field.required_weight;
    match field.kind {
        FieldKind::Text => {
            if value.as_str().is_some_and(|s| !s.trim().is_empty()) {
                full
            } else {
                0
            }
        }
        FieldKind::List(ListPolicy::Counted) => {
            let count = value.as_array().map_or(0, |items| counted_items(items));
            u32::try_from(count).unwrap_or(u32::MAX).min(full)
        }
        FieldKind::List(ListPolicy::AnyOrNone) => {
            if value.as_array().is_some_and(|items| !items.is_empty()) {
                full
            } else {
                0
            }
        }
        // Presence is enough; typed_value already rejected the wrong kind.
        FieldKind::Geopoint | FieldKind::Boolean | FieldKind::Number => full,
    }
}

// Null placeholders (an empty photo slot) do not count.
fn counted_items(items: &[Value]) -> usize {
    items.iter().filter(|item| !item.is_null()).count()
}

fn human_message(field: &FieldDefinition, earned: u32) -> String {
    match field.kind {
        FieldKind::List(ListPolicy::Counted) => format!(
            "{earned} of {} {} added",
            field.required_weight, field.display_name
        ),
        _ => field.prompt.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn two_field_catalog() -> FieldCatalog {
        FieldCatalog::new(vec![
            FieldDefinition::text("firstName", "first name", "Add your first name"),
            FieldDefinition::new(
                "profilePictures",
                "photos",
                FieldKind::List(ListPolicy::Counted),
                6,
                "Add photos",
            ),
        ])
        .expect("valid catalog")
    }

    fn photos(count: usize) -> Value {
        Value::Array((0..count).map(|i| json!(format!("https://cdn/p{i}.jpg"))).collect())
    }

    #[test]
    fn partial_photo_credit_matches_worked_example() {
        let doc = ProfileDocument::new()
            .with("firstName", json!("Ana"))
            .with("profilePictures", json!(["url1", "url2"]));

        let snapshot = score_at(&doc, &two_field_catalog(), 0);

        assert!((snapshot.ratio - 3.0 / 7.0).abs() < 1e-9);
        assert!(!snapshot.is_complete);
        assert_eq!(snapshot.incomplete_fields.len(), 1);
        let report = &snapshot.incomplete_fields[0];
        assert_eq!(report.field, "profilePictures");
        assert_eq!(report.current_weight, 2);
        assert_eq!(report.required_weight, 6);
        assert_eq!(report.human_message, "2 of 6 photos added");
    }

    #[test]
    fn counted_list_credit_is_capped() {
        let catalog = two_field_catalog();
        let field = catalog.field("profilePictures").unwrap();

        for (count, expected) in [(0, 0), (6, 6), (9, 6)] {
            let doc = ProfileDocument::new().with("profilePictures", photos(count));
            assert_eq!(earned_weight(&doc, field), expected, "{count} photos");
        }
    }

    #[test]
    fn boolean_presence_counts_not_truthiness() {
        let field = FieldDefinition::new("showGender", "gender visibility", FieldKind::Boolean, 1, "Choose");

        assert_eq!(earned_weight(&ProfileDocument::new().with("showGender", json!(false)), &field), 1);
        assert_eq!(earned_weight(&ProfileDocument::new(), &field), 0);
        assert_eq!(earned_weight(&ProfileDocument::new().with("showGender", json!("false")), &field), 0);
    }

    #[test]
    fn number_zero_is_satisfied_but_numeric_string_is_not() {
        let field = FieldDefinition::new("height", "height", FieldKind::Number, 1, "Add height");

        assert_eq!(earned_weight(&ProfileDocument::new().with("height", json!(0)), &field), 1);
        assert_eq!(earned_weight(&ProfileDocument::new().with("height", json!("170")), &field), 0);
    }

    #[test]
    fn whitespace_text_is_unsatisfied() {
        let field = FieldDefinition::text("bio", "bio", "Write a short bio");
        assert_eq!(earned_weight(&ProfileDocument::new().with("bio", json!("   ")), &field), 0);
        assert_eq!(earned_weight(&ProfileDocument::new().with("bio", json!(" hi ")), &field), 1);
    }

    #[test]
    fn any_or_none_list_needs_one_element() {
        let field = FieldDefinition::new("prompts", "prompts", FieldKind::List(ListPolicy::AnyOrNone), 1, "Answer");
        assert_eq!(earned_weight(&ProfileDocument::new().with("prompts", json!([])), &field), 0);
        assert_eq!(earned_weight(&ProfileDocument::new().with("prompts", json!([{"q": "a"}])), &field), 1);
    }

    #[test]
    fn geopoint_needs_presence_only() {
        let field = FieldDefinition::new("location", "location", FieldKind::Geopoint, 1, "Set location");
        let doc = ProfileDocument::new().with("location", json!({"latitude": 999.0, "longitude": 0.0}));
        assert_eq!(earned_weight(&doc, &field), 1);
    }

    #[test]
    fn scoring_is_idempotent_and_bounded() {
        let catalog = FieldCatalog::dating_profile();
        let doc = ProfileDocument::new()
            .with("firstName", json!("Ana"))
            .with("profilePictures", photos(12))
            .with("height", json!("tall"))
            .with("unrelated", json!(true));

        let first = score_at(&doc, &catalog, 42);
        let second = score_at(&doc, &catalog, 42);

        assert_eq!(first, second);
        assert!((0.0..=1.0).contains(&first.ratio));
    }

    #[test]
    fn empty_document_scores_zero_and_lists_every_field() {
        let catalog = FieldCatalog::dating_profile();
        let snapshot = score_at(&ProfileDocument::new(), &catalog, 0);

        assert_eq!(snapshot.ratio, 0.0);
        assert_eq!(snapshot.incomplete_fields.len(), catalog.all_fields().len());
        assert_eq!(snapshot.missing_weight(), catalog.total_required_weight());
    }

    #[test]
    fn fully_filled_document_is_complete() {
        let catalog = two_field_catalog();
        let doc = ProfileDocument::new()
            .with("firstName", json!("Ana"))
            .with("profilePictures", photos(6));

        let snapshot = score_at(&doc, &catalog, 0);
        assert!(snapshot.is_complete);
        assert!(snapshot.incomplete_fields.is_empty());
        assert_eq!(snapshot.percent(), 100);
    }
}
