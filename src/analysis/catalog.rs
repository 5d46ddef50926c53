use crate::error::{SyncError, SyncResult};
use crate::models::field::{FieldDefinition, FieldKind, ListPolicy};
use std::collections::HashSet;

/// Number of photos a complete profile carries.
pub const REQUIRED_PHOTO_COUNT: u32 = 6;

/// Ordered, validated set of required profile fields.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCatalog {
    fields: Vec<FieldDefinition>,
    total_required_weight: u32,
}

impl FieldCatalog {
    pub fn new(fields: Vec<FieldDefinition>) -> SyncResult<Self> {
        if fields.is_empty() {
            return Err(SyncError::Catalog("catalog has no fields".to_string()));
        }

        let mut seen = HashSet::new();
        for field in &fields {
            if field.name.trim().is_empty() {
                return Err(SyncError::Catalog("field name is empty".to_string()));
            }
            if field.required_weight == 0 {
                return Err(SyncError::Catalog(format!(
                    "field {} has zero required weight",
                    field.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(SyncError::Catalog(format!("duplicate field {}", field.name)));
            }
        }

        let total_required_weight = fields.iter().map(|f| f.required_weight).sum();
        Ok(Self {
            fields,
            total_required_weight,
        })
    }

    /// The production dating-profile catalog.
    pub fn dating_profile() -> Self {
        let fields = vec![
            FieldDefinition::text("firstName", "first name", "Add your first name"),
            FieldDefinition::new("birthday", "birthday", FieldKind::Number, 1, "Add your birthday"),
            FieldDefinition::text("gender", "gender", "Tell us your gender"),
            FieldDefinition::new(
                "showGender",
                "gender visibility",
                FieldKind::Boolean,
                1,
                "Choose whether to show your gender",
            ),
            FieldDefinition::new(
                "interestedIn",
                "interested in",
                FieldKind::List(ListPolicy::AnyOrNone),
                1,
                "Pick who you're interested in",
            ),
            FieldDefinition::text("datingIntention", "dating intention", "Share what you're looking for"),
            FieldDefinition::new("height", "height", FieldKind::Number, 1, "Add your height"),
            FieldDefinition::new("location", "location", FieldKind::Geopoint, 1, "Set your location"),
            FieldDefinition::text("hometown", "hometown", "Add your hometown"),
            FieldDefinition::text("jobTitle", "job title", "Add your job title"),
            FieldDefinition::text("school", "school", "Add your school"),
            FieldDefinition::text("religion", "religion", "Add your religious beliefs"),
            FieldDefinition::text("politics", "politics", "Add your political beliefs"),
            FieldDefinition::text("drinking", "drinking", "Tell us about drinking"),
            FieldDefinition::text("smoking", "smoking", "Tell us about smoking"),
            FieldDefinition::new(
                "profilePictures",
                "photos",
                FieldKind::List(ListPolicy::Counted),
                REQUIRED_PHOTO_COUNT,
                "Add photos",
            ),
            FieldDefinition::new(
                "prompts",
                "prompts",
                FieldKind::List(ListPolicy::AnyOrNone),
                1,
                "Answer a prompt",
            ),
            FieldDefinition::text("bio", "bio", "Write a short bio"),
        ];

        Self::from_static(fields)
    }

    pub fn all_fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    pub fn total_required_weight(&self) -> u32 {
        self.total_required_weight
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    // Only for catalogs written in source; invariants are covered by tests.
    fn from_static(fields: Vec<FieldDefinition>) -> Self {
        let total_required_weight = fields.iter().map(|f| f.required_weight).sum();
        Self {
            fields,
            total_required_weight,
        }
    }
}

impl Default for FieldCatalog {
    fn default() -> Self {
        Self::dating_profile()
    }
}
