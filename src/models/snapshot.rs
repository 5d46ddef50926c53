use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteFieldReport {
    pub field: String,
    pub display_name: String,
    pub human_message: String,
    pub required_weight: u32,
    /// Weight earned so far, not weight missing.
    pub current_weight: u32,
}

impl IncompleteFieldReport {
    pub fn missing_weight(&self) -> u32 {
        self.required_weight.saturating_sub(self.current_weight)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSnapshot {
    pub ratio: f64,
    pub incomplete_fields: Vec<IncompleteFieldReport>,
    pub is_complete: bool,
    /// Milliseconds since the Unix epoch.
    pub computed_at: i64,
}

impl CompletionSnapshot {
    /// Rounded percentage for display, 0..=100.
    pub fn percent(&self) -> u8 {
        (self.ratio * 100.0).round().clamp(0.0, 100.0) as u8
    }

    pub fn missing_weight(&self) -> u32 {
        self.incomplete_fields
            .iter()
            .map(IncompleteFieldReport::missing_weight)
            .sum()
    }

    pub fn is_field_incomplete(&self, field: &str) -> bool {
        self.incomplete_fields.iter().any(|report| report.field == field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_rounds_and_missing_weight_sums_reports() {
        let snapshot = CompletionSnapshot {
            ratio: 3.0 / 7.0,
            incomplete_fields: vec![IncompleteFieldReport {
                field: "profilePictures".to_string(),
                display_name: "photos".to_string(),
                human_message: "2 of 6 photos added".to_string(),
                required_weight: 6,
                current_weight: 2,
            }],
            is_complete: false,
            computed_at: 0,
        };

        assert_eq!(snapshot.percent(), 43);
        assert_eq!(snapshot.missing_weight(), 4);
        assert!(snapshot.is_field_incomplete("profilePictures"));
        assert!(!snapshot.is_field_incomplete("firstName"));
    }
}
