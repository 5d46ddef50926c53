use serde::{Deserialize, Serialize};
use std::fmt;

/// Linear signup sequence. Declaration order is the flow order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignupStage {
    #[default]
    Initial,
    AccountCreated,
    Name,
    Birthday,
    Gender,
    InterestedIn,
    DatingIntention,
    Height,
    Location,
    Hometown,
    Work,
    Education,
    Religion,
    Politics,
    Drinking,
    Smoking,
    Photos,
    Prompts,
    Bio,
    Complete,
}

impl SignupStage {
    pub const ALL: [SignupStage; 20] = [
        SignupStage::Initial,
        SignupStage::AccountCreated,
        SignupStage::Name,
        SignupStage::Birthday,
        SignupStage::Gender,
        SignupStage::InterestedIn,
        SignupStage::DatingIntention,
        SignupStage::Height,
        SignupStage::Location,
        SignupStage::Hometown,
        SignupStage::Work,
        SignupStage::Education,
        SignupStage::Religion,
        SignupStage::Politics,
        SignupStage::Drinking,
        SignupStage::Smoking,
        SignupStage::Photos,
        SignupStage::Prompts,
        SignupStage::Bio,
        SignupStage::Complete,
    ];

    pub fn as_tag(&self) -> &'static str {
        match self {
            SignupStage::Initial => "initial",
            SignupStage::AccountCreated => "account_created",
            SignupStage::Name => "name",
            SignupStage::Birthday => "birthday",
            SignupStage::Gender => "gender",
            SignupStage::InterestedIn => "interested_in",
            SignupStage::DatingIntention => "dating_intention",
            SignupStage::Height => "height",
            SignupStage::Location => "location",
            SignupStage::Hometown => "hometown",
            SignupStage::Work => "work",
            SignupStage::Education => "education",
            SignupStage::Religion => "religion",
            SignupStage::Politics => "politics",
            SignupStage::Drinking => "drinking",
            SignupStage::Smoking => "smoking",
            SignupStage::Photos => "photos",
            SignupStage::Prompts => "prompts",
            SignupStage::Bio => "bio",
            SignupStage::Complete => "complete",
        }
    }

    /// Unknown or corrupt tags fall back to `Initial`.
    pub fn from_tag(tag: &str) -> SignupStage {
        let trimmed = tag.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_tag() == trimmed)
            .unwrap_or_else(|| {
                log::warn!("unknown signup stage tag {trimmed:?}, falling back to initial");
                SignupStage::Initial
            })
    }

    pub fn next(&self) -> Option<SignupStage> {
        Self::ALL.get(self.position() + 1).copied()
    }

    pub fn is_terminal(&self) -> bool {
        *self == SignupStage::Complete
    }

    pub(crate) fn position(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for SignupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_for_every_stage() {
        for stage in SignupStage::ALL {
            assert_eq!(SignupStage::from_tag(stage.as_tag()), stage);
        }
    }

    #[test]
    fn corrupt_tags_fall_back_to_initial() {
        assert_eq!(SignupStage::from_tag("photoz"), SignupStage::Initial);
        assert_eq!(SignupStage::from_tag(""), SignupStage::Initial);
        assert_eq!(SignupStage::from_tag(" bio "), SignupStage::Bio);
    }

    #[test]
    fn declaration_order_matches_all_table() {
        for (index, stage) in SignupStage::ALL.iter().enumerate() {
            assert_eq!(stage.position(), index);
        }
        assert_eq!(SignupStage::Bio.next(), Some(SignupStage::Complete));
        assert_eq!(SignupStage::Complete.next(), None);
    }
}
