//! Metered operation categories.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// AI-backed feature a charge is attributed to.
///
/// The set is closed: a new call site has to add a variant here, so a typo
/// can never create an untracked category.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Food photo recognition and nutrition extraction.
    ScanImage,
    /// Nutrition coach chat turn.
    Chat,
    /// Shopping-list normalization.
    ShoppingList,
    /// Body-composition photo analysis.
    BodyScan,
    /// Weekly meal-plan generation.
    MealPlan,
    /// Recipe suggestion from pantry contents.
    RecipeSuggestion,
}

impl OperationType {
    pub const ALL: [OperationType; 6] = [
        OperationType::ScanImage,
        OperationType::Chat,
        OperationType::ShoppingList,
        OperationType::BodyScan,
        OperationType::MealPlan,
        OperationType::RecipeSuggestion,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ScanImage => "scan_image",
            Self::Chat => "chat",
            Self::ShoppingList => "shopping_list",
            Self::BodyScan => "body_scan",
            Self::MealPlan => "meal_plan",
            Self::RecipeSuggestion => "recipe_suggestion",
        }
    }

    /// Suffix used for `USAGE_LEDGER_ESTIMATE_*` environment variables.
    pub fn env_suffix(&self) -> String {
        self.as_str().to_uppercase()
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownOperation(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_matches_serde_names() {
        for op in OperationType::ALL {
            let json = serde_json::to_string(&op).unwrap();
            assert_eq!(json, format!("\"{}\"", op.as_str()));
            assert_eq!(op.as_str().parse::<OperationType>().unwrap(), op);
        }
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let err = "scan_imgae".parse::<OperationType>().unwrap_err();
        assert!(err.to_string().contains("scan_imgae"));
    }

    #[test]
    fn test_env_suffix() {
        assert_eq!(OperationType::ShoppingList.env_suffix(), "SHOPPING_LIST");
    }
}
