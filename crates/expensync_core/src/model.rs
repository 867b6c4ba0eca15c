//! Expense tracker row types.
//!
//! Each type keeps unmodelled columns in `extra`, so a row fetched from the
//! remote and written back locally loses nothing.

use crate::record::new_record_id;
use crate::schema::{BUDGETS, CATEGORIES, EXPENSES, SUBCATEGORIES};
use crate::typed::Document;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single expense.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    /// Client-assigned identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Amount in the expense currency.
    pub amount: f64,
    /// Expense date, `YYYY-MM-DD`.
    pub date: String,
    /// Category reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    /// Subcategory reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcategory_id: Option<String>,
    /// Free-text note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// ISO currency code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Project tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// Payment method label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    /// Whether the expense is claimable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_reimbursable: Option<bool>,
    /// Last modification time as reported by the writer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
    /// Columns not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Expense {
    /// A new expense with a fresh identifier.
    #[must_use]
    pub fn new(user_id: impl Into<String>, amount: f64, date: impl Into<String>) -> Self {
        Self {
            id: new_record_id(),
            user_id: user_id.into(),
            amount,
            date: date.into(),
            category_id: None,
            subcategory_id: None,
            note: None,
            currency: None,
            project: None,
            payment_method: None,
            is_reimbursable: None,
            updated_at: None,
            extra: Map::new(),
        }
    }

    /// Sets the category.
    #[must_use]
    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.category_id = Some(category_id.into());
        self
    }

    /// Sets the note.
    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

impl Document for Expense {
    const COLLECTION: &'static str = EXPENSES;

    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> Option<&str> {
        Some(&self.user_id)
    }
}

/// The fields an expense edit may change. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpensePatch {
    /// New amount.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    /// New category.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    /// New subcategory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcategory_id: Option<String>,
    /// New note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// New date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    /// Modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// A top-level expense category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    /// Identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Emoji or icon name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Columns not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document for Category {
    const COLLECTION: &'static str = CATEGORIES;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A subcategory under a [`Category`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subcategory {
    /// Identifier.
    pub id: String,
    /// Parent category.
    pub category_id: String,
    /// Display name.
    pub name: String,
    /// Emoji or icon name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    /// Columns not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document for Subcategory {
    const COLLECTION: &'static str = SUBCATEGORIES;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A spending limit for a user, optionally scoped to a category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Budget {
    /// Identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Limit amount.
    pub amount: f64,
    /// Period label such as `monthly`.
    pub period: String,
    /// Category scope; `None` means overall.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    /// Subcategory scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcategory_id: Option<String>,
    /// Fraction of the limit at which to warn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_threshold: Option<f64>,
    /// Whether the budget is enforced.
    #[serde(default = "default_active")]
    pub is_active: bool,
    /// First day covered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    /// Last day covered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    /// Columns not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_active() -> bool {
    true
}

impl Budget {
    /// A new active budget with a fresh identifier.
    #[must_use]
    pub fn new(user_id: impl Into<String>, amount: f64, period: impl Into<String>) -> Self {
        Self {
            id: new_record_id(),
            user_id: user_id.into(),
            amount,
            period: period.into(),
            category_id: None,
            subcategory_id: None,
            alert_threshold: None,
            is_active: true,
            start_date: None,
            end_date: None,
            extra: Map::new(),
        }
    }
}

impl Document for Budget {
    const COLLECTION: &'static str = BUDGETS;

    fn id(&self) -> &str {
        &self.id
    }

    fn owner(&self) -> Option<&str> {
        Some(&self.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;
    use serde_json::json;

    #[test]
    fn unknown_columns_round_trip() {
        let record = Record::from_value(json!({
            "id": "e1",
            "user_id": "u1",
            "amount": 42,
            "date": "2024-01-05",
            "exchange_rate": 83.1,
            "location": {"lat": 1.0}
        }))
        .unwrap();

        let expense = Expense::from_record(&record).unwrap();
        assert_eq!(expense.amount, 42.0);
        assert_eq!(expense.extra.get("exchange_rate"), Some(&json!(83.1)));

        let back = expense.to_record().unwrap();
        assert_eq!(back.get("location"), Some(&json!({"lat": 1.0})));
        assert!(!back.contains("note"));
    }

    #[test]
    fn patch_serializes_only_set_fields() {
        let patch = ExpensePatch {
            amount: Some(9.5),
            ..ExpensePatch::default()
        };
        assert_eq!(serde_json::to_value(&patch).unwrap(), json!({"amount": 9.5}));
    }

    #[test]
    fn budget_defaults_active() {
        let budget: Budget = serde_json::from_value(json!({
            "id": "b1", "user_id": "u1", "amount": 500, "period": "monthly"
        }))
        .unwrap();
        assert!(budget.is_active);
        assert_eq!(budget.owner(), Some("u1"));
    }

    #[test]
    fn constructors_assign_ids() {
        let a = Expense::new("u1", 1.0, "2024-01-01").with_note("tea");
        let b = Budget::new("u1", 100.0, "weekly");
        assert!(!a.id.is_empty());
        assert_ne!(a.id, b.id);
        assert_eq!(a.note.as_deref(), Some("tea"));
    }
}
