//! Fuel and maintenance records, the drafts used to create them and the patches used to edit them.

use std::cmp::Ordering;
use std::fmt::Debug;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::amount::Amount;
use crate::error::Error;
use crate::error::Result;
use crate::traits::Row;
use crate::types::RecordId;
use crate::types::ResourceKind;
use crate::types::UserId;

/// A row type of one of the ledger tables.
pub trait Record: Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: ResourceKind;

    /// User input for a new record; the owner is attached from the session.
    type Draft: Debug + Serialize + Send + Sync + 'static;
    /// Partial update; unset fields are left alone.
    type Patch: Debug + Serialize + Send + Sync + 'static;

    fn id(&self) -> &RecordId;
    fn user_id(&self) -> &UserId;
    fn amount(&self) -> Amount;
    fn date(&self) -> NaiveDate;

    /// Free-text fields searched by text filters.
    fn text_fields(&self) -> Vec<&str> {
        Vec::new()
    }

    fn validate_draft(_draft: &Self::Draft) -> Result<()> {
        Ok(())
    }

    fn validate_patch(_patch: &Self::Patch) -> Result<()> {
        Ok(())
    }

    fn into_set(records: Vec<Self>) -> RecordSet;
    fn from_set(set: RecordSet) -> Option<Vec<Self>>;

    fn from_row(row: Row) -> Result<Self> {
        Ok(serde_json::from_value(serde_json::Value::Object(row))?)
    }
}

/// Newest first; records of the same day go by ascending id.
pub fn display_order<R: Record>(a: &R, b: &R) -> Ordering {
    b.date().cmp(&a.date()).then_with(|| a.id().cmp(b.id()))
}

pub fn sort_for_display<R: Record>(records: &mut [R]) {
    records.sort_by(display_order);
}

/// Serialize a draft into a row owned by `user_id`.
pub fn draft_row<R: Record>(user_id: &UserId, draft: &R::Draft) -> Result<Row> {
    let mut row = object(serde_json::to_value(draft)?)?;
    row.insert("user_id".into(), serde_json::Value::String(user_id.to_string()));
    Ok(row)
}

pub fn patch_row<R: Record>(patch: &R::Patch) -> Result<Row> {
    let row = object(serde_json::to_value(patch)?)?;
    if row.is_empty() {
        return Err(Error::Validation("nothing to update".into()));
    }
    Ok(row)
}

fn object(value: serde_json::Value) -> Result<Row> {
    match value {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::Validation(format!("expected an object, got {other}"))),
    }
}

fn required(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        Err(Error::Validation(format!("{field} is required")))
    }
    else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuelRecord {
    pub id:      RecordId,
    pub user_id: UserId,
    pub amount:  Amount,
    pub date:    NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuelDraft {
    pub amount: Amount,
    pub date:   NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuelPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Amount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date:   Option<NaiveDate>,
}

impl Record for FuelRecord {
    type Draft = FuelDraft;
    type Patch = FuelPatch;

    const KIND: ResourceKind = ResourceKind::Fuel;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn amount(&self) -> Amount {
        self.amount
    }

    fn date(&self) -> NaiveDate {
        self.date
    }

    fn into_set(records: Vec<Self>) -> RecordSet {
        RecordSet::Fuel(records)
    }

    fn from_set(set: RecordSet) -> Option<Vec<Self>> {
        match set {
            RecordSet::Fuel(records) => Some(records),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceRecord {
    pub id:         RecordId,
    pub user_id:    UserId,
    pub problem:    String,
    /// Where the service was done.
    pub service_at: String,
    pub amount:     Amount,
    pub date:       NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceDraft {
    pub problem:    String,
    pub service_at: String,
    pub amount:     Amount,
    pub date:       NaiveDate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenancePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem:    Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount:     Option<Amount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date:       Option<NaiveDate>,
}

impl Record for MaintenanceRecord {
    type Draft = MaintenanceDraft;
    type Patch = MaintenancePatch;

    const KIND: ResourceKind = ResourceKind::Maintenance;

    fn id(&self) -> &RecordId {
        &self.id
    }

    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn amount(&self) -> Amount {
        self.amount
    }

    fn date(&self) -> NaiveDate {
        self.date
    }

    fn text_fields(&self) -> Vec<&str> {
        vec![self.problem.as_str(), self.service_at.as_str()]
    }

    fn validate_draft(draft: &Self::Draft) -> Result<()> {
        required("problem", &draft.problem)?;
        required("service location", &draft.service_at)
    }

    fn validate_patch(patch: &Self::Patch) -> Result<()> {
        if let Some(ref problem) = patch.problem {
            required("problem", problem)?;
        }
        if let Some(ref service_at) = patch.service_at {
            required("service location", service_at)?;
        }
        Ok(())
    }

    fn into_set(records: Vec<Self>) -> RecordSet {
        RecordSet::Maintenance(records)
    }

    fn from_set(set: RecordSet) -> Option<Vec<Self>> {
        match set {
            RecordSet::Maintenance(records) => Some(records),
            _ => None,
        }
    }
}

/// Type-erased records of a single kind, as kept by the caches.
#[derive(Debug, Clone)]
pub enum RecordSet {
    Fuel(Vec<FuelRecord>),
    Maintenance(Vec<MaintenanceRecord>),
}

impl RecordSet {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Fuel(_) => ResourceKind::Fuel,
            Self::Maintenance(_) => ResourceKind::Maintenance,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Fuel(r) => r.len(),
            Self::Maintenance(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fuel(id: &str, date: &str) -> FuelRecord {
        FuelRecord {
            id:      id.into(),
            user_id: "u1".into(),
            amount:  "10".parse().unwrap(),
            date:    date.parse().unwrap(),
        }
    }

    #[test]
    fn newest_first_then_id() {
        let mut records = vec![
            fuel("b", "2024-05-01"),
            fuel("c", "2024-06-01"),
            fuel("a", "2024-05-01"),
        ];
        sort_for_display(&mut records);
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["c", "a", "b"]);
    }

    #[test]
    fn rows_carry_owner_and_only_set_fields() {
        let draft = FuelDraft {
            amount: "55.20".parse().unwrap(),
            date:   "2024-05-01".parse().unwrap(),
        };
        let row = draft_row::<FuelRecord>(&"u1".into(), &draft).unwrap();
        assert_eq!(row["user_id"], "u1");
        assert_eq!(row["amount"], "55.20");
        assert_eq!(row["date"], "2024-05-01");

        let patch = FuelPatch {
            amount: Some("60".parse().unwrap()),
            ..Default::default()
        };
        let row = patch_row::<FuelRecord>(&patch).unwrap();
        assert_eq!(row.len(), 1);
        assert!(matches!(
            patch_row::<FuelRecord>(&FuelPatch::default()),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn maintenance_requires_text() {
        let draft = MaintenanceDraft {
            problem:    "  ".into(),
            service_at: "Garage".into(),
            amount:     Amount::from_cents(100),
            date:       "2024-05-01".parse().unwrap(),
        };
        assert!(MaintenanceRecord::validate_draft(&draft).is_err());
        let patch = MaintenancePatch {
            service_at: Some(String::new()),
            ..Default::default()
        };
        assert!(MaintenanceRecord::validate_patch(&patch).is_err());
    }

    #[test]
    fn decodes_backend_rows() {
        let row = serde_json::json!({
            "id": "r1",
            "user_id": "u1",
            "problem": "Brake pads",
            "service_at": "Ah Seng Motor",
            "amount": 180.5,
            "date": "2024-02-03"
        });
        let serde_json::Value::Object(row) = row
        else {
            unreachable!()
        };
        let record = MaintenanceRecord::from_row(row).unwrap();
        assert_eq!(record.amount.to_string(), "180.50");
        assert_eq!(record.text_fields(), ["Brake pads", "Ah Seng Motor"]);
    }
}
