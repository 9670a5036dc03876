//! Built-in signable record kinds.

use chrono::{DateTime, Utc};

use super::{CanonicalField, EntityKind, Signable};
use crate::payload::canonical_timestamp;

/// Production machines.
pub const MACHINES: EntityKind = EntityKind {
    table: "machines",
    key: "id",
    fields: &["id", "code", "name", "serial_number"],
};

/// Spare parts.
pub const PARTS: EntityKind = EntityKind {
    table: "parts",
    key: "id",
    fields: &["id", "code", "name"],
};

/// Qualified suppliers.
pub const SUPPLIERS: EntityKind = EntityKind {
    table: "suppliers",
    key: "id",
    fields: &["id", "name", "vat_number", "status"],
};

/// Corrective and preventive action cases.
pub const CAPA_CASES: EntityKind = EntityKind {
    table: "capa_cases",
    key: "id",
    fields: &["id", "capa_code", "title", "status", "risk_rating"],
};

/// External contractor interventions on an asset.
pub const CONTRACTOR_INTERVENTIONS: EntityKind = EntityKind {
    table: "contractor_interventions",
    key: "id",
    fields: &[
        "id",
        "asset_name",
        "contractor_name",
        "intervention_type",
        "status",
        "start_date",
        "end_date",
        "notes",
    ],
};

/// Generic assets (equipment not tracked as a machine).
pub const ASSETS: EntityKind = EntityKind {
    table: "assets",
    key: "id",
    fields: &["id", "asset_name"],
};

/// Every kind the table accessor knows how to load.
pub const KNOWN_KINDS: &[EntityKind] = &[
    ASSETS,
    MACHINES,
    PARTS,
    SUPPLIERS,
    CAPA_CASES,
    CONTRACTOR_INTERVENTIONS,
];

/// Looks up a built-in kind by table name.
#[must_use]
pub fn kind_for_table(table: &str) -> Option<&'static EntityKind> {
    KNOWN_KINDS.iter().find(|kind| kind.table == table)
}

/// A generic asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub id: i64,
    pub asset_name: String,
}

impl Asset {
    #[must_use]
    pub fn new(id: i64, asset_name: impl Into<String>) -> Self {
        Self {
            id,
            asset_name: asset_name.into(),
        }
    }
}

impl Signable for Asset {
    fn table_name(&self) -> &str {
        ASSETS.table
    }

    fn record_id(&self) -> Option<i64> {
        Some(self.id)
    }

    fn canonical_fields(&self) -> Vec<CanonicalField> {
        ASSETS.bind([Some(self.id.to_string()), Some(self.asset_name.clone())])
    }
}

/// A production machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub id: i64,
    pub code: String,
    pub name: Option<String>,
    pub serial_number: Option<String>,
}

impl Machine {
    #[must_use]
    pub fn new(id: i64, code: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
            name: None,
            serial_number: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = Some(serial.into());
        self
    }
}

impl Signable for Machine {
    fn table_name(&self) -> &str {
        MACHINES.table
    }

    fn record_id(&self) -> Option<i64> {
        Some(self.id)
    }

    fn canonical_fields(&self) -> Vec<CanonicalField> {
        MACHINES.bind([
            Some(self.id.to_string()),
            Some(self.code.clone()),
            self.name.clone(),
            self.serial_number.clone(),
        ])
    }
}

/// A spare part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub id: i64,
    pub code: String,
    pub name: Option<String>,
}

impl Part {
    #[must_use]
    pub fn new(id: i64, code: impl Into<String>) -> Self {
        Self {
            id,
            code: code.into(),
            name: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Signable for Part {
    fn table_name(&self) -> &str {
        PARTS.table
    }

    fn record_id(&self) -> Option<i64> {
        Some(self.id)
    }

    fn canonical_fields(&self) -> Vec<CanonicalField> {
        PARTS.bind([
            Some(self.id.to_string()),
            Some(self.code.clone()),
            self.name.clone(),
        ])
    }
}

/// A supplier under qualification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Supplier {
    pub id: i64,
    pub name: String,
    pub vat_number: Option<String>,
    pub status: Option<String>,
}

impl Supplier {
    #[must_use]
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            vat_number: None,
            status: None,
        }
    }

    #[must_use]
    pub fn with_vat_number(mut self, vat: impl Into<String>) -> Self {
        self.vat_number = Some(vat.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

impl Signable for Supplier {
    fn table_name(&self) -> &str {
        SUPPLIERS.table
    }

    fn record_id(&self) -> Option<i64> {
        Some(self.id)
    }

    fn canonical_fields(&self) -> Vec<CanonicalField> {
        SUPPLIERS.bind([
            Some(self.id.to_string()),
            Some(self.name.clone()),
            self.vat_number.clone(),
            self.status.clone(),
        ])
    }
}

/// A CAPA case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapaCase {
    pub id: i64,
    pub capa_code: String,
    pub title: Option<String>,
    pub status: Option<String>,
    pub risk_rating: Option<String>,
}

impl CapaCase {
    #[must_use]
    pub fn new(id: i64, capa_code: impl Into<String>) -> Self {
        Self {
            id,
            capa_code: capa_code.into(),
            title: None,
            status: None,
            risk_rating: None,
        }
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    #[must_use]
    pub fn with_risk_rating(mut self, rating: impl Into<String>) -> Self {
        self.risk_rating = Some(rating.into());
        self
    }
}

impl Signable for CapaCase {
    fn table_name(&self) -> &str {
        CAPA_CASES.table
    }

    fn record_id(&self) -> Option<i64> {
        Some(self.id)
    }

    fn canonical_fields(&self) -> Vec<CanonicalField> {
        CAPA_CASES.bind([
            Some(self.id.to_string()),
            Some(self.capa_code.clone()),
            self.title.clone(),
            self.status.clone(),
            self.risk_rating.clone(),
        ])
    }
}

/// Work carried out by an external contractor.
///
/// Dates enter the payload in canonical UTC form, so the same instant
/// recorded under different offsets signs identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractorIntervention {
    pub id: i64,
    pub asset_name: String,
    pub contractor_name: Option<String>,
    pub intervention_type: Option<String>,
    pub status: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl ContractorIntervention {
    #[must_use]
    pub fn new(id: i64, asset_name: impl Into<String>) -> Self {
        Self {
            id,
            asset_name: asset_name.into(),
            contractor_name: None,
            intervention_type: None,
            status: None,
            start_date: None,
            end_date: None,
            notes: None,
        }
    }

    #[must_use]
    pub fn with_contractor(mut self, name: impl Into<String>) -> Self {
        self.contractor_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_intervention_type(mut self, kind: impl Into<String>) -> Self {
        self.intervention_type = Some(kind.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    #[must_use]
    pub const fn with_period(mut self, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> Self {
        self.start_date = Some(start);
        self.end_date = end;
        self
    }

    #[must_use]
    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

impl Signable for ContractorIntervention {
    fn table_name(&self) -> &str {
        CONTRACTOR_INTERVENTIONS.table
    }

    fn record_id(&self) -> Option<i64> {
        Some(self.id)
    }

    fn canonical_fields(&self) -> Vec<CanonicalField> {
        CONTRACTOR_INTERVENTIONS.bind([
            Some(self.id.to_string()),
            Some(self.asset_name.clone()),
            self.contractor_name.clone(),
            self.intervention_type.clone(),
            self.status.clone(),
            self.start_date.as_ref().map(canonical_timestamp),
            self.end_date.as_ref().map(canonical_timestamp),
            self.notes.clone(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn kinds_are_found_by_table() {
        assert_eq!(kind_for_table("parts"), Some(&PARTS));
        assert_eq!(kind_for_table("work_orders"), None);
        for kind in KNOWN_KINDS {
            assert_eq!(kind.fields[0], kind.key);
        }
    }

    #[test]
    fn field_lists_follow_kind_order() {
        let capa = CapaCase::new(3, "CAPA-3").with_risk_rating("high");
        let names: Vec<_> = capa.canonical_fields().iter().map(|f| f.name).collect();
        assert_eq!(names, CAPA_CASES.fields);
        assert_eq!(capa.canonical_fields()[4].value.as_deref(), Some("high"));
    }

    #[test]
    fn asset_binds_id_and_name() {
        let asset = Asset::new(4, "Cold room");
        let fields = asset.canonical_fields();

        assert_eq!(asset.table_name(), "assets");
        assert_eq!(kind_for_table("assets"), Some(&ASSETS));
        assert_eq!(
            fields.iter().map(|f| f.value.as_deref()).collect::<Vec<_>>(),
            vec![Some("4"), Some("Cold room")]
        );
        assert!(fields[0].required);
    }

    #[test]
    fn intervention_dates_are_canonical() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap();
        let job = ContractorIntervention::new(1, "Boiler").with_period(start, None);
        let fields = job.canonical_fields();

        assert_eq!(
            fields[5].value.as_deref(),
            Some("2024-03-01T08:30:00.000000Z")
        );
        assert_eq!(fields[6].value, None);
    }
}
