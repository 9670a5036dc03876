//! Signable entity kinds and the entity accessor contract.
//!
//! Business records are owned by other modules. The engine only needs a
//! fixed, ordered list of identity fields per record kind, which it reads
//! through [`Signable`]. At verification time it loads the record's current
//! state through an [`EntityAccessor`].

mod accessor;
mod kinds;

pub use accessor::{EntityAccessor, InMemoryEntityAccessor, TableEntityAccessor};
pub use kinds::{
    ASSETS, Asset, CAPA_CASES, CONTRACTOR_INTERVENTIONS, CapaCase, ContractorIntervention,
    KNOWN_KINDS, MACHINES, Machine, PARTS, Part, SUPPLIERS, Supplier, kind_for_table,
};

/// One identity field of a signable record, in canonical order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalField {
    /// Column name.
    pub name: &'static str,
    /// Field value as text; `None` for SQL `NULL`.
    pub value: Option<String>,
    /// Whether the payload cannot be built without this field.
    pub required: bool,
}

/// Static description of a signable record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityKind {
    /// Table the records live in.
    pub table: &'static str,
    /// Primary key column. Always required.
    pub key: &'static str,
    /// Identity fields in canonical order, key included.
    pub fields: &'static [&'static str],
}

impl EntityKind {
    /// Pairs `values` with this kind's fields, in order.
    ///
    /// Missing trailing values are treated as `NULL`; surplus values are
    /// ignored.
    pub fn bind<I>(&self, values: I) -> Vec<CanonicalField>
    where
        I: IntoIterator<Item = Option<String>>,
    {
        let mut values = values.into_iter();
        self.fields
            .iter()
            .map(|&name| CanonicalField {
                name,
                value: values.next().flatten(),
                required: name == self.key,
            })
            .collect()
    }
}

/// A record that can be signed.
///
/// `canonical_fields` must return the same fields in the same order for
/// every record of a kind, and only stable identity fields.
pub trait Signable: Send + Sync {
    /// Table the record belongs to.
    fn table_name(&self) -> &str;

    /// Primary key of the record, if it has one yet.
    fn record_id(&self) -> Option<i64>;

    /// Identity fields in canonical order.
    fn canonical_fields(&self) -> Vec<CanonicalField>;
}

/// Point-in-time copy of a record's identity fields.
///
/// This is what accessors return. A snapshot produces the same payload as
/// the typed record it was captured from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySnapshot {
    table: String,
    record_id: Option<i64>,
    fields: Vec<CanonicalField>,
}

impl EntitySnapshot {
    /// Builds a snapshot from already ordered fields.
    #[must_use]
    pub fn new(table: impl Into<String>, record_id: Option<i64>, fields: Vec<CanonicalField>) -> Self {
        Self {
            table: table.into(),
            record_id,
            fields,
        }
    }

    /// Copies the identity fields of any signable record.
    #[must_use]
    pub fn capture(entity: &dyn Signable) -> Self {
        Self {
            table: entity.table_name().to_string(),
            record_id: entity.record_id(),
            fields: entity.canonical_fields(),
        }
    }

    /// Returns a field value. `None` if the field is `NULL` or unknown.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.value.as_deref())
    }

    /// Overwrites a field value. Returns `false` if the field is unknown.
    pub fn set_field(&mut self, name: &str, value: Option<String>) -> bool {
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(field) => {
                field.value = value;
                true
            },
            None => false,
        }
    }
}

impl Signable for EntitySnapshot {
    fn table_name(&self) -> &str {
        &self.table
    }

    fn record_id(&self) -> Option<i64> {
        self.record_id
    }

    fn canonical_fields(&self) -> Vec<CanonicalField> {
        self.fields.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_marks_key_required_and_pads_with_null() {
        let fields = MACHINES.bind([Some("7".to_string()), Some("MX-7".to_string())]);

        assert_eq!(fields.len(), 4);
        assert!(fields[0].required);
        assert!(!fields[1].required);
        assert_eq!(fields[2].value, None);
        assert_eq!(fields[3].name, "serial_number");
    }

    #[test]
    fn snapshot_mirrors_typed_record() {
        let machine = Machine::new(7, "MX-7").with_name("Press");
        let mut snapshot = EntitySnapshot::capture(&machine);

        assert_eq!(snapshot.table_name(), "machines");
        assert_eq!(snapshot.record_id(), Some(7));
        assert_eq!(snapshot.canonical_fields(), machine.canonical_fields());

        assert!(snapshot.set_field("code", Some("MX-7X".into())));
        assert_eq!(snapshot.field("code"), Some("MX-7X"));
        assert!(!snapshot.set_field("colour", None));
    }
}
