//! Tantivy schema for tracked item records.

use tantivy::schema::{Field, STORED, STRING, Schema, SchemaBuilder};

/// Schema fields for the ledger index.
#[derive(Debug)]
pub struct LedgerSchema {
    /// Record identity (the file's logical path).
    pub id: Field,

    /// Authoritative storage, indexed for per-storage scans.
    pub source_storage_id: Field,

    /// Flow association, indexed.
    pub media_flow_id: Field,

    /// Revision token for optimistic concurrency.
    pub rev: Field,

    /// Full record as JSON.
    pub body: Field,
}

impl LedgerSchema {
    /// Build the schema for the ledger index.
    pub fn build() -> (Schema, Self) {
        let mut builder = SchemaBuilder::default();

        // STRING for exact matching
        let id = builder.add_text_field("id", STRING | STORED);
        let source_storage_id = builder.add_text_field("source_storage_id", STRING | STORED);
        let media_flow_id = builder.add_text_field("media_flow_id", STRING);

        let rev = builder.add_u64_field("rev", STORED);

        // Not indexed, retrieval only
        let body = builder.add_text_field("body", STORED);

        let schema = builder.build();

        let ledger_schema = Self {
            id,
            source_storage_id,
            media_flow_id,
            rev,
            body,
        };

        (schema, ledger_schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_build() {
        let (schema, fields) = LedgerSchema::build();

        assert_eq!(schema.get_field("id").unwrap(), fields.id);
        assert_eq!(
            schema.get_field("source_storage_id").unwrap(),
            fields.source_storage_id
        );
        assert!(schema.get_field_entry(fields.source_storage_id).is_indexed());
        assert!(schema.get_field_entry(fields.media_flow_id).is_indexed());
        assert!(!schema.get_field_entry(fields.body).is_indexed());
        assert!(schema.get_field_entry(fields.rev).is_stored());
    }
}
