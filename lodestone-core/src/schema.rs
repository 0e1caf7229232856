//! The pipeline value-schema model.
//!
//! Every schema-shaped artifact of a generation — the Avro value schema
//! registered with the schema registry, the search index mapping, the
//! conditional ingest pipeline and the GraphQL schema documents — is derived
//! from the pipeline's field definitions by this module, so that all members
//! of a managed resource set agree on the document shape.

use serde_json::{json, Value};

use crate::crd::{FieldDefinition, FieldType};

/// The Avro record name used for every pipeline value schema.
const AVRO_RECORD_NAME: &str = "Value";

/// The resolved value schema of one pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueSchema {
    pipeline: String,
    fields: Vec<FieldDefinition>,
}

impl ValueSchema {
    /// Resolve the schema of the given pipeline from its field definitions.
    pub fn new(pipeline: impl Into<String>, fields: &[FieldDefinition]) -> Self {
        Self { pipeline: pipeline.into(), fields: fields.to_vec() }
    }

    /// Whether the schema contains at least one semi-structured field.
    pub fn has_json_fields(&self) -> bool {
        self.fields.iter().any(|field| field.field_type == FieldType::Json)
    }

    /// The Avro document registered as the value schema of the sink topic.
    pub fn avro_document(&self) -> Value {
        let fields: Vec<Value> = self
            .fields
            .iter()
            .map(|field| json!({"name": field.name, "type": avro_type(field.field_type)}))
            .collect();
        json!({
            "type": "record",
            "name": AVRO_RECORD_NAME,
            "namespace": self.pipeline,
            "fields": fields,
        })
    }

    /// The Avro document serialized for transport in connector configs and env vars.
    pub fn avro_json(&self) -> String {
        self.avro_document().to_string()
    }

    /// The mapping body used when creating the search index.
    pub fn index_mapping(&self) -> Value {
        let mut properties = serde_json::Map::new();
        for field in &self.fields {
            properties.insert(field.name.clone(), mapping_type(field.field_type));
        }
        json!({
            "mappings": {
                "dynamic": false,
                "properties": Value::Object(properties),
            }
        })
    }

    /// The ingest pipeline body expanding semi-structured fields, or `None`
    /// when the schema contains no such field and no ingest pipeline must exist.
    pub fn ingest_pipeline(&self) -> Option<Value> {
        let processors: Vec<Value> = self
            .fields
            .iter()
            .filter(|field| field.field_type == FieldType::Json)
            .map(|field| json!({"json": {"field": field.name}}))
            .collect();
        if processors.is_empty() {
            return None;
        }
        Some(json!({
            "description": format!("JSON field expansion for {}", self.pipeline),
            "processors": processors,
        }))
    }

    /// The GraphQL schema document presented by the API subgraphs.
    pub fn graphql_document(&self) -> String {
        let type_name = self.pipeline.replace('-', "_");
        let mut doc = String::new();
        if self.has_json_fields() {
            doc.push_str("scalar JSONObject\n\n");
        }
        doc.push_str(&format!("type {} {{\n", type_name));
        for field in &self.fields {
            doc.push_str(&format!("  {}: {}\n", field.name, graphql_type(field.field_type)));
        }
        doc.push_str("}\n\n");
        doc.push_str(&format!("type Query {{\n  {}(filter: String): [{}]\n}}\n", type_name, type_name));
        doc
    }
}

/// The Avro type node of a field.
fn avro_type(field_type: FieldType) -> Value {
    match field_type {
        FieldType::String => json!("string"),
        FieldType::Boolean => json!("boolean"),
        FieldType::Integer => json!("long"),
        FieldType::Float => json!("double"),
        FieldType::Date => json!({"type": "long", "logicalType": "timestamp-millis"}),
        FieldType::Json => json!({"type": "string", "lodestone.type": "json"}),
    }
}

/// The search mapping node of a field.
fn mapping_type(field_type: FieldType) -> Value {
    match field_type {
        FieldType::String => json!({"type": "keyword"}),
        FieldType::Boolean => json!({"type": "boolean"}),
        FieldType::Integer => json!({"type": "long"}),
        FieldType::Float => json!({"type": "double"}),
        FieldType::Date => json!({"type": "date"}),
        FieldType::Json => json!({"type": "object", "enabled": true}),
    }
}

/// The GraphQL type of a field.
fn graphql_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::String => "String",
        FieldType::Boolean => "Boolean",
        FieldType::Integer => "Int",
        FieldType::Float => "Float",
        FieldType::Date => "String",
        FieldType::Json => "JSONObject",
    }
}
