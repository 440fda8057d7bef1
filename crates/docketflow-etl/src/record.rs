//! Record kinds and their extractors
//!
//! Each source object is a JSON:API document:
//!
//! ```json
//! { "data": { "id": "EPA-HQ-OAR-2021-0317-0001",
//!             "attributes": { "agencyId": "EPA", "title": "...", ... } } }
//! ```
//!
//! A [`RecordKind`] owns everything kind-specific: the ordered column list,
//! the identifier column, the source folder pattern and the extractor that
//! flattens one document into a [`Row`]. All columns are nullable `Utf8`;
//! dates stay as source strings and are parsed by consumers.

use std::fmt;
use std::sync::{Arc, OnceLock};

use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One flattened record, aligned with [`RecordKind::columns`]
pub type Row = Vec<Option<String>>;

const DOCKET_COLUMNS: &[&str] = &[
    "docket_id",
    "agency_code",
    "title",
    "docket_type",
    "modify_date",
    "abstract",
];

const DOCUMENT_COLUMNS: &[&str] = &[
    "document_id",
    "docket_id",
    "agency_code",
    "title",
    "document_type",
    "posted_date",
    "modify_date",
    "comment_start_date",
    "comment_end_date",
    "file_url",
];

const COMMENT_COLUMNS: &[&str] = &[
    "comment_id",
    "docket_id",
    "agency_code",
    "title",
    "comment",
    "document_type",
    "posted_date",
    "modify_date",
    "receive_date",
];

/// The three record kinds published per docket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Docket,
    Document,
    Comment,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [RecordKind::Docket, RecordKind::Document, RecordKind::Comment];

    /// Dataset stem: `dockets.parquet`, `staging/dockets/`, ...
    pub fn name(self) -> &'static str {
        match self {
            RecordKind::Docket => "dockets",
            RecordKind::Document => "documents",
            RecordKind::Comment => "comments",
        }
    }

    /// Path fragment identifying this kind inside a source key
    pub fn folder(self) -> &'static str {
        match self {
            RecordKind::Docket => "/docket/",
            RecordKind::Document => "/documents/",
            RecordKind::Comment => "/comments/",
        }
    }

    pub fn id_column(self) -> &'static str {
        self.columns()[0]
    }

    pub fn columns(self) -> &'static [&'static str] {
        match self {
            RecordKind::Docket => DOCKET_COLUMNS,
            RecordKind::Document => DOCUMENT_COLUMNS,
            RecordKind::Comment => COMMENT_COLUMNS,
        }
    }

    /// Date column used as the secondary sort key of the optimized layout
    pub fn sort_date_column(self) -> &'static str {
        match self {
            RecordKind::Docket => "modify_date",
            RecordKind::Document | RecordKind::Comment => "posted_date",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.parquet", self.name())
    }

    /// Target schema for staging and merged files
    pub fn schema(self) -> SchemaRef {
        static SCHEMAS: OnceLock<[SchemaRef; 3]> = OnceLock::new();
        let schemas = SCHEMAS.get_or_init(|| RecordKind::ALL.map(build_schema));
        schemas[self as usize].clone()
    }

    /// Classify a source key by its folder, if it belongs to any kind
    pub fn from_key(key: &str) -> Option<RecordKind> {
        RecordKind::ALL
            .into_iter()
            .find(|kind| key.contains(kind.folder()))
    }

    /// Flatten one source document into a row
    ///
    /// Returns `None` when the document has no usable `data.id`; every other
    /// missing field simply becomes a null cell.
    pub fn extract(self, document: &Value) -> Option<Row> {
        let data = document.get("data")?.as_object()?;
        let id = scalar_string(data.get("id")?)?;
        if id.trim().is_empty() {
            return None;
        }

        let empty = Map::new();
        let attrs = data
            .get("attributes")
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        let attr = |name: &str| attrs.get(name).and_then(scalar_string);
        let agency = attr("agencyId")
            .map(|a| a.trim().to_uppercase())
            .filter(|a| !a.is_empty());

        let row = match self {
            RecordKind::Docket => vec![
                Some(id),
                agency,
                attr("title"),
                attr("docketType"),
                attr("modifyDate"),
                attr("dkAbstract"),
            ],
            RecordKind::Document => vec![
                Some(id),
                attr("docketId"),
                agency,
                attr("title"),
                attr("documentType"),
                attr("postedDate"),
                attr("modifyDate"),
                attr("commentStartDate"),
                attr("commentEndDate"),
                first_file_url(attrs),
            ],
            RecordKind::Comment => vec![
                Some(id),
                attr("docketId"),
                agency,
                attr("title"),
                attr("comment"),
                attr("documentType"),
                attr("postedDate"),
                attr("modifyDate"),
                attr("receiveDate"),
            ],
        };

        debug_assert_eq!(row.len(), self.columns().len());
        Some(row)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docket" | "dockets" => Ok(RecordKind::Docket),
            "document" | "documents" => Ok(RecordKind::Document),
            "comment" | "comments" => Ok(RecordKind::Comment),
            other => Err(format!(
                "unknown record kind '{}', expected dockets, documents or comments",
                other
            )),
        }
    }
}

fn build_schema(kind: RecordKind) -> SchemaRef {
    let fields: Vec<Field> = kind
        .columns()
        .iter()
        .map(|name| Field::new(*name, DataType::Utf8, true))
        .collect();
    Arc::new(Schema::new(fields))
}

/// Strings pass through, other scalars are rendered, nested values are kept
/// as compact JSON.
fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        nested => Some(nested.to_string()),
    }
}

fn first_file_url(attrs: &Map<String, Value>) -> Option<String> {
    attrs
        .get("fileFormats")?
        .as_array()?
        .first()?
        .get("fileUrl")
        .and_then(scalar_string)
}
