use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Optional metadata carried by nodes, ways and relations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Info {
    pub version: i32,
    pub timestamp: Option<DateTime<Utc>>,
    pub changeset: i64,
    pub uid: i32,
    pub username: String,
    pub visible: bool,
}

impl Default for Info {
    fn default() -> Self {
        Self {
            version: 0,
            timestamp: None,
            changeset: 0,
            uid: 0,
            username: String::new(),
            visible: true,
        }
    }
}

/// OSM node: a tagged point with coordinates in degrees.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub tags: HashMap<String, String>,
    pub info: Option<Info>,
    pub lat: f64,
    pub lon: f64,
}

/// OSM way: an ordered, therefore directed, sequence of node ids.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Way {
    pub id: i64,
    pub tags: HashMap<String, String>,
    pub info: Option<Info>,
    pub nodes: Vec<i64>,
}

/// OSM relation: an ordered member list referencing other entities by id.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Relation {
    pub id: i64,
    pub tags: HashMap<String, String>,
    pub info: Option<Info>,
    pub members: Vec<RelationMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationMember {
    pub member_id: i64,
    pub member_type: ElementType,
    pub role: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Node,
    Way,
    Relation,
}

/// Union of the data entities, used on the writer side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Element {
    Node(Node),
    Way(Way),
    Relation(Relation),
}

/// Bounding box in degrees, as carried by the header block.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundBox {
    pub left: f64,
    pub right: f64,
    pub top: f64,
    pub bottom: f64,
}

/// Metadata from the leading `OSMHeader` blob.
///
/// `bbox` is only populated when the parser was configured with a bounding
/// box sink; feature lists are surfaced verbatim and not enforced.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Header {
    pub required_features: Vec<String>,
    pub optional_features: Vec<String>,
    pub writing_program: Option<String>,
    pub source: Option<String>,
    pub replication_timestamp: Option<i64>,
    pub replication_sequence_number: Option<i64>,
    pub replication_base_url: Option<String>,
    pub bbox: Option<BoundBox>,
}
