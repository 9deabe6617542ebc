use std::collections::HashMap;
use std::mem;

use protobuf::{Message, RepeatedField};

use super::field::FieldCodec;
use crate::error::{PbfError, Result};
use crate::models::{ElementType, Info, Node, Relation, Way};
use crate::proto::osmformat;
use crate::proto::osmformat::Relation_MemberType;

const DEFAULT_GRANULARITY: i32 = 100;
const DEFAULT_DATE_GRANULARITY: i32 = 1000;

// Rough per-entry serialized sizes backing the flush estimates.
const NODE_ENTRY_SIZE: usize = 48;
const WAY_ENTRY_SIZE: usize = 56;
const TAG_ENTRY_SIZE: usize = 8;
const REF_ENTRY_SIZE: usize = 8;
const MEMBER_ENTRY_SIZE: usize = 16;

/// Insertion-keyed string table for one block under construction.
///
/// Index 0 is reserved for the empty string. [`add`](StringTableBuilder::add)
/// is the sole mutator: it returns the existing index for a known string or
/// appends the string and returns the new index.
pub struct StringTableBuilder {
    strings: Vec<Vec<u8>>,
    index: HashMap<String, i32>,
    byte_size: usize,
}

impl StringTableBuilder {
    pub fn new() -> Self {
        let mut index = HashMap::new();
        index.insert(String::new(), 0);
        Self {
            strings: vec![Vec::new()],
            index,
            byte_size: 0,
        }
    }

    pub fn add(&mut self, string: &str) -> i32 {
        if let Some(&id) = self.index.get(string) {
            return id;
        }
        let id = self.strings.len() as i32;
        self.byte_size += string.len();
        self.strings.push(string.as_bytes().to_vec());
        self.index.insert(string.to_owned(), id);
        id
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    fn build(&mut self) -> osmformat::StringTable {
        let mut table = osmformat::StringTable::new();
        table.set_s(RepeatedField::from_vec(mem::take(&mut self.strings)));
        table
    }
}

impl Default for StringTableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_tags(
    table: &mut StringTableBuilder,
    tags: &HashMap<String, String>,
) -> (Vec<u32>, Vec<u32>) {
    let mut keys = Vec::with_capacity(tags.len());
    let mut vals = Vec::with_capacity(tags.len());
    for (key, value) in tags {
        keys.push(table.add(key) as u32);
        vals.push(table.add(value) as u32);
    }
    (keys, vals)
}

fn encode_info(
    table: &mut StringTableBuilder,
    codec: &FieldCodec,
    info: &Info,
) -> osmformat::Info {
    let mut encoded = osmformat::Info::new();
    encoded.set_version(info.version);
    encoded.set_timestamp(
        info.timestamp
            .map(|time| codec.encode_timestamp(time))
            .unwrap_or(0),
    );
    encoded.set_changeset(info.changeset);
    encoded.set_uid(info.uid);
    encoded.set_user_sid(table.add(&info.username) as u32);
    encoded.set_visible(info.visible);
    encoded
}

fn write_block(
    table: &mut StringTableBuilder,
    groups: Vec<osmformat::PrimitiveGroup>,
) -> Result<Vec<u8>> {
    let mut block = osmformat::PrimitiveBlock::new();
    block.set_stringtable(table.build());
    block.set_primitivegroup(RepeatedField::from_vec(groups));
    block
        .write_to_bytes()
        .map_err(|err| PbfError::MalformedBlock(format!("block serialization failed: {}", err)))
}

/// Accumulates nodes into dense-format primitive groups, reversing the
/// delta and sentinel coding of the decoder. `write()` is terminal.
///
/// The `denseinfo` arrays cover every node of their group, so nodes with and
/// without metadata cannot share one: a change in info presence seals the
/// current group and opens a fresh one, which keeps absent metadata absent
/// across a round trip. Delta chains restart per group.
pub struct DenseNodeEncoder {
    table: StringTableBuilder,
    codec: FieldCodec,
    groups: Vec<osmformat::PrimitiveGroup>,
    dense: osmformat::DenseNodes,
    info: osmformat::DenseInfo,
    group_has_info: bool,
    prev_id: i64,
    prev_lat: i64,
    prev_lon: i64,
    prev_timestamp: i64,
    prev_changeset: i64,
    prev_uid: i32,
    prev_sid: i32,
    estimate: usize,
    consumed: bool,
}

impl DenseNodeEncoder {
    pub fn new() -> Self {
        Self {
            table: StringTableBuilder::new(),
            codec: FieldCodec::new(DEFAULT_GRANULARITY, DEFAULT_DATE_GRANULARITY),
            groups: Vec::new(),
            dense: osmformat::DenseNodes::new(),
            info: osmformat::DenseInfo::new(),
            group_has_info: false,
            prev_id: 0,
            prev_lat: 0,
            prev_lon: 0,
            prev_timestamp: 0,
            prev_changeset: 0,
            prev_uid: 0,
            prev_sid: 0,
            estimate: 0,
            consumed: false,
        }
    }

    pub fn append(&mut self, node: &Node) -> Result<()> {
        self.ensure_live()?;

        let has_info = node.info.is_some();
        if !self.dense.id.is_empty() && self.group_has_info != has_info {
            self.seal_group();
        }
        self.group_has_info = has_info;

        self.dense.id.push(node.id - self.prev_id);
        self.prev_id = node.id;

        let lat = self.codec.encode_latitude(node.lat);
        let lon = self.codec.encode_longitude(node.lon);
        self.dense.lat.push(lat - self.prev_lat);
        self.dense.lon.push(lon - self.prev_lon);
        self.prev_lat = lat;
        self.prev_lon = lon;

        if let Some(info) = &node.info {
            self.info.version.push(info.version);
            let timestamp = info
                .timestamp
                .map(|time| self.codec.encode_timestamp(time))
                .unwrap_or(0);
            self.info.timestamp.push(timestamp - self.prev_timestamp);
            self.prev_timestamp = timestamp;
            self.info.changeset.push(info.changeset - self.prev_changeset);
            self.prev_changeset = info.changeset;
            self.info.uid.push(info.uid - self.prev_uid);
            self.prev_uid = info.uid;
            let sid = self.table.add(&info.username);
            self.info.user_sid.push(sid - self.prev_sid);
            self.prev_sid = sid;
            self.info.visible.push(info.visible);
        }

        for (key, value) in &node.tags {
            self.dense.keys_vals.push(self.table.add(key));
            self.dense.keys_vals.push(self.table.add(value));
        }
        self.dense.keys_vals.push(0);

        self.estimate += NODE_ENTRY_SIZE + node.tags.len() * TAG_ENTRY_SIZE;
        Ok(())
    }

    pub fn estimated_size(&self) -> usize {
        self.estimate + self.table.byte_size()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.dense.id.is_empty()
    }

    /// Serializes the accumulated nodes into a `PrimitiveBlock` payload.
    /// The encoder is unusable afterwards.
    pub fn write(&mut self) -> Result<Vec<u8>> {
        self.ensure_live()?;
        self.consumed = true;

        self.seal_group();
        write_block(&mut self.table, mem::take(&mut self.groups))
    }

    /// Closes the dense group under construction and resets every delta
    /// chain; the `denseinfo` arrays are attached only to info-bearing
    /// groups.
    fn seal_group(&mut self) {
        if self.dense.id.is_empty() {
            return;
        }
        let mut dense = mem::take(&mut self.dense);
        if self.group_has_info {
            dense.set_denseinfo(mem::take(&mut self.info));
        }
        let mut group = osmformat::PrimitiveGroup::new();
        group.set_dense(dense);
        self.groups.push(group);

        self.prev_id = 0;
        self.prev_lat = 0;
        self.prev_lon = 0;
        self.prev_timestamp = 0;
        self.prev_changeset = 0;
        self.prev_uid = 0;
        self.prev_sid = 0;
    }

    fn ensure_live(&self) -> Result<()> {
        if self.consumed {
            Err(PbfError::EncoderConsumed)
        } else {
            Ok(())
        }
    }
}

impl Default for DenseNodeEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates nodes as plain (non-dense) node groups.
pub struct NodeEncoder {
    table: StringTableBuilder,
    codec: FieldCodec,
    nodes: Vec<osmformat::Node>,
    estimate: usize,
    consumed: bool,
}

impl NodeEncoder {
    pub fn new() -> Self {
        Self {
            table: StringTableBuilder::new(),
            codec: FieldCodec::new(DEFAULT_GRANULARITY, DEFAULT_DATE_GRANULARITY),
            nodes: Vec::new(),
            estimate: 0,
            consumed: false,
        }
    }

    pub fn append(&mut self, node: &Node) -> Result<()> {
        self.ensure_live()?;

        let mut encoded = osmformat::Node::new();
        encoded.set_id(node.id);
        encoded.set_lat(self.codec.encode_latitude(node.lat));
        encoded.set_lon(self.codec.encode_longitude(node.lon));
        let (keys, vals) = encode_tags(&mut self.table, &node.tags);
        encoded.set_keys(keys);
        encoded.set_vals(vals);
        if let Some(info) = &node.info {
            encoded.set_info(encode_info(&mut self.table, &self.codec, info));
        }
        self.nodes.push(encoded);

        self.estimate += NODE_ENTRY_SIZE + node.tags.len() * TAG_ENTRY_SIZE;
        Ok(())
    }

    pub fn estimated_size(&self) -> usize {
        self.estimate + self.table.byte_size()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn write(&mut self) -> Result<Vec<u8>> {
        self.ensure_live()?;
        self.consumed = true;

        let mut group = osmformat::PrimitiveGroup::new();
        group.set_nodes(RepeatedField::from_vec(mem::take(&mut self.nodes)));
        write_block(&mut self.table, vec![group])
    }

    fn ensure_live(&self) -> Result<()> {
        if self.consumed {
            Err(PbfError::EncoderConsumed)
        } else {
            Ok(())
        }
    }
}

impl Default for NodeEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates ways, delta-coding their node references.
pub struct WayEncoder {
    table: StringTableBuilder,
    codec: FieldCodec,
    ways: Vec<osmformat::Way>,
    estimate: usize,
    consumed: bool,
}

impl WayEncoder {
    pub fn new() -> Self {
        Self {
            table: StringTableBuilder::new(),
            codec: FieldCodec::new(DEFAULT_GRANULARITY, DEFAULT_DATE_GRANULARITY),
            ways: Vec::new(),
            estimate: 0,
            consumed: false,
        }
    }

    pub fn append(&mut self, way: &Way) -> Result<()> {
        self.ensure_live()?;

        let mut encoded = osmformat::Way::new();
        encoded.set_id(way.id);

        let mut prev_ref = 0;
        encoded.set_refs(
            way.nodes
                .iter()
                .map(|&node_id| {
                    let delta = node_id - prev_ref;
                    prev_ref = node_id;
                    delta
                })
                .collect(),
        );

        let (keys, vals) = encode_tags(&mut self.table, &way.tags);
        encoded.set_keys(keys);
        encoded.set_vals(vals);
        if let Some(info) = &way.info {
            encoded.set_info(encode_info(&mut self.table, &self.codec, info));
        }
        self.ways.push(encoded);

        self.estimate +=
            WAY_ENTRY_SIZE + way.nodes.len() * REF_ENTRY_SIZE + way.tags.len() * TAG_ENTRY_SIZE;
        Ok(())
    }

    pub fn estimated_size(&self) -> usize {
        self.estimate + self.table.byte_size()
    }

    pub fn is_empty(&self) -> bool {
        self.ways.is_empty()
    }

    pub fn write(&mut self) -> Result<Vec<u8>> {
        self.ensure_live()?;
        self.consumed = true;

        let mut group = osmformat::PrimitiveGroup::new();
        group.set_ways(RepeatedField::from_vec(mem::take(&mut self.ways)));
        write_block(&mut self.table, vec![group])
    }

    fn ensure_live(&self) -> Result<()> {
        if self.consumed {
            Err(PbfError::EncoderConsumed)
        } else {
            Ok(())
        }
    }
}

impl Default for WayEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Accumulates relations, delta-coding their member ids.
pub struct RelationEncoder {
    table: StringTableBuilder,
    codec: FieldCodec,
    relations: Vec<osmformat::Relation>,
    estimate: usize,
    consumed: bool,
}

impl RelationEncoder {
    pub fn new() -> Self {
        Self {
            table: StringTableBuilder::new(),
            codec: FieldCodec::new(DEFAULT_GRANULARITY, DEFAULT_DATE_GRANULARITY),
            relations: Vec::new(),
            estimate: 0,
            consumed: false,
        }
    }

    pub fn append(&mut self, relation: &Relation) -> Result<()> {
        self.ensure_live()?;

        let mut encoded = osmformat::Relation::new();
        encoded.set_id(relation.id);

        let mut prev_member_id = 0;
        for member in &relation.members {
            encoded.memids.push(member.member_id - prev_member_id);
            prev_member_id = member.member_id;
            encoded.roles_sid.push(self.table.add(&member.role));
            encoded.types.push(match member.member_type {
                ElementType::Node => Relation_MemberType::NODE,
                ElementType::Way => Relation_MemberType::WAY,
                ElementType::Relation => Relation_MemberType::RELATION,
            });
        }

        let (keys, vals) = encode_tags(&mut self.table, &relation.tags);
        encoded.set_keys(keys);
        encoded.set_vals(vals);
        if let Some(info) = &relation.info {
            encoded.set_info(encode_info(&mut self.table, &self.codec, info));
        }
        self.relations.push(encoded);

        self.estimate += WAY_ENTRY_SIZE
            + relation.members.len() * MEMBER_ENTRY_SIZE
            + relation.tags.len() * TAG_ENTRY_SIZE;
        Ok(())
    }

    pub fn estimated_size(&self) -> usize {
        self.estimate + self.table.byte_size()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }

    pub fn write(&mut self) -> Result<Vec<u8>> {
        self.ensure_live()?;
        self.consumed = true;

        let mut group = osmformat::PrimitiveGroup::new();
        group.set_relations(RepeatedField::from_vec(mem::take(&mut self.relations)));
        write_block(&mut self.table, vec![group])
    }

    fn ensure_live(&self) -> Result<()> {
        if self.consumed {
            Err(PbfError::EncoderConsumed)
        } else {
            Ok(())
        }
    }
}

impl Default for RelationEncoder {
    fn default() -> Self {
        Self::new()
    }
}
