use std::collections::HashMap;

use super::field::{FieldCodec, NANOS_PER_DEGREE};
use crate::error::{PbfError, Result};
use crate::models::{BoundBox, ElementType, Header, Info, Node, Relation, RelationMember, Way};
use crate::proto::osmformat;
use crate::proto::osmformat::Relation_MemberType;

fn table_index(raw: i64) -> Result<usize> {
    usize::try_from(raw)
        .map_err(|_| PbfError::MalformedBlock(format!("negative string index {}", raw)))
}

/// Reader over a decoded `OSMHeader` block.
pub struct HeaderReader {
    header: osmformat::HeaderBlock,
}

impl HeaderReader {
    pub fn new(header: osmformat::HeaderBlock) -> Self {
        Self { header }
    }

    /// Extracts the header metadata. Feature lists are surfaced verbatim;
    /// the bounding box is only converted when `decode_bbox` is set, so
    /// callers without a bounding box sink skip that work.
    pub fn read(&self, decode_bbox: bool) -> Header {
        let bbox = if decode_bbox && self.header.has_bbox() {
            let raw = self.header.get_bbox();
            Some(BoundBox {
                left: raw.get_left() as f64 / NANOS_PER_DEGREE,
                right: raw.get_right() as f64 / NANOS_PER_DEGREE,
                top: raw.get_top() as f64 / NANOS_PER_DEGREE,
                bottom: raw.get_bottom() as f64 / NANOS_PER_DEGREE,
            })
        } else {
            None
        };

        Header {
            required_features: self.header.get_required_features().to_vec(),
            optional_features: self.header.get_optional_features().to_vec(),
            writing_program: self
                .header
                .has_writingprogram()
                .then(|| self.header.get_writingprogram().to_owned()),
            source: self
                .header
                .has_source()
                .then(|| self.header.get_source().to_owned()),
            replication_timestamp: self
                .header
                .has_osmosis_replication_timestamp()
                .then(|| self.header.get_osmosis_replication_timestamp()),
            replication_sequence_number: self
                .header
                .has_osmosis_replication_sequence_number()
                .then(|| self.header.get_osmosis_replication_sequence_number()),
            replication_base_url: self
                .header
                .has_osmosis_replication_base_url()
                .then(|| self.header.get_osmosis_replication_base_url().to_owned()),
            bbox,
        }
    }
}

/// Reader over a decoded `OSMData` primitive block.
///
/// Owns the block and its [`FieldCodec`]; the per-kind parsers stream
/// entities into a caller closure in the order they appear in the group.
pub struct PrimitiveReader {
    block: osmformat::PrimitiveBlock,
    codec: FieldCodec,
}

impl PrimitiveReader {
    pub fn new(block: osmformat::PrimitiveBlock) -> Self {
        Self {
            codec: FieldCodec::new_with_block(&block),
            block,
        }
    }

    pub fn block(&self) -> &osmformat::PrimitiveBlock {
        &self.block
    }

    pub fn process_dense(
        &self,
        dense: &osmformat::DenseNodes,
        mut emit: impl FnMut(Node),
    ) -> Result<()> {
        let ids = dense.get_id();
        let lats = dense.get_lat();
        let lons = dense.get_lon();
        if ids.len() != lats.len() || ids.len() != lons.len() {
            return Err(PbfError::MalformedBlock(format!(
                "dense node arrays disagree: {} ids, {} lats, {} lons",
                ids.len(),
                lats.len(),
                lons.len()
            )));
        }

        let mut infos = if dense.has_denseinfo() {
            Some(DenseInfoDecoder::new(dense.get_denseinfo(), ids.len())?)
        } else {
            None
        };

        let mut keys_vals = dense.get_keys_vals().iter();
        let mut id: i64 = 0;
        let mut lat: i64 = 0;
        let mut lon: i64 = 0;
        for index in 0..ids.len() {
            id += ids[index];
            lat += lats[index];
            lon += lons[index];

            let tags = self.take_dense_tags(&mut keys_vals)?;
            let info = match infos.as_mut() {
                Some(decoder) => Some(decoder.next_info(&self.codec)?),
                None => None,
            };

            emit(Node {
                id,
                tags,
                info,
                lat: self.codec.decode_latitude(lat),
                lon: self.codec.decode_longitude(lon),
            });
        }
        Ok(())
    }

    pub fn process_nodes(
        &self,
        nodes: &[osmformat::Node],
        mut emit: impl FnMut(Node),
    ) -> Result<()> {
        for elm in nodes {
            emit(Node {
                id: elm.get_id(),
                tags: self.process_tags(elm.get_keys(), elm.get_vals())?,
                info: self.parse_info(elm.has_info(), elm.get_info())?,
                lat: self.codec.decode_latitude(elm.get_lat()),
                lon: self.codec.decode_longitude(elm.get_lon()),
            });
        }
        Ok(())
    }

    pub fn process_ways(&self, ways: &[osmformat::Way], mut emit: impl FnMut(Way)) -> Result<()> {
        for elm in ways {
            let mut node_id: i64 = 0;
            let nodes = elm
                .get_refs()
                .iter()
                .map(|delta| {
                    node_id += delta;
                    node_id
                })
                .collect();

            emit(Way {
                id: elm.get_id(),
                tags: self.process_tags(elm.get_keys(), elm.get_vals())?,
                info: self.parse_info(elm.has_info(), elm.get_info())?,
                nodes,
            });
        }
        Ok(())
    }

    pub fn process_relations(
        &self,
        relations: &[osmformat::Relation],
        mut emit: impl FnMut(Relation),
    ) -> Result<()> {
        for elm in relations {
            let member_ids = elm.get_memids();
            let roles = elm.get_roles_sid();
            let types = elm.get_types();
            if member_ids.len() != roles.len() || member_ids.len() != types.len() {
                return Err(PbfError::MalformedBlock(format!(
                    "relation {} member arrays disagree: {} ids, {} roles, {} types",
                    elm.get_id(),
                    member_ids.len(),
                    roles.len(),
                    types.len()
                )));
            }

            let mut members = Vec::with_capacity(member_ids.len());
            let mut member_id: i64 = 0;
            for index in 0..member_ids.len() {
                member_id += member_ids[index];
                let member_type = match types[index] {
                    Relation_MemberType::NODE => ElementType::Node,
                    Relation_MemberType::WAY => ElementType::Way,
                    Relation_MemberType::RELATION => ElementType::Relation,
                };
                members.push(RelationMember {
                    member_id,
                    member_type,
                    role: self.codec.string_at(table_index(roles[index] as i64)?)?.to_owned(),
                });
            }

            emit(Relation {
                id: elm.get_id(),
                tags: self.process_tags(elm.get_keys(), elm.get_vals())?,
                info: self.parse_info(elm.has_info(), elm.get_info())?,
                members,
            });
        }
        Ok(())
    }

    pub fn process_changesets(
        &self,
        changesets: &[osmformat::ChangeSet],
        mut emit: impl FnMut(i64),
    ) {
        for changeset in changesets {
            emit(changeset.get_id());
        }
    }

    fn process_tags(&self, keys: &[u32], vals: &[u32]) -> Result<HashMap<String, String>> {
        if keys.len() != vals.len() {
            return Err(PbfError::MalformedBlock(format!(
                "tag arrays disagree: {} keys, {} values",
                keys.len(),
                vals.len()
            )));
        }
        let mut tags = HashMap::with_capacity(keys.len());
        for index in 0..keys.len() {
            let key = self.codec.string_at(keys[index] as usize)?;
            let value = self.codec.string_at(vals[index] as usize)?;
            tags.insert(key.to_owned(), value.to_owned());
        }
        Ok(tags)
    }

    /// Consumes one node's worth of the dense `keys_vals` stream, up to and
    /// including its 0 sentinel. An empty stream means no node has tags.
    fn take_dense_tags(
        &self,
        keys_vals: &mut std::slice::Iter<'_, i32>,
    ) -> Result<HashMap<String, String>> {
        let mut tags = HashMap::new();
        loop {
            let key_index = match keys_vals.next() {
                None | Some(0) => break,
                Some(&key_index) => key_index,
            };
            let value_index = match keys_vals.next() {
                None => {
                    return Err(PbfError::MalformedBlock(
                        "dense keys_vals stream ends with a key lacking its value".to_owned(),
                    ))
                }
                Some(&value_index) => value_index,
            };
            let key = self.codec.string_at(table_index(key_index as i64)?)?;
            let value = self.codec.string_at(table_index(value_index as i64)?)?;
            tags.insert(key.to_owned(), value.to_owned());
        }
        Ok(tags)
    }

    fn parse_info(&self, has_info: bool, info: &osmformat::Info) -> Result<Option<Info>> {
        if !has_info {
            return Ok(None);
        }
        let timestamp = if info.has_timestamp() {
            Some(self.codec.decode_timestamp(info.get_timestamp())?)
        } else {
            None
        };
        Ok(Some(Info {
            version: info.get_version(),
            timestamp,
            changeset: info.get_changeset(),
            uid: info.get_uid(),
            username: self
                .codec
                .string_at(info.get_user_sid() as usize)?
                .to_owned(),
            visible: !info.has_visible() || info.get_visible(),
        }))
    }
}

/// Walks the parallel `DenseInfo` arrays. Every delta chain runs
/// independently from zero; `visible` is direct and defaults to true.
struct DenseInfoDecoder<'a> {
    info: &'a osmformat::DenseInfo,
    index: usize,
    timestamp: i64,
    changeset: i64,
    uid: i32,
    user_sid: i32,
}

impl<'a> DenseInfoDecoder<'a> {
    fn new(info: &'a osmformat::DenseInfo, count: usize) -> Result<Self> {
        let lengths = [
            info.get_version().len(),
            info.get_timestamp().len(),
            info.get_changeset().len(),
            info.get_uid().len(),
            info.get_user_sid().len(),
        ];
        if lengths.iter().any(|&len| len != count) {
            return Err(PbfError::MalformedBlock(format!(
                "dense info arrays disagree with {} nodes: \
                 {} versions, {} timestamps, {} changesets, {} uids, {} user sids",
                count, lengths[0], lengths[1], lengths[2], lengths[3], lengths[4]
            )));
        }
        Ok(Self {
            info,
            index: 0,
            timestamp: 0,
            changeset: 0,
            uid: 0,
            user_sid: 0,
        })
    }

    fn next_info(&mut self, codec: &FieldCodec) -> Result<Info> {
        let index = self.index;
        self.index += 1;

        self.timestamp += self.info.get_timestamp()[index];
        self.changeset += self.info.get_changeset()[index];
        self.uid += self.info.get_uid()[index];
        self.user_sid += self.info.get_user_sid()[index];

        Ok(Info {
            version: self.info.get_version()[index],
            timestamp: Some(codec.decode_timestamp(self.timestamp)?),
            changeset: self.changeset,
            uid: self.uid,
            username: codec.string_at(table_index(self.user_sid as i64)?)?.to_owned(),
            visible: self.info.get_visible().get(index).copied().unwrap_or(true),
        })
    }
}
