use std::fs::File;
use std::io::{BufWriter, Write};
use std::mem;
use std::path::Path;

use byteorder::{self, WriteBytesExt};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use protobuf::Message;

use crate::codecs::block_builder::{
    DenseNodeEncoder, NodeEncoder, RelationEncoder, WayEncoder,
};
use crate::codecs::field::NANOS_PER_DEGREE;
use crate::error::{PbfError, Result};
use crate::models::{BoundBox, Element, Node};
use crate::proto::{fileformat, osmformat};

/// Estimated block size at which a pending encoder is flushed to a blob.
const SOFT_BLOCK_LIMIT: usize = 15 * 1024 * 1024;

/// Upper bound for a single uncompressed block payload, kept comfortably
/// under the 32 MiB blob cap.
const HARD_BLOCK_LIMIT: usize = 16 * 1024 * 1024;

/// Buffers nodes in either dense or plain format, depending on how the
/// writer was configured.
enum NodeBuffer {
    Dense(DenseNodeEncoder),
    Plain(NodeEncoder),
}

impl NodeBuffer {
    fn new(use_dense: bool) -> Self {
        if use_dense {
            NodeBuffer::Dense(DenseNodeEncoder::new())
        } else {
            NodeBuffer::Plain(NodeEncoder::new())
        }
    }

    fn append(&mut self, node: &Node) -> Result<()> {
        match self {
            NodeBuffer::Dense(encoder) => encoder.append(node),
            NodeBuffer::Plain(encoder) => encoder.append(node),
        }
    }

    fn estimated_size(&self) -> usize {
        match self {
            NodeBuffer::Dense(encoder) => encoder.estimated_size(),
            NodeBuffer::Plain(encoder) => encoder.estimated_size(),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            NodeBuffer::Dense(encoder) => encoder.is_empty(),
            NodeBuffer::Plain(encoder) => encoder.is_empty(),
        }
    }

    fn write(&mut self) -> Result<Vec<u8>> {
        match self {
            NodeBuffer::Dense(encoder) => encoder.write(),
            NodeBuffer::Plain(encoder) => encoder.write(),
        }
    }
}

/// A writer for creating OSM PBF streams.
///
/// Elements accumulate in per-kind block encoders; an encoder is flushed to
/// a zlib-compressed `OSMData` blob once its estimated size crosses the soft
/// cap, and the `OSMHeader` blob is emitted lazily before the first data
/// blob. Call [`finish`](PbfWriter::finish) to flush everything out.
///
/// Per the PBF convention, elements should be written in Node, Way, Relation
/// order with ascending ids within each kind; the writer emits blocks in the
/// order its buffers fill and leaves that ordering to the caller.
///
/// # Example
///
/// ```no_run
/// use pbf_parallel::models::{Element, Node};
/// use pbf_parallel::writers::PbfWriter;
///
/// let mut writer = PbfWriter::from_path("output.osm.pbf", true).unwrap();
/// writer.write(Element::Node(Node::default())).unwrap();
/// writer.finish().unwrap();
/// ```
pub struct PbfWriter<W: Write> {
    writer: W,
    use_dense: bool,
    bbox: Option<BoundBox>,
    nodes: NodeBuffer,
    ways: WayEncoder,
    relations: RelationEncoder,
    flush_limit: usize,
    has_written_header: bool,
}

impl PbfWriter<BufWriter<File>> {
    /// Creates a writer over a new file. `use_dense` selects the dense
    /// node representation, which is what virtually every consumer expects.
    pub fn from_path<P: AsRef<Path>>(path: P, use_dense: bool) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file), use_dense))
    }
}

impl<W: Write> PbfWriter<W> {
    pub fn new(writer: W, use_dense: bool) -> PbfWriter<W> {
        Self {
            writer,
            use_dense,
            bbox: None,
            nodes: NodeBuffer::new(use_dense),
            ways: WayEncoder::new(),
            relations: RelationEncoder::new(),
            flush_limit: SOFT_BLOCK_LIMIT,
            has_written_header: false,
        }
    }

    /// Lowers the block flush threshold. Clamped to the hard block cap.
    pub fn with_flush_limit(mut self, limit: usize) -> Self {
        self.flush_limit = limit.min(HARD_BLOCK_LIMIT);
        self
    }

    /// Sets the bounding box recorded in the header. Must happen before the
    /// first element is written, since the header blob precedes all data.
    pub fn set_bbox(&mut self, bbox: BoundBox) {
        self.bbox = Some(bbox);
    }

    /// Buffers an element, flushing its block once the estimate crosses the
    /// flush threshold.
    pub fn write(&mut self, element: Element) -> Result<()> {
        match element {
            Element::Node(node) => {
                self.nodes.append(&node)?;
                if self.nodes.estimated_size() >= self.flush_limit {
                    self.flush_nodes()?;
                }
            }
            Element::Way(way) => {
                self.ways.append(&way)?;
                if self.ways.estimated_size() >= self.flush_limit {
                    self.flush_ways()?;
                }
            }
            Element::Relation(relation) => {
                self.relations.append(&relation)?;
                if self.relations.estimated_size() >= self.flush_limit {
                    self.flush_relations()?;
                }
            }
        }
        Ok(())
    }

    /// Forces all buffered elements out as blocks, nodes first.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_nodes()?;
        self.flush_ways()?;
        self.flush_relations()
    }

    /// Flushes everything, emits the header even for an element-free
    /// stream, and flushes the underlying writer.
    pub fn finish(&mut self) -> Result<()> {
        self.flush()?;
        if !self.has_written_header {
            self.write_header()?;
        }
        self.writer.flush()?;
        Ok(())
    }

    fn flush_nodes(&mut self) -> Result<()> {
        if self.nodes.is_empty() {
            return Ok(());
        }
        let mut encoder = mem::replace(&mut self.nodes, NodeBuffer::new(self.use_dense));
        let payload = encoder.write()?;
        self.write_data_blob(payload)
    }

    fn flush_ways(&mut self) -> Result<()> {
        if self.ways.is_empty() {
            return Ok(());
        }
        let mut encoder = mem::replace(&mut self.ways, WayEncoder::new());
        let payload = encoder.write()?;
        self.write_data_blob(payload)
    }

    fn flush_relations(&mut self) -> Result<()> {
        if self.relations.is_empty() {
            return Ok(());
        }
        let mut encoder = mem::replace(&mut self.relations, RelationEncoder::new());
        let payload = encoder.write()?;
        self.write_data_blob(payload)
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header_block = osmformat::HeaderBlock::new();
        header_block
            .required_features
            .push("OsmSchema-V0.6".to_owned());
        if self.use_dense {
            header_block.required_features.push("DenseNodes".to_owned());
        }
        header_block.set_writingprogram(concat!("pbf-parallel/", env!("CARGO_PKG_VERSION")).to_owned());

        if let Some(bbox) = &self.bbox {
            let mut header_bbox = osmformat::HeaderBBox::new();
            header_bbox.set_left((bbox.left * NANOS_PER_DEGREE).round() as i64);
            header_bbox.set_right((bbox.right * NANOS_PER_DEGREE).round() as i64);
            header_bbox.set_top((bbox.top * NANOS_PER_DEGREE).round() as i64);
            header_bbox.set_bottom((bbox.bottom * NANOS_PER_DEGREE).round() as i64);
            header_block.set_bbox(header_bbox);
        }

        let payload = header_block.write_to_bytes().map_err(|err| {
            PbfError::MalformedBlock(format!("header serialization failed: {}", err))
        })?;
        let blob = self.build_blob(payload)?;
        self.write_blob(blob, "OSMHeader")?;
        self.has_written_header = true;
        Ok(())
    }

    fn write_data_blob(&mut self, payload: Vec<u8>) -> Result<()> {
        if !self.has_written_header {
            self.write_header()?;
        }
        let blob = self.build_blob(payload)?;
        self.write_blob(blob, "OSMData")
    }

    fn build_blob(&mut self, payload: Vec<u8>) -> Result<fileformat::Blob> {
        let raw_size = payload.len();
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&payload)?;
        let compressed = encoder.finish()?;

        let mut blob = fileformat::Blob::new();
        blob.set_zlib_data(compressed);
        blob.set_raw_size(raw_size as i32);
        Ok(blob)
    }

    fn write_blob(&mut self, blob: fileformat::Blob, blob_type: &str) -> Result<()> {
        let blob_bytes = blob.write_to_bytes().map_err(|err| {
            PbfError::MalformedBlock(format!("blob serialization failed: {}", err))
        })?;

        let mut header = fileformat::BlobHeader::new();
        header.set_field_type(blob_type.to_owned());
        header.set_datasize(blob_bytes.len() as i32);
        let header_bytes = header.write_to_bytes().map_err(|err| {
            PbfError::MalformedBlock(format!("blob header serialization failed: {}", err))
        })?;

        self.writer
            .write_u32::<byteorder::BigEndian>(header_bytes.len() as u32)?;
        self.writer.write_all(&header_bytes)?;
        self.writer.write_all(&blob_bytes)?;

        Ok(())
    }
}
