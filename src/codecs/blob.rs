use std::io::{self, Read};

use byteorder::{self, ReadBytesExt};
use flate2::read::ZlibDecoder;
use protobuf::Message;

use crate::error::{PbfError, Result};
use crate::proto::fileformat::{Blob, BlobHeader};

/// Largest `BlobHeader` message the framer accepts.
pub const MAX_BLOB_HEADER_SIZE: u64 = 64 * 1024;

/// Largest blob payload, compressed or inflated, the codecs accept.
pub const MAX_BLOB_SIZE: usize = 32 * 1024 * 1024;

/// Type and size of the next blob in the stream, read ahead of its payload
/// so the scheduler can decide to read or skip it.
#[derive(Debug, Clone)]
pub struct BlobInfo {
    pub blob_type: String,
    pub datasize: usize,
}

/// Sequential reader over the outer `BlobHeader`/`Blob` framing of an OSM
/// PBF stream.
///
/// The framer is two-phase: [`next_header`](BlobReader::next_header) consumes
/// the length prefix and the `BlobHeader`, after which the caller either
/// reads the payload or discards it without buffering.
pub struct BlobReader<R: Read + Send> {
    reader: R,
    pub offset: u64,
}

impl<R: Read + Send> BlobReader<R> {
    pub fn new(reader: R) -> BlobReader<R> {
        Self { reader, offset: 0 }
    }

    /// Reads the next frame header. Returns `Ok(None)` on a clean end of
    /// stream at the length prefix.
    pub fn next_header(&mut self) -> Result<Option<BlobInfo>> {
        let header_size = match self.reader.read_u32::<byteorder::BigEndian>() {
            Ok(n) => n as u64,
            Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        self.offset += 4;

        if header_size > MAX_BLOB_HEADER_SIZE {
            return Err(PbfError::MalformedFrame(format!(
                "blob header of {} bytes exceeds the {} byte limit",
                header_size, MAX_BLOB_HEADER_SIZE
            )));
        }

        let mut buf = vec![0u8; header_size as usize];
        self.reader
            .read_exact(&mut buf)
            .map_err(|err| PbfError::MalformedFrame(format!("truncated blob header: {}", err)))?;
        let header: BlobHeader = Message::parse_from_bytes(&buf)
            .map_err(|err| PbfError::MalformedFrame(format!("invalid blob header: {}", err)))?;
        self.offset += header_size;

        let datasize = header.get_datasize();
        if datasize < 0 || datasize as usize > MAX_BLOB_SIZE {
            return Err(PbfError::MalformedFrame(format!(
                "blob of {} bytes exceeds the {} byte limit",
                datasize, MAX_BLOB_SIZE
            )));
        }

        Ok(Some(BlobInfo {
            blob_type: header.get_field_type().to_owned(),
            datasize: datasize as usize,
        }))
    }

    /// Reads the payload announced by the last [`next_header`] call.
    ///
    /// [`next_header`]: BlobReader::next_header
    pub fn read_payload(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; size];
        self.reader
            .read_exact(&mut bytes)
            .map_err(|err| PbfError::MalformedFrame(format!("truncated blob payload: {}", err)))?;
        self.offset += size as u64;
        Ok(bytes)
    }

    /// Discards the payload announced by the last [`next_header`] call
    /// without allocating for it. Used to bypass non-owned shards.
    ///
    /// [`next_header`]: BlobReader::next_header
    pub fn skip_payload(&mut self, size: usize) -> Result<()> {
        let copied = io::copy(&mut self.reader.by_ref().take(size as u64), &mut io::sink())?;
        if copied < size as u64 {
            return Err(PbfError::MalformedFrame(format!(
                "truncated blob payload: expected {} bytes, stream ended after {}",
                size, copied
            )));
        }
        self.offset += size as u64;
        Ok(())
    }
}

/// Unpacks a `Blob` message into its uncompressed payload bytes.
///
/// Only `raw` and `zlib_data` blobs are supported; zlib blobs must declare
/// their inflated size through `raw_size` and are verified against it.
pub fn decode_blob_payload(raw_blob: &[u8]) -> Result<Vec<u8>> {
    let blob: Blob = Message::parse_from_bytes(raw_blob)
        .map_err(|err| PbfError::MalformedBlock(format!("invalid blob message: {}", err)))?;

    if blob.has_raw() {
        let raw = blob.get_raw();
        if raw.len() > MAX_BLOB_SIZE {
            return Err(PbfError::MalformedBlock(format!(
                "raw payload of {} bytes exceeds the {} byte limit",
                raw.len(),
                MAX_BLOB_SIZE
            )));
        }
        Ok(raw.to_vec())
    } else if blob.has_zlib_data() {
        if !blob.has_raw_size() {
            return Err(PbfError::DecompressionFailed(
                "zlib blob does not declare its uncompressed size".to_owned(),
            ));
        }
        let raw_size = blob.get_raw_size();
        if raw_size < 0 || raw_size as usize > MAX_BLOB_SIZE {
            return Err(PbfError::MalformedBlock(format!(
                "declared payload of {} bytes exceeds the {} byte limit",
                raw_size, MAX_BLOB_SIZE
            )));
        }
        let decoder = ZlibDecoder::new(blob.get_zlib_data());
        let mut bytes = Vec::with_capacity(raw_size as usize);
        decoder
            .take(raw_size as u64 + 1)
            .read_to_end(&mut bytes)
            .map_err(|err| PbfError::DecompressionFailed(format!("inflate failed: {}", err)))?;
        if bytes.len() != raw_size as usize {
            return Err(PbfError::DecompressionFailed(format!(
                "inflated to {} bytes, blob declares {}",
                bytes.len(),
                raw_size
            )));
        }
        Ok(bytes)
    } else if blob.has_lzma_data() {
        Err(PbfError::UnsupportedCompression("lzma"))
    } else if blob.has_OBSOLETE_bzip2_data() {
        Err(PbfError::UnsupportedCompression("bzip2"))
    } else if blob.has_lz4_data() {
        Err(PbfError::UnsupportedCompression("lz4"))
    } else if blob.has_zstd_data() {
        Err(PbfError::UnsupportedCompression("zstd"))
    } else {
        // A blob without any payload field, e.g. datasize = 0, is an empty
        // block.
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use byteorder::WriteBytesExt;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    use super::*;

    const TEST_STRING: &[u8] = b"TestString";

    fn frame(blob_type: &str, blob: &Blob) -> Vec<u8> {
        let blob_bytes = blob.write_to_bytes().unwrap();
        let mut header = BlobHeader::new();
        header.set_field_type(blob_type.to_owned());
        header.set_datasize(blob_bytes.len() as i32);
        let header_bytes = header.write_to_bytes().unwrap();

        let mut stream = Vec::new();
        stream
            .write_u32::<byteorder::BigEndian>(header_bytes.len() as u32)
            .unwrap();
        stream.write_all(&header_bytes).unwrap();
        stream.write_all(&blob_bytes).unwrap();
        stream
    }

    fn deflate(content: &[u8]) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(content).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn raw_blob_round_trip() {
        let mut blob = Blob::new();
        blob.set_raw(TEST_STRING.to_vec());
        let stream = frame("OSMData", &blob);

        let mut reader = BlobReader::new(stream.as_slice());
        let info = reader.next_header().unwrap().unwrap();
        assert_eq!("OSMData", info.blob_type);
        let payload = reader.read_payload(info.datasize).unwrap();
        assert_eq!(TEST_STRING, decode_blob_payload(&payload).unwrap().as_slice());
        assert!(reader.next_header().unwrap().is_none());
    }

    #[test]
    fn zlib_blob_round_trip() {
        let mut blob = Blob::new();
        blob.set_raw_size(TEST_STRING.len() as i32);
        blob.set_zlib_data(deflate(TEST_STRING));

        let decoded = decode_blob_payload(&blob.write_to_bytes().unwrap()).unwrap();
        assert_eq!(TEST_STRING, decoded.as_slice());
    }

    #[test]
    fn zlib_blob_with_wrong_raw_size() {
        let mut blob = Blob::new();
        blob.set_raw_size(9000);
        blob.set_zlib_data(deflate(TEST_STRING));

        let err = decode_blob_payload(&blob.write_to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, PbfError::DecompressionFailed(_)));
    }

    #[test]
    fn zlib_blob_with_invalid_data() {
        let mut blob = Blob::new();
        blob.set_raw_size(1);
        blob.set_zlib_data(b"test".to_vec());

        let err = decode_blob_payload(&blob.write_to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, PbfError::DecompressionFailed(_)));
    }

    #[test]
    fn zlib_blob_without_raw_size() {
        let mut blob = Blob::new();
        blob.set_zlib_data(deflate(TEST_STRING));

        let err = decode_blob_payload(&blob.write_to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, PbfError::DecompressionFailed(_)));
    }

    #[test]
    fn bzip2_blob_is_rejected() {
        let mut blob = Blob::new();
        blob.set_raw_size(9000);
        blob.set_OBSOLETE_bzip2_data(Vec::new());

        let err = decode_blob_payload(&blob.write_to_bytes().unwrap()).unwrap_err();
        assert!(matches!(err, PbfError::UnsupportedCompression("bzip2")));
    }

    #[test]
    fn unparseable_blob_is_rejected() {
        let err = decode_blob_payload(b"fail").unwrap_err();
        assert!(matches!(err, PbfError::MalformedBlock(_)));
    }

    #[test]
    fn payloadless_blob_decodes_to_empty_bytes() {
        let blob = Blob::new();
        let decoded = decode_blob_payload(&blob.write_to_bytes().unwrap()).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn empty_stream_terminates_cleanly() {
        let mut reader = BlobReader::new(&[][..]);
        assert!(reader.next_header().unwrap().is_none());
    }

    #[test]
    fn oversize_header_is_rejected() {
        let mut stream = Vec::new();
        stream
            .write_u32::<byteorder::BigEndian>(MAX_BLOB_HEADER_SIZE as u32 + 1)
            .unwrap();

        let mut reader = BlobReader::new(stream.as_slice());
        let err = reader.next_header().unwrap_err();
        assert!(matches!(err, PbfError::MalformedFrame(_)));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let mut blob = Blob::new();
        blob.set_raw(TEST_STRING.to_vec());
        let mut stream = frame("OSMData", &blob);
        stream.truncate(stream.len() - 3);

        let mut reader = BlobReader::new(stream.as_slice());
        let info = reader.next_header().unwrap().unwrap();
        let err = reader.read_payload(info.datasize).unwrap_err();
        assert!(matches!(err, PbfError::MalformedFrame(_)));
    }

    #[test]
    fn skip_payload_advances_to_next_frame() {
        let mut first = Blob::new();
        first.set_raw(TEST_STRING.to_vec());
        let mut second = Blob::new();
        second.set_raw(b"second".to_vec());

        let mut stream = frame("OSMData", &first);
        stream.extend(frame("OSMData", &second));

        let mut reader = BlobReader::new(stream.as_slice());
        let info = reader.next_header().unwrap().unwrap();
        reader.skip_payload(info.datasize).unwrap();
        let info = reader.next_header().unwrap().unwrap();
        let payload = reader.read_payload(info.datasize).unwrap();
        assert_eq!(b"second", decode_blob_payload(&payload).unwrap().as_slice());
    }
}
