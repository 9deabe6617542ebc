use thiserror::Error;

/// Errors surfaced by the readers, codecs and writers of this crate.
///
/// A clean end of stream is not an error: the blob framer reports it as an
/// exhausted sequence and `parse()` treats it as normal completion. Likewise
/// an `OSMData` blob arriving before the `OSMHeader` blob is logged and
/// skipped rather than surfaced.
#[derive(Debug, Error)]
pub enum PbfError {
    /// Oversize length prefix, oversize blob, or a truncated/unparseable
    /// frame in the outer blob stream.
    #[error("malformed blob frame: {0}")]
    MalformedFrame(String),

    /// The blob uses a compression scheme this reader does not support
    /// (lzma, bzip2, lz4 or zstd).
    #[error("unsupported blob compression: {0}")]
    UnsupportedCompression(&'static str),

    /// Zlib inflation failed or produced a size different from the blob's
    /// declared `raw_size`.
    #[error("blob decompression failed: {0}")]
    DecompressionFailed(String),

    /// A primitive or header block that does not decode: protobuf failure,
    /// out-of-range string index, or a parallel-array length mismatch.
    #[error("malformed block: {0}")]
    MalformedBlock(String),

    /// `parse()` was entered while a previous call is still running.
    #[error("a parse call is already in progress")]
    ParserBusy,

    /// A decode task or sink callback failed on a worker thread. Carries the
    /// first failure; remaining tasks are cancelled best-effort.
    #[error("worker failed: {0}")]
    WorkerFailed(String),

    /// An entity encoder was used after its terminal `write()` call.
    #[error("encoder already written out")]
    EncoderConsumed,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PbfError>;
