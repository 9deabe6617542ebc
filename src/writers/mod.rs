mod raw_writer;

pub use raw_writer::PbfWriter;
