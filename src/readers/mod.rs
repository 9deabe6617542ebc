mod limiter;
mod parallel_reader;

pub use parallel_reader::ParallelReader;
