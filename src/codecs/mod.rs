pub mod blob;
pub mod block_builder;
pub mod block_decorators;
pub mod field;
