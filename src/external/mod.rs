pub mod allocator;
pub mod data_coord;
pub mod meta;
pub mod msg_stream;
pub mod object_store;
pub mod s3;
