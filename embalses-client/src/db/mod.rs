pub mod reservoir_queries;
pub mod schema;

pub use schema::{connect, connect_in_memory, init_schema, sort_key};
