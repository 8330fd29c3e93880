mod kv;
mod schema;
mod sources;
mod types;

pub use schema::Database;
pub use types::DatabaseError;
