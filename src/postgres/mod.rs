pub mod connection;
pub mod decoder;
pub mod protocol;
pub mod schema;
pub mod store;
pub mod types;

pub use connection::{ReplicationConnection, ReplicationMessage, ReplicationStream, SystemInfo};
pub use decoder::{LogicalMessage, PgOutputDecoder, TupleData, TupleValue};
pub use schema::TableSchema;
pub use store::PgStore;
pub use types::*;
