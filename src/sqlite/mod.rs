// SQLite driver - the concrete store behind the pool and session seams
//
// - config: connection options, the pool manager and its test-only fault hooks
// - connection: the physical connection and its transaction control
// - params: parameter conversion between driver-neutral and SQLite values
// - schema: sample table bootstrap and inspection helpers

pub mod config;
pub mod connection;
pub mod params;
pub mod schema;

pub use config::{SqliteManager, SqliteOptions};
pub use connection::SqliteConnection;
pub use params::Params;
