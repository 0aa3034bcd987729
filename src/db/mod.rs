mod batch;
mod connection;
mod health;
mod pool;
mod postgres;
mod query;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::*;
pub use connection::*;
pub use health::*;
pub use pool::*;
pub use postgres::{PostgresDriver, PostgresTlsOptions};
pub use query::*;
