pub mod gateway;
pub mod local;
pub mod value;

pub use gateway::GatewayDb;
pub use local::LocalStore;
pub use value::{build_placeholders, row_f64, row_i64, row_string, Row, SqlValue};
