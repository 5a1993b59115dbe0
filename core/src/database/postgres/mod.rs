pub mod client;
pub mod coercion;
pub mod copy;
pub mod merge;
pub mod setup;
pub mod staging;
pub mod upsert;
pub mod value;
