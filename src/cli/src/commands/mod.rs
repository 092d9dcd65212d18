pub mod breakers;
pub mod config;
pub mod conflicts;
pub mod health;
pub mod replay;
pub mod routes;
pub mod sagas;
