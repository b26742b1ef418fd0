pub mod config;
pub mod evaluation;
pub mod routes;
pub mod sdk;
pub mod state;
pub mod store;
