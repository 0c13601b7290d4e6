pub mod api;
pub mod cleanup;
pub mod conf;
pub mod db;
pub mod errors;
pub mod identity;
pub mod provider;
pub mod schema;
pub mod session;
pub mod storage;
pub mod token;
pub mod users;
