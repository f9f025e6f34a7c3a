pub mod config;
pub mod db;
pub mod discovery;
pub mod media;
pub mod migrate;
pub mod model;
pub mod publisher;
pub mod retry;
pub mod transform;
pub mod wordpress;
