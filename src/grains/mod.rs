//! Bundled grain providers

pub mod database;
pub mod web_server;

pub use database::{Database, DatabaseGrain, UseDatabase, DATABASE};
pub use web_server::{Protocol, UseWebServer, WebServer, WebServerGrain, WEB_SERVER};
