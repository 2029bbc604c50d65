pub mod config;
pub mod db;
pub mod dispatch;
pub mod files;
pub mod ingest;
pub mod jobs;
pub mod model;
pub mod notify;
pub mod spreadsheet;
pub mod token;
pub mod worker;
