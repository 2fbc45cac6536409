pub mod db;
pub mod error;
pub mod locks;
pub mod models;
pub mod remote;
pub mod repository;
pub mod service;
pub mod store;

pub use error::{Error, Result};
pub use repository::{RecordRepository, RemotePolicy};
pub use service::TallyService;
