pub mod access;
pub mod api;
pub mod app;
pub mod config;
pub mod error;
pub mod migrate;
pub mod mongo_ext;
pub mod payment;
pub mod pricing;
pub mod receipt;
pub mod status;
pub mod util;
pub mod validation;
