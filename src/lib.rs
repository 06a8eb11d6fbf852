pub mod adapters;
pub mod bootstrap;
pub mod config;
pub mod domain;
pub mod error;
pub mod import;
pub mod ports;
pub mod repository;

#[cfg(test)]
pub mod test_helpers;
