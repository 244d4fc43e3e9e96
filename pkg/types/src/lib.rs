pub mod config;
pub mod deployment;
pub mod endpoint;
pub mod entity;
pub mod namespace;
pub mod node;
pub mod pod;
pub mod service;
pub mod validate;

pub use entity::{Entity, Owned};
