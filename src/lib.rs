pub mod app;
pub mod catalog;
pub mod config;
pub mod domain;
pub mod error;
pub mod geometry;
pub mod metadata;
pub mod output;
pub mod pipeline;
pub mod store;
pub mod tiles;
pub mod transfer;
