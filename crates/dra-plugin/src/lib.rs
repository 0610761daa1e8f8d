//! Simulated GPU DRA kubelet plugin: claim preparation, CDI specs and
//! compute domain bookkeeping backed by an on-disk checkpoint.

pub mod app;
pub mod cdi;
pub mod checkpoint;
pub mod config;
pub mod domain;
pub mod driver;
pub mod engine;
pub mod error;
pub mod health;
pub mod inventory;
pub mod kube_client;
pub mod resolver;
