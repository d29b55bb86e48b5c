// src/lib.rs
// Sandbox-backed docs workbench: project setup pipeline, durable mirror of the
// docs subtree, tree projection and debounced editor write-back.

pub mod config;
pub mod db;
pub mod error;
pub mod ignore_handler;
pub mod locks;
pub mod mirror;
pub mod paths;
pub mod sandbox;
pub mod scan_tree;
pub mod session;
pub mod setup;
pub mod shell;
pub mod terminal;
pub mod types;
pub mod workbench;
pub mod writeback;

pub use config::WorkbenchConfig;
pub use db::{FileStore, StoreHandle, UpsertStrategy};
pub use session::{BootState, Session, StartOutcome};
pub use workbench::{EditorKind, OpenedFile, Workbench};
