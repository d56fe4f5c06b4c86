//! Envgate - a local-development reverse proxy for port-bound environments
//!
//! This library lets a developer run several named environments on one
//! host, each bound to its own port:
//! - A pre-proxy per environment forwards browser traffic to a selected
//!   front-end dev server, tagging every request with the owning port
//! - A shared post-proxy forwards tagged API calls to each environment's
//!   real API origin and hosts the management surface
//! - Cookies are namespaced per environment so sessions on different
//!   ports do not overwrite each other
//! - A declarative TOML config hot-reloads; reconciliation stops only the
//!   listeners whose environments were removed

pub mod catalog;
pub mod config;
pub mod cookies;
pub mod dashboard;
pub mod error;
pub mod listener;
pub mod manage;
pub mod pool;
pub mod post_proxy;
pub mod pre_proxy;
pub mod reconcile;
pub mod registry;
pub mod ws;
