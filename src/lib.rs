//! # docsync
//!
//! Bidirectional synchronization between a local document tree and a remote
//! page/database service.
//!
//! Each configured mapping binds a local directory to a remote target (a
//! Notion database or parent page). A sync cycle detects what changed on
//! either side since the last confirmed sync, resolves documents changed on
//! both sides, applies transfers idempotently and commits per-document sync
//! records only once a transfer is confirmed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Registry   │──▶│   Detector   │──▶│   Resolver   │
//! │  (mappings)  │   │ local+remote │   │  (conflicts) │
//! └──────────────┘   └──────┬───────┘   └──────┬───────┘
//!                           │                  │
//!                           ▼                  ▼
//!                    ┌──────────────┐   ┌──────────────┐
//!                    │ State Store  │◀──│ Orchestrator │──▶ Sync Report
//!                    │   (SQLite)   │   │ apply+commit │
//!                    └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export NOTION_TOKEN=secret_...
//! docsync init                  # create state containers
//! docsync sync --dry-run        # show what would change
//! docsync sync                  # run one cycle
//! docsync watch                 # keep syncing on each mapping's interval
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`fingerprint`] | Content digests |
//! | [`state`] | Sync records and backups |
//! | [`registry`] | Mapping validation and filters |
//! | [`connector_fs`] | Local document tree |
//! | [`remote`] | Remote adapter interface, rate limiting |
//! | [`connector_notion`] | Notion adapter |
//! | [`blocks`] | Markdown ⇄ Notion blocks |
//! | [`detect`] | Change detection |
//! | [`resolve`] | Conflict policies |
//! | [`sync`] | Cycle orchestration |
//! | [`report`] | Sync reports |
//! | [`watch`] | Interval scheduler |
//! | [`status`] | Status, backups, restore |

pub mod blocks;
pub mod config;
pub mod connector_fs;
pub mod connector_notion;
pub mod db;
pub mod detect;
pub mod error;
pub mod fingerprint;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod registry;
pub mod remote;
pub mod remote_memory;
pub mod report;
pub mod resolve;
pub mod retry;
pub mod state;
pub mod status;
pub mod sync;
pub mod watch;
