//! # fofa-harvest
//!
//! Bulk extraction and monitoring for a search API that caps every query
//! at 10,000 records, spreads quota over several keys of different
//! privilege, and rate-limits hard.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//! │ Peeler       │──▶│ Traceback /   │──▶│ QueryExecutor │──▶ SearchApi
//! │ (by country) │   │ Direct pager  │   │ key failover  │
//! └──────┬───────┘   └───────┬───────┘   └──────────────┘
//!        ▼                   ▼                   ▲
//!   ┌─────────────────────────────┐              │
//!   │ ExtractionAccumulator (dedup)│        ┌─────┴─────┐
//!   └─────────────────────────────┘        │  Monitor   │
//!                                          └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init                            # create database
//! harvest keys check                      # classify API keys
//! harvest extract 'app="nginx"'           # auto: direct or peel
//! harvest update 'app="nginx"'            # merge records since last run
//! harvest monitor add 'port="6379"'       # watch a query
//! harvest monitor daemon
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | API and failover errors |
//! | [`client`] | Remote API trait and HTTP client |
//! | [`credentials`] | Key pool and privilege classification |
//! | [`proxy`] | Route selection |
//! | [`executor`] | Key/route failover |
//! | [`query`] | Structured query rewriting |
//! | [`accumulator`] | Deduplicating capped result set |
//! | [`traceback`] | Time-anchored pagination |
//! | [`paging`] | Direct pagination |
//! | [`peel`] | Dimensional peeling |
//! | [`extract`] | Extraction and update jobs |
//! | [`monitor`] | Adaptive monitoring |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod accumulator;
pub mod client;
pub mod config;
pub mod credentials;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod export;
pub mod extract;
pub mod history;
pub mod keys;
pub mod migrate;
pub mod models;
pub mod monitor;
pub mod paging;
pub mod peel;
pub mod progress;
pub mod proxy;
pub mod query;
pub mod stop;
pub mod traceback;
