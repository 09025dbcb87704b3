//! Mitos - cell-based agent orchestration platform.
//!
//! Runs populations of LLM-backed cells organized into formations,
//! missions, swarms and evolutions, with:
//! - A per-cell agentic runtime (serial inbox drain, think/tool loop,
//!   working memory, budget tracking)
//! - Declarative controllers reconciling resources into running cells
//! - A hierarchical budget ledger with an append-only journal
//! - A recursion validator gating every spawn

pub mod adapters;
pub mod api;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod runtime;
pub mod services;
