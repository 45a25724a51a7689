//! formwork-lib: the build-graph execution core of formwork.
//!
//! A recipe's steps become nodes of an [`graph::ExecutionGraph`], graph
//! transforms splice in overrides, and the executor runs the resulting plan
//! against a cache directory that several processes may share:
//! - `graph`: nodes, output handles, and cycle-checked execution plans
//! - `transform`: in-place graph rewrites such as `ReplaceNodeOutput`
//! - `classpath`: ordered, de-duplicated tool classpaths
//! - `lock`: cross-process cache locks and stale-lock maintenance
//! - `cache`: atomically published, content-verified cache entries

pub mod cache;
pub mod classpath;
pub mod config;
pub mod consts;
pub mod execute;
pub mod graph;
pub mod lock;
pub mod platform;
pub mod recipe;
pub mod step;
pub mod transform;
pub mod util;
