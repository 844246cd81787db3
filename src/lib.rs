//! # transclude-core
//!
//! Concurrent fetch scheduling and dependency tracking for HTTP transclusion.
//!
//! A page assembled from many backend resources (a layout, a navigation bar,
//! a few embedded widgets, each of those perhaps including others) normally
//! loses HTTP cache validation: the outer response cannot say "not modified"
//! without refetching everything it is built from. transclude-core keeps that
//! ability. It remembers which resources each page was built from, revalidates
//! all of them in parallel when a conditional request arrives, and answers
//! "not modified" in one round trip when every one of them is unchanged.
//!
//! ## Overview
//!
//! - **Dependency tracking**: a process-wide record of which resource includes
//!   which, learned from rendered output and used as a prediction for the next
//!   request.
//! - **Speculative fetching**: predicted includes are fetched while the root is
//!   still being rendered.
//! - **Single ownership**: within one request a URL is fetched at most once at a
//!   time, however many threads need it.
//! - **Fair scheduling**: one shared worker pool serves every in-flight request,
//!   oldest request first.
//! - **Merged validators**: the assembled page's `ETag` and `Last-Modified`
//!   describe every resource that actually contributed to it.
//!
//! ## Architecture
//!
//! - **[`deptracker`]**: `DependencyTracker`, the cross-request include graph
//! - **[`fetchlist`]**: `FetchList`, a request's work queue and claim protocol
//! - **[`tasklist`]**: `TaskList`, the scheduler shared by every request
//! - **[`pool`]**: `ThreadPool`, workers draining the scheduler
//! - **[`page`]**: `PageManager`, the per-request state machine
//! - **[`engine`]**: `Transcluder`, the request-level driver
//! - **[`source`]**: the fetcher and dependency-finder seams
//! - **[`resource`]**, **[`cookies`]**, **[`cache_headers`]**: resource identity,
//!   sub-request headers and validator merging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use http::HeaderMap;
//! use transclude_core::{
//!     config::EngineConfig,
//!     engine::{Assembly, Transcluder},
//!     resource::{RequestContext, Response},
//!     TranscludeError,
//! };
//!
//! fn main() -> Result<(), TranscludeError> {
//!     let engine = Transcluder::new(EngineConfig::default())?;
//!     let context = RequestContext::new("http://localhost/", HeaderMap::new());
//!
//!     let fetcher = |url: &str, _ctx: &RequestContext| -> Result<Response<String>, TranscludeError> {
//!         Ok(Response::ok(format!("<p>{url}</p>"), Some(url.to_string())))
//!     };
//!     let finder = |_doc: &String, _url: &str| -> Vec<String> { Vec::new() };
//!
//!     match engine.assemble("http://localhost/", context, finder, fetcher, |_page, root| Ok(root))? {
//!         Assembly::NotModified { headers } => println!("304 {headers:?}"),
//!         Assembly::Modified(response) => println!("{} {} bytes", response.status, response.body.len()),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Logging
//!
//! Everything is reported through [`tracing`] with a bracketed component prefix
//! (`[PageManager]`, `[TaskList]`, ...). The library never installs a
//! subscriber.

pub mod cache_headers;
pub mod config;
pub mod cookies;
pub mod deptracker;
pub mod engine;
pub mod error;
pub mod fetchlist;
pub mod page;
pub mod pool;
pub mod resource;
pub mod source;
pub mod tasklist;

pub use error::*;
