#![warn(missing_docs)]

//! <div class="warning">
//!
//! Note: API is unstable, and may change in `0.x` versions.
//!
//! </div>
//!
//! Mirror the posts matching a booru query into a local directory,
//! skipping the files that are already there.
//!
//! # As a library
//!
//! As a library, usually you prefer to use [`driver`] with a [`query::QuerySpec`]
//! to count, paginate and download in one go.
//!
//! See [`driver::PaginationDriver#example`] for example.
//!
//! The pieces it is made of are usable on their own:
//! - [`query`] builds the request urls,
//! - [`api`] sends the count probe and page requests,
//! - [`inventory`] lists the files already present,
//! - [`planner`] decides what to download and downloads it.
//!
//! # As a binary
//!
//! In addition to the above, you also need [`cli`] and [`config`] to build the command line.
//!
//! See `main.rs` to know how to assemble these modules as a binary.

pub mod api;
pub mod driver;
pub mod planner;
pub mod query;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "__toml")]
#[allow(missing_docs)]
pub mod config;

#[allow(missing_docs)]
pub mod download;
pub mod inventory;
pub mod tool;
