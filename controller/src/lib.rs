#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The daemon binary: wires CLI parsing, `kube::Client` construction, the
//! shell-based kernel adapter, and the admin HTTP server around
//! [`netpold_core::reconcile::Reconciler`] and [`netpold_k8s_index::run`].

pub mod admin;
pub mod bootstrap;
pub mod cleanup;
pub mod cli;
pub mod kernel_shell;

pub use self::cli::Args;
