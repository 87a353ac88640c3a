//! Watches `NetworkPolicy`, `Pod`, and `Namespace` resources and replays
//! them into the core's event-handler traits (spec §6.3).

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;

pub use self::index::run;
