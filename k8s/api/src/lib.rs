#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod convert;
pub mod duration;
pub mod labels;

pub use self::duration::K8sDuration;
pub use self::labels::match_labels;
pub use k8s_openapi::{
    api::{
        core::v1::{Namespace, Node, Pod},
        networking::v1::NetworkPolicy,
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
    NamespaceResourceScope,
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Resource, ResourceExt},
    error::ErrorResponse,
    runtime::watcher::Event as WatchEvent,
    Client, Error,
};
