#![forbid(unsafe_code)]

pub mod apply;
pub mod audit;
pub mod cli;
pub mod config;
pub mod configure;
pub mod error;
pub mod outbound;
pub mod path;
pub mod plan;
pub mod providers;
pub mod redact;
pub mod reference;
pub mod registry;
pub mod resolver;
pub mod rpc;
pub mod snapshot;
pub mod store;
pub mod surfaces;
pub mod telemetry;

pub use config::{CliArgs, Command, GatewayEnv, SecretsCommand};
pub use error::{Result, SecretsError};
pub use plan::{Plan, PlanOptions, PlanTarget};
pub use reference::{SecretDefaults, SecretRef, SecretSource};
pub use resolver::{Diagnostic, Snapshot, prepare_snapshot};
pub use snapshot::{ReloaderState, SnapshotActivator, resolve_command_secrets};
