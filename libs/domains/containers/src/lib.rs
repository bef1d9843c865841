//! Runtime container supervision.
//!
//! Guarantees one healthy, labelled inference container per workflow:
//! picks the latest successful image build from the store, reuses a
//! matching running container when one exists, otherwise reaps stale
//! containers and starts a fresh one bound to a random loopback port,
//! then probes it until it answers HTTP.

pub mod error;
pub mod runtime;
pub mod supervisor;

pub use error::SupervisorError;
pub use runtime::{ContainerInfo, ContainerRuntime, DockerCli};
pub use supervisor::{ContainerSupervisor, LABEL_KEY, RUNTIME_PORT};
