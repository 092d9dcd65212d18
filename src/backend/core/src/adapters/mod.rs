//! Adapters to the legacy and modern collaborators.
//!
//! The core never talks to either system directly: every call goes through a
//! [`Collaborator`], normally a [`GuardedCollaborator`] wrapping an
//! [`HttpCollaborator`].

pub mod collaborator;
pub mod forwarder;
pub mod guarded;
pub mod http;
pub mod poller;
pub mod route;

pub use collaborator::{ChangeBatch, Collaborator, Command, EntityRecord, InMemoryCollaborator};
pub use forwarder::{CommandForwarder, APPLIED_TO};
pub use guarded::GuardedCollaborator;
pub use http::HttpCollaborator;
pub use poller::{ChangePoller, PollReport};
pub use route::CollaboratorRoute;
