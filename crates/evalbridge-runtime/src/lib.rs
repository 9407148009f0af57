//! Request handling for evalbridge nodes.
//!
//! Requests arriving at a node are routed by [`dispatcher::DirectionalDispatcher`]:
//! either forwarded to the peer link or executed here by
//! [`remote_eval::RemoteEvaluator`], which delegates to the collaborator
//! traits in [`evaluator`], [`fs`] and [`process`]. [`bridge::Bridge`] ties
//! dispatch to the request registry and TCP peer links.

pub mod bridge;
pub mod dispatcher;
pub mod evaluator;
pub mod fs;
pub mod process;
pub mod remote_eval;

pub use bridge::Bridge;
pub use dispatcher::{Dispatched, DirectionalDispatcher};
pub use remote_eval::RemoteEvaluator;
