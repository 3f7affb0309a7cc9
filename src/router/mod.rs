//! Message Router (C3), Handler Registry (C4), and their shared wire types.

pub mod config;
pub mod domain_types;
pub mod handlers;
pub mod router;
pub mod traits;
pub mod transport;

pub use config::RouterConfig;
pub use domain_types::{Ctxt, Direction, Message, MessageKind, RemoteFailure, Response, ResponseOutcome};
pub use handlers::{ComputeApi, Handler, HandlerContext, HandlerRegistry, KwArgs, SchedulerApi};
pub use router::Router;
pub use traits::{RouterForwarding, Transport, TransportError};
pub use transport::InProcessTransport;
