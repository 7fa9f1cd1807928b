//! Parody Mock Server
//!
//! A file-driven mock HTTP server: drop files under a watched directory and
//! they become routes. Mocks reload live as the files change, unmatched
//! requests can pass through to real upstream APIs, and every request is
//! traced with a correlation id.
//!
//! # Features
//!
//! - **Glob Discovery**: mock files found by glob patterns become URL routes
//! - **Polymorphic Mocks**: descriptors, literal JSON, raw files, handler
//!   functions, or arrays of any of these
//! - **Request Matching**: structural predicates over method, headers, URL
//! - **Live Reload**: edits, additions, and deletions apply without restart
//! - **Layered Precedence**: config mocks outrank files; earlier glob roots
//!   outrank later ones; the most specific path wins
//! - **Pass-Through Proxying**: unmatched prefixes forward to real upstreams
//! - **Latency Simulation**: per-response `timeToRespond` delays
//!
//! # Example Mock File
//!
//! `mocks/users/index.yaml` answers `GET /users`:
//!
//! ```yaml
//! request:
//!   method: GET
//!   headers:
//!     authorization:
//!       $regex: "^Bearer "
//! response:
//!   statusCode: 200
//!   body:
//!     users: []
//! ```
//!
//! # Example Configuration
//!
//! ```yaml
//! port: 8080
//! watch: true
//! mocks:
//!   - "./mocks/**/*"
//! proxyAPIs:
//!   /api: "http://real.example.com/api"
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod loader;
pub mod matcher;
pub mod mock;
pub mod proxy;
pub mod registry;
pub mod render;
pub mod resolve;
pub mod server;
pub mod shutdown;
pub mod watch;

pub use config::{InlineMock, MockSource, ServerConfig};
pub use error::Error;
pub use events::{EventBus, RequestOutcome, ServerEvent};
pub use matcher::{MockRequest, Predicate};
pub use mock::{HandlerArgs, HandlerVerdict, MockDescriptor, MockValue, ResponseSpec};
pub use server::{MockServer, ServerHandle};
pub use shutdown::Shutdown;
pub use watch::{FsEvent, FsEventKind, WatchMessage, WatchSource, WatchState};
