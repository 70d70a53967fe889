//! # libvirthid
//!
//! Dispatch and buffer-marshaling core of the VirtHID bridge.
//!
//! A client drives virtual HID devices through five fixed-shape requests
//! (create, destroy, send, list, subscribe). The bridge checks each request's
//! shape, maps the client memory the request points at, calls the
//! [`Provider`] and marshals the result back. Independently, the provider
//! pushes host-originated reports to the client through the connection's
//! single subscription slot.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use libvirthid::{Connection, MethodCall, NotifyThrottle, Selector};
//!
//! let conn = Connection::new(task, provider, NotifyThrottle::default());
//! conn.external_method(
//!     Selector::Destroy.as_raw(),
//!     MethodCall::new(vec![name_addr, name_len]),
//! )?;
//! ```

pub mod connection;
pub mod dispatch;
pub mod error;
mod handlers;
pub mod marshal;
pub mod memory;
pub mod provider;
pub mod subscription;

pub use connection::{Connection, ConnectionRef};
pub use dispatch::{MethodCall, MethodReply, MethodShape, Selector, METHOD_SHAPES};
pub use error::{Error, Result, Status};
pub use handlers::{MAX_NAME_LEN, MAX_PAYLOAD_LEN};
pub use marshal::{MappedBuffer, MarshalError, MAX_MAP_LENGTH};
pub use memory::{Direction, MemoryFault, TaskId, TaskMemory, UserRange};
pub use provider::{ListOutcome, Provider};
pub use subscription::{AsyncTarget, NotifyThrottle, ReportRecord, MAX_REPORT_SIZE};
