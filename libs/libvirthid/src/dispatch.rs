//! Request dispatch
//!
//! Every selector has a fixed argument shape. The shape is checked here, once,
//! before any handler runs; handlers can therefore index their scalar inputs
//! without re-checking counts.

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::subscription::AsyncTarget;
use crate::{handlers, subscription};

/// Operations exposed to clients
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Selector {
    Create = 0,
    Destroy = 1,
    Send = 2,
    List = 3,
    Subscribe = 4,
}

impl Selector {
    /// All selectors in wire order
    pub const ALL: [Selector; 5] = [
        Selector::Create,
        Selector::Destroy,
        Selector::Send,
        Selector::List,
        Selector::Subscribe,
    ];

    /// Convert from the raw wire value
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.get(raw as usize).copied()
    }

    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Declared argument shape
    pub fn shape(self) -> &'static MethodShape {
        &METHOD_SHAPES[self as usize]
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Destroy => "destroy",
            Self::Send => "send",
            Self::List => "list",
            Self::Subscribe => "subscribe",
        }
    }
}

/// Argument shape a selector requires
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MethodShape {
    pub scalar_inputs: usize,
    pub struct_input_size: usize,
    pub scalar_outputs: usize,
    pub struct_output_size: usize,
}

impl MethodShape {
    const fn scalars(inputs: usize, outputs: usize) -> Self {
        Self {
            scalar_inputs: inputs,
            struct_input_size: 0,
            scalar_outputs: outputs,
            struct_output_size: 0,
        }
    }

    /// Check a call against this shape
    pub fn accepts(&self, call: &MethodCall) -> bool {
        call.scalar_input.len() == self.scalar_inputs
            && call.struct_input.len() == self.struct_input_size
            && call.scalar_output_count == self.scalar_outputs
            && call.struct_output_size == self.struct_output_size
    }
}

/// Shape table, indexed by selector
pub static METHOD_SHAPES: [MethodShape; 5] = [
    // create: name ptr/len, descriptor ptr/len, serial ptr/len, vendor, product
    MethodShape::scalars(8, 0),
    // destroy: name ptr/len
    MethodShape::scalars(2, 0),
    // send: name ptr/len, report ptr/len
    MethodShape::scalars(4, 0),
    // list: buffer ptr/len -> bytes needed, item count
    MethodShape::scalars(2, 2),
    // subscribe: name ptr/len
    MethodShape::scalars(2, 0),
];

/// Arguments of one client request
#[derive(Default)]
pub struct MethodCall {
    pub scalar_input: Vec<u64>,
    pub struct_input: Vec<u8>,
    pub scalar_output_count: usize,
    pub struct_output_size: usize,
    /// Asynchronous reply target, consumed by `Subscribe`
    pub async_target: Option<Box<dyn AsyncTarget>>,
}

impl MethodCall {
    pub fn new(scalar_input: impl Into<Vec<u64>>) -> Self {
        Self {
            scalar_input: scalar_input.into(),
            ..Self::default()
        }
    }

    pub fn with_scalar_outputs(mut self, count: usize) -> Self {
        self.scalar_output_count = count;
        self
    }

    pub fn with_async_target(mut self, target: Box<dyn AsyncTarget>) -> Self {
        self.async_target = Some(target);
        self
    }
}

impl core::fmt::Debug for MethodCall {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MethodCall")
            .field("scalar_input", &self.scalar_input)
            .field("struct_input", &self.struct_input.len())
            .field("scalar_output_count", &self.scalar_output_count)
            .field("struct_output_size", &self.struct_output_size)
            .field("async_target", &self.async_target.is_some())
            .finish()
    }
}

/// Outputs of a successful request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodReply {
    pub scalar_output: Vec<u64>,
}

impl MethodReply {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Resolve a raw selector and check the call's shape
pub fn route(selector: u32, call: &MethodCall) -> Result<Selector> {
    let selector = Selector::from_raw(selector).ok_or_else(|| {
        warn!("Rejecting unknown selector #{}", selector);
        Error::Unsupported("unknown selector")
    })?;

    if !selector.shape().accepts(call) {
        warn!(
            "Rejecting {}: shape mismatch ({} scalar inputs, {} scalar outputs)",
            selector.name(),
            call.scalar_input.len(),
            call.scalar_output_count
        );
        return Err(Error::Unsupported("argument shape mismatch"));
    }

    Ok(selector)
}

/// Route a request to its handler
pub(crate) fn dispatch(conn: &Connection, selector: u32, call: MethodCall) -> Result<MethodReply> {
    debug!("{}: external method #{}", conn.task_id(), selector);

    let selector = route(selector, &call)?;
    let args = call.scalar_input.as_slice();

    match selector {
        Selector::Create => handlers::create(conn, args),
        Selector::Destroy => handlers::destroy(conn, args),
        Selector::Send => handlers::send(conn, args),
        Selector::List => handlers::list(conn, args),
        Selector::Subscribe => subscription::subscribe(conn, args, call.async_target),
    }
}
