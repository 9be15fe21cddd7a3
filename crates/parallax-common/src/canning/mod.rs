//! Parallax Canning
//!
//! Turns live values into frames that can cross the wire and back.
//!
//! - [`can`] / [`uncan`]: walk containers and replace functions with
//!   descriptors
//! - [`serialize_object`] / [`unserialize_object`]: encode a canned value
//!   with postcard, moving large payloads into separate frames
//! - [`pack_apply_message`] / [`unpack_apply_message`]: a whole call
//!   (function, args, kwargs) as one frame list
//!
//! Arrays and raw buffers are always sent out-of-band; other payloads only
//! once they exceed [`CanningConfig::buffer_threshold`].

pub mod apply;
pub mod can;
pub mod object;
pub mod registry;
pub mod serialize;

pub use apply::{pack_apply_message, unpack_apply_message, ApplyInfo, UnpackedApply};
pub use can::{can, uncan, Canned, CannedFunction};
pub use object::{DType, FunctionRef, NdArray, Object};
pub use registry::{
    Callable, FunctionError, FunctionRegistry, Namespace, NativeFunction, BUILTIN_MODULE,
};
pub use serialize::{serialize_object, unserialize_object, Metadata, SerializedValue, TypeDescriptor};

use thiserror::Error;

/// Canning configuration.
#[derive(Debug, Clone)]
pub struct CanningConfig {
    /// Payloads larger than this many bytes travel as their own frame.
    ///
    /// Default: 1024
    pub buffer_threshold: usize,
    /// Containers with at least this many items are encoded whole instead
    /// of element by element.
    ///
    /// Default: 64
    pub item_threshold: usize,
}

impl Default for CanningConfig {
    fn default() -> Self {
        Self {
            buffer_threshold: 1024,
            item_threshold: 64,
        }
    }
}

#[derive(Error, Debug)]
pub enum CanningError {
    #[error("Missing out-of-band buffer")]
    MissingBuffer,

    #[error("Undecodable payload: {0}")]
    Decode(#[from] postcard::Error),

    #[error("Unknown function: {0}")]
    UnknownFunction(String),

    #[error("Array data is {actual} bytes, shape needs {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Malformed canned value: {0}")]
    Malformed(String),
}
