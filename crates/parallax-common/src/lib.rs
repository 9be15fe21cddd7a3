//! Parallax Common Types and Transport
//!
//! This crate provides the pieces shared by every Parallax process: the
//! controller, the engines and the clients.
//!
//! # Overview
//!
//! Parallax coordinates parallel computation across a pool of engines on
//! behalf of one or more clients, through a central controller. Everything
//! that travels between those processes is defined here:
//!
//! - **Protocol Layer**: [`Session`], [`Message`], [`MsgType`] and the typed
//!   message contents
//! - **Transport Layer**: multipart framing over TCP with router, dealer,
//!   publish and subscribe socket roles
//! - **Canning**: turning [`Object`] values into transportable form, with
//!   large buffers carried out-of-band
//! - **Dependencies**: the [`Dependency`] predicate used to gate task admission
//!
//! # Wire Format
//!
//! ```text
//! [ident_0..ident_k, "<IDS|MSG>", (key)?, header, parent_header, content, buffer_0..buffer_n]
//! ```
//!
//! Each bracketed item is one frame. The transport envelope carries an
//! explicit identity count, so identity frames never need to be told apart
//! from the delimiter by content.
//!
//! # Example
//!
//! ```
//! use parallax_common::{MsgType, Session, SessionConfig};
//! use serde_json::json;
//!
//! let session = Session::new(SessionConfig::default());
//! let msg = session.msg(MsgType::QueueRequest, json!({"verbose": false}), None);
//!
//! let frames = session.serialize(&msg, &[]).unwrap();
//! let (_idents, parsed) = session.recv(&frames, true).unwrap();
//! assert_eq!(parsed.header.msg_id, msg.header.msg_id);
//! ```

pub mod canning;
pub mod dependency;
pub mod protocol;
pub mod transport;

pub use canning::{
    can, pack_apply_message, serialize_object, uncan, unpack_apply_message, unserialize_object,
    ApplyInfo, Callable, CanningConfig, CanningError, DType, FunctionError, FunctionRef,
    FunctionRegistry, NdArray, Namespace, Object, BUILTIN_MODULE,
};
pub use dependency::{Dependency, DependencyMode};
pub use protocol::*;
