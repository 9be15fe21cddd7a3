use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

use super::can::{can, uncan, Canned};
use super::object::{FunctionRef, Object};
use super::registry::{Callable, FunctionRegistry, Namespace};
use super::serialize::{serialize_object, unserialize_object};
use super::{CanningConfig, CanningError};

/// How the buffers of an apply request decompose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyInfo {
    /// Number of positional arguments.
    pub nargs: usize,
    /// Number of frames the positional arguments occupy.
    pub narg_bufs: usize,
    /// Keyword argument names, in the order their frames appear.
    pub kw_keys: Vec<String>,
}

/// Packs a call into frames.
///
/// Frame 0 is the canned function; positional arguments follow, then keyword
/// arguments in sorted key order.
pub fn pack_apply_message(
    f: &FunctionRef,
    args: &[Object],
    kwargs: &BTreeMap<String, Object>,
    config: &CanningConfig,
) -> Result<(Vec<Bytes>, ApplyInfo), CanningError> {
    let canned_f = can(&Object::Function(f.clone()), config);
    let mut buffers = vec![Bytes::from(postcard::to_allocvec(&canned_f)?)];

    for arg in args {
        buffers.extend(serialize_object(arg, config)?);
    }
    let narg_bufs = buffers.len() - 1;

    let kw_keys: Vec<String> = kwargs.keys().cloned().collect();
    for value in kwargs.values() {
        buffers.extend(serialize_object(value, config)?);
    }

    Ok((
        buffers,
        ApplyInfo {
            nargs: args.len(),
            narg_bufs,
            kw_keys,
        },
    ))
}

/// A call reconstructed from frames.
pub struct UnpackedApply {
    pub function: Callable,
    pub args: Vec<Object>,
    pub kwargs: BTreeMap<String, Object>,
}

/// Reverses [`pack_apply_message`], binding the function through `registry`
/// or, failing that, `namespace`.
pub fn unpack_apply_message(
    buffers: Vec<Bytes>,
    info: &ApplyInfo,
    registry: &FunctionRegistry,
    namespace: &Namespace,
) -> Result<UnpackedApply, CanningError> {
    let mut queue: VecDeque<Bytes> = buffers.into();

    let head = queue.pop_front().ok_or(CanningError::MissingBuffer)?;
    let canned: Canned = postcard::from_bytes(&head)?;
    let fref = match uncan(canned) {
        Object::Function(f) => f,
        other => {
            return Err(CanningError::Malformed(format!(
                "expected a function, got {}",
                other.type_name()
            )))
        }
    };
    let function = registry.bind(&fref, namespace)?;

    let before = queue.len();
    let mut args = Vec::with_capacity(info.nargs);
    for _ in 0..info.nargs {
        args.push(unserialize_object(&mut queue)?);
    }
    let consumed = before - queue.len();
    if consumed != info.narg_bufs {
        return Err(CanningError::Malformed(format!(
            "positional arguments used {} frames, expected {}",
            consumed, info.narg_bufs
        )));
    }

    let mut kwargs = BTreeMap::new();
    for key in &info.kw_keys {
        kwargs.insert(key.clone(), unserialize_object(&mut queue)?);
    }

    Ok(UnpackedApply {
        function,
        args,
        kwargs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canning::{FunctionError, NdArray};

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register("math", "scale", Some(2), |_, args, _| {
            let arr = match &args[0] {
                Object::Array(a) => a.to_f64_vec().map_err(|e| FunctionError::value_error(e.to_string()))?,
                other => return Err(FunctionError::type_error(format!("expected ndarray, got {}", other.type_name()))),
            };
            let factor = args[1].as_float().unwrap_or(1.0);
            let scaled: Vec<f64> = arr.iter().map(|v| v * factor).collect();
            NdArray::from_f64(vec![scaled.len()], &scaled)
                .map(Object::Array)
                .map_err(|e| FunctionError::value_error(e.to_string()))
        });
        registry
    }

    #[test]
    fn test_pack_unpack_and_call() {
        let config = CanningConfig::default();
        let arr = NdArray::from_f64(vec![3], &[1.0, 2.0, 3.0]).unwrap();
        let f = FunctionRef::new("math", "scale").with_defaults(vec![Object::Float(2.0)]);

        let mut kwargs = BTreeMap::new();
        kwargs.insert("unused".to_string(), Object::Int(0));

        let (buffers, info) =
            pack_apply_message(&f, &[Object::Array(arr)], &kwargs, &config).unwrap();
        assert_eq!(info.nargs, 1);
        // array description + array data
        assert_eq!(info.narg_bufs, 2);
        assert_eq!(info.kw_keys, vec!["unused".to_string()]);
        assert_eq!(buffers.len(), 4);

        let unpacked =
            unpack_apply_message(buffers, &info, &registry(), &Namespace::new()).unwrap();
        assert_eq!(unpacked.kwargs.get("unused"), Some(&Object::Int(0)));

        let mut ns = Namespace::new();
        let result = unpacked
            .function
            .call(&mut ns, unpacked.args, BTreeMap::new())
            .unwrap();
        match result {
            Object::Array(out) => assert_eq!(out.to_f64_vec().unwrap(), vec![2.0, 4.0, 6.0]),
            other => panic!("expected ndarray, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_function() {
        let config = CanningConfig::default();
        let f = FunctionRef::new("nowhere", "nothing");
        let (buffers, info) = pack_apply_message(&f, &[], &BTreeMap::new(), &config).unwrap();
        let err = unpack_apply_message(buffers, &info, &registry(), &Namespace::new())
            .err()
            .unwrap();
        assert!(matches!(err, CanningError::UnknownFunction(name) if name == "nowhere.nothing"));
    }

    #[test]
    fn test_truncated_arguments() {
        let config = CanningConfig::default();
        let f = FunctionRef::new("math", "scale");
        let (mut buffers, info) =
            pack_apply_message(&f, &[Object::Buffer(Bytes::from_static(b"x"))], &BTreeMap::new(), &config)
                .unwrap();
        buffers.pop();
        assert!(matches!(
            unpack_apply_message(buffers, &info, &registry(), &Namespace::new()),
            Err(CanningError::MissingBuffer)
        ));
    }
}
