use bytes::Bytes;
use std::sync::{Arc, Mutex};

use parallax_common::{
    serialize_object, unpack_apply_message, ApplyRequestContent, CanningConfig, EngineInfo,
    FunctionRegistry, Namespace, RemoteError,
};

/// Everything a blocking call needs, cloned out of the engine.
#[derive(Clone)]
pub struct Executor {
    registry: Arc<FunctionRegistry>,
    namespace: Arc<Mutex<Namespace>>,
    canning: CanningConfig,
    engine_info: EngineInfo,
}

impl Executor {
    pub fn new(registry: FunctionRegistry, canning: CanningConfig, engine_info: EngineInfo) -> Self {
        Self {
            registry: Arc::new(registry),
            namespace: Arc::new(Mutex::new(Namespace::new())),
            canning,
            engine_info,
        }
    }

    pub fn engine_info(&self) -> &EngineInfo {
        &self.engine_info
    }

    /// Runs one `apply_request` and returns the serialized result.
    ///
    /// Bound calls see and mutate the persistent namespace. Unbound calls get
    /// a copy that is thrown away afterwards.
    pub fn execute(
        &self,
        content: &ApplyRequestContent,
        buffers: Vec<Bytes>,
    ) -> Result<Vec<Bytes>, RemoteError> {
        // A panicking task leaves the namespace as it was at the panic.
        let mut namespace = self
            .namespace
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let call = unpack_apply_message(buffers, &content.info, &self.registry, &namespace)
            .map_err(|e| self.error("ValueError", e.to_string()))?;
        let name = call.function.name().to_string();

        let result = if content.bound {
            call.function.call(&mut namespace, call.args, call.kwargs)
        } else {
            let mut scratch = namespace.clone();
            drop(namespace);
            call.function.call(&mut scratch, call.args, call.kwargs)
        };

        match result {
            Ok(value) => serialize_object(&value, &self.canning)
                .map_err(|e| self.error("ValueError", e.to_string())),
            Err(e) => Err(self
                .error(e.ename, e.evalue)
                .with_traceback(vec![format!("in {}", name)])),
        }
    }

    /// Empties the persistent namespace.
    pub fn clear(&self) {
        match self.namespace.lock() {
            Ok(mut namespace) => namespace.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    pub fn error(&self, ename: impl Into<String>, evalue: impl Into<String>) -> RemoteError {
        RemoteError::new(ename, evalue).with_engine_info(self.engine_info.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parallax_common::{
        pack_apply_message, unserialize_object, FunctionError, FunctionRef, Object,
    };
    use std::collections::{BTreeMap, VecDeque};

    fn executor() -> Executor {
        let mut registry = FunctionRegistry::with_builtins();
        registry.register("demo", "double", Some(1), |_, args, _| match args[0].as_int() {
            Some(n) => Ok(Object::Int(n * 2)),
            None => Err(FunctionError::type_error("expected an int")),
        });
        registry.register("demo", "stash", Some(1), |ns, args, _| {
            ns.insert("stashed".to_string(), args[0].clone());
            Ok(Object::None)
        });
        Executor::new(
            registry,
            CanningConfig::default(),
            EngineInfo {
                engine_id: Some(0),
                engine_ident: "engine-0".to_string(),
                method: "apply".to_string(),
            },
        )
    }

    fn request(f: FunctionRef, args: &[Object], bound: bool) -> (ApplyRequestContent, Vec<Bytes>) {
        let (buffers, info) =
            pack_apply_message(&f, args, &BTreeMap::new(), &CanningConfig::default()).unwrap();
        (
            ApplyRequestContent {
                bound,
                info,
                after: None,
                follow: None,
                targets: None,
                retries: 0,
            },
            buffers,
        )
    }

    fn decode(buffers: Vec<Bytes>) -> Object {
        unserialize_object(&mut VecDeque::from(buffers)).unwrap()
    }

    #[test]
    fn test_execute_returns_result() {
        let exec = executor();
        let (content, buffers) = request(FunctionRef::new("demo", "double"), &[Object::Int(21)], false);
        assert_eq!(decode(exec.execute(&content, buffers).unwrap()), Object::Int(42));
    }

    #[test]
    fn test_function_error_carries_engine_info() {
        let exec = executor();
        let (content, buffers) = request(
            FunctionRef::new("demo", "double"),
            &[Object::Str("x".to_string())],
            false,
        );
        let err = exec.execute(&content, buffers).unwrap_err();
        assert_eq!(err.ename, "TypeError");
        assert_eq!(err.engine_info.unwrap().engine_id, Some(0));
        assert_eq!(err.traceback, vec!["in demo.double".to_string()]);
    }

    #[test]
    fn test_unknown_function() {
        let exec = executor();
        let (content, buffers) = request(FunctionRef::new("demo", "missing"), &[], false);
        let err = exec.execute(&content, buffers).unwrap_err();
        assert_eq!(err.ename, "ValueError");
        assert!(err.evalue.contains("demo.missing"));
    }

    #[test]
    fn test_unbound_calls_do_not_touch_namespace() {
        let exec = executor();
        let (content, buffers) = request(FunctionRef::new("demo", "stash"), &[Object::Int(1)], false);
        exec.execute(&content, buffers).unwrap();
        assert!(exec.namespace.lock().unwrap().is_empty());

        let (content, buffers) = request(FunctionRef::new("demo", "stash"), &[Object::Int(1)], true);
        exec.execute(&content, buffers).unwrap();
        assert_eq!(exec.namespace.lock().unwrap()["stashed"], Object::Int(1));

        exec.clear();
        assert!(exec.namespace.lock().unwrap().is_empty());
    }

    #[test]
    fn test_push_then_pull() {
        let exec = executor();
        let mut values = BTreeMap::new();
        values.insert("a".to_string(), Object::Int(5));
        let (content, buffers) = request(
            FunctionRef::new("parallax", "push"),
            &[Object::Dict(values)],
            true,
        );
        exec.execute(&content, buffers).unwrap();

        let (content, buffers) = request(
            FunctionRef::new("parallax", "pull"),
            &[Object::Str("a".to_string())],
            true,
        );
        assert_eq!(decode(exec.execute(&content, buffers).unwrap()), Object::Int(5));
    }
}
