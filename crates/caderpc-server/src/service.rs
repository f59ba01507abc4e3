//! Services and method dispatch tables.

use std::collections::HashMap;
use std::sync::Arc;

use caderpc_common::{CadeError, Result, RpcArgs, RpcResult};
use serde::de::DeserializeOwned;

/// A named set of methods exposed by a provider.
///
/// Methods run on the provider's worker pool and may block.
pub trait Service: Send + Sync {
    /// Calls the method matching `method` and `param_types` exactly.
    ///
    /// # Errors
    ///
    /// [`CadeError::NoSuchMethod`] if nothing matches; any other error is
    /// reported to the caller as an application error.
    fn invoke(&self, method: &str, param_types: &[String], args: RpcArgs) -> Result<RpcResult>;

    /// Calls made without a compiled stub. Defaults to [`invoke`](Service::invoke).
    fn invoke_generic(&self, method: &str, param_types: &[String], args: RpcArgs) -> Result<RpcResult> {
        self.invoke(method, param_types, args)
    }
}

type Handler = Arc<dyn Fn(RpcArgs) -> Result<RpcResult> + Send + Sync>;

/// [`Service`] built from closures keyed by `method(type,type)`.
///
/// Generic calls that miss the exact signature fall back to the single
/// method with the same name and argument count.
///
/// # Example
///
/// ```
/// use caderpc_server::service::{arg, MethodTable, Service};
/// use serde_json::json;
///
/// let calculator = MethodTable::new()
///     .method("add", &["int", "int"], |args| {
///         Ok(json!(arg::<i64>(&args, 0)? + arg::<i64>(&args, 1)?))
///     });
///
/// let sum = calculator.invoke("add", &["int".into(), "int".into()], vec![json!(1), json!(2)]);
/// assert_eq!(sum.unwrap(), json!(3));
/// ```
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: HashMap<String, Handler>,
    by_arity: HashMap<(String, usize), Vec<String>>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `name(param_types)`, replacing any earlier one.
    pub fn method<F>(mut self, name: &str, param_types: &[&str], handler: F) -> Self
    where
        F: Fn(RpcArgs) -> Result<RpcResult> + Send + Sync + 'static,
    {
        let key = signature(name, param_types);
        let overloads = self
            .by_arity
            .entry((name.to_string(), param_types.len()))
            .or_default();
        if !overloads.contains(&key) {
            overloads.push(key.clone());
        }
        self.methods.insert(key, Arc::new(handler));
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    fn exact(&self, method: &str, param_types: &[String]) -> Option<&Handler> {
        self.methods.get(&signature(method, param_types))
    }
}

impl Service for MethodTable {
    fn invoke(&self, method: &str, param_types: &[String], args: RpcArgs) -> Result<RpcResult> {
        match self.exact(method, param_types) {
            Some(handler) => handler(args),
            None => Err(CadeError::NoSuchMethod(signature(method, param_types))),
        }
    }

    fn invoke_generic(&self, method: &str, param_types: &[String], args: RpcArgs) -> Result<RpcResult> {
        if let Some(handler) = self.exact(method, param_types) {
            return handler(args);
        }
        let overloads = self
            .by_arity
            .get(&(method.to_string(), args.len()))
            .map(Vec::as_slice)
            .unwrap_or_default();
        match overloads {
            [only] => match self.methods.get(only) {
                Some(handler) => handler(args),
                None => Err(CadeError::NoSuchMethod(only.clone())),
            },
            [] => Err(CadeError::NoSuchMethod(format!("{}/{}", method, args.len()))),
            _ => Err(CadeError::NoSuchMethod(format!(
                "{}/{} is ambiguous between {}",
                method,
                args.len(),
                overloads.join(", ")
            ))),
        }
    }
}

fn signature<S: AsRef<str>>(method: &str, param_types: &[S]) -> String {
    let types: Vec<&str> = param_types.iter().map(AsRef::as_ref).collect();
    format!("{}({})", method, types.join(","))
}

/// Deserializes argument `index`.
pub fn arg<T: DeserializeOwned>(args: &RpcArgs, index: usize) -> Result<T> {
    let value = args.get(index).ok_or_else(|| CadeError::Application {
        code: -1,
        message: format!("missing argument {}", index),
    })?;
    Ok(T::deserialize(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn types(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn calculator() -> MethodTable {
        MethodTable::new()
            .method("add", &["int", "int"], |args| {
                Ok(json!(arg::<i64>(&args, 0)? + arg::<i64>(&args, 1)?))
            })
            .method("add", &["double", "double"], |args| {
                Ok(json!(arg::<f64>(&args, 0)? + arg::<f64>(&args, 1)?))
            })
            .method("negate", &["int"], |args| Ok(json!(-arg::<i64>(&args, 0)?)))
    }

    #[test]
    fn test_exact_signature() {
        let table = calculator();
        assert_eq!(table.len(), 3);
        let sum = table
            .invoke("add", &types(&["int", "int"]), vec![json!(2), json!(3)])
            .unwrap();
        assert_eq!(sum, json!(5));

        let sum = table
            .invoke("add", &types(&["double", "double"]), vec![json!(0.5), json!(0.25)])
            .unwrap();
        assert_eq!(sum, json!(0.75));
    }

    #[test]
    fn test_typed_call_does_not_guess() {
        let err = calculator()
            .invoke("negate", &types(&["long"]), vec![json!(1)])
            .unwrap_err();
        assert!(matches!(err, CadeError::NoSuchMethod(ref s) if s == "negate(long)"));
    }

    #[test]
    fn test_generic_falls_back_to_arity() {
        let table = calculator();
        let result = table.invoke_generic("negate", &[], vec![json!(4)]).unwrap();
        assert_eq!(result, json!(-4));

        // two overloads of add/2
        let err = table.invoke_generic("add", &[], vec![json!(1), json!(2)]).unwrap_err();
        assert!(matches!(err, CadeError::NoSuchMethod(_)));

        let err = table.invoke_generic("negate", &[], vec![]).unwrap_err();
        assert!(matches!(err, CadeError::NoSuchMethod(ref s) if s == "negate/0"));
    }

    #[test]
    fn test_bad_argument_is_an_error() {
        let err = calculator()
            .invoke("negate", &types(&["int"]), vec![json!("four")])
            .unwrap_err();
        assert!(matches!(err, CadeError::JsonSerialization(_)));

        let err = calculator().invoke("negate", &types(&["int"]), vec![]).unwrap_err();
        assert!(matches!(err, CadeError::Application { .. }));
    }
}
