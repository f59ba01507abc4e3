//! Hooks around the consumer dispatch pipeline.

use std::sync::Arc;

use caderpc_common::{Request, Result, RpcResult};

/// Runs code before and after every call made through a consumer.
///
/// Interceptors are applied in ascending [`priority`](Interceptor::priority).
/// `before` may short-circuit the call by returning a result; the pipeline
/// is then skipped and only the interceptors already entered see `after`,
/// in reverse order.
pub trait Interceptor: Send + Sync {
    fn priority(&self) -> i32 {
        0
    }

    fn before(&self, _request: &Request) -> Option<RpcResult> {
        None
    }

    fn after(&self, _request: &Request, _result: &Result<RpcResult>) {}
}

/// Interceptors sorted by priority.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new(mut interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        // stable, so equal priorities keep registration order
        interceptors.sort_by_key(|i| i.priority());
        Self { interceptors }
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Runs `before` hooks in order. Returns how many ran and the
    /// short-circuit result, if any.
    pub fn before(&self, request: &Request) -> (usize, Option<RpcResult>) {
        for (index, interceptor) in self.interceptors.iter().enumerate() {
            if let Some(result) = interceptor.before(request) {
                return (index + 1, Some(result));
            }
        }
        (self.interceptors.len(), None)
    }

    /// Runs `after` hooks of the first `entered` interceptors in reverse order.
    pub fn after(&self, entered: usize, request: &Request, result: &Result<RpcResult>) {
        for interceptor in self.interceptors[..entered.min(self.interceptors.len())].iter().rev() {
            interceptor.after(request, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    impl Log {
        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Recorder {
        name: &'static str,
        priority: i32,
        short_circuit: Option<RpcResult>,
        log: Arc<Log>,
    }

    impl Interceptor for Recorder {
        fn priority(&self) -> i32 {
            self.priority
        }

        fn before(&self, _request: &Request) -> Option<RpcResult> {
            self.log.push(format!("before:{}", self.name));
            self.short_circuit.clone()
        }

        fn after(&self, _request: &Request, _result: &Result<RpcResult>) {
            self.log.push(format!("after:{}", self.name));
        }
    }

    fn recorder(name: &'static str, priority: i32, short_circuit: Option<RpcResult>, log: &Arc<Log>) -> Arc<dyn Interceptor> {
        Arc::new(Recorder {
            name,
            priority,
            short_circuit,
            log: log.clone(),
        })
    }

    fn request() -> Request {
        Request::new("Calculator", "add", vec![], vec![])
    }

    #[test]
    fn test_priority_order() {
        let log = Arc::new(Log::default());
        let chain = InterceptorChain::new(vec![
            recorder("late", 10, None, &log),
            recorder("early", -5, None, &log),
        ]);

        let (entered, short) = chain.before(&request());
        assert_eq!(entered, 2);
        assert!(short.is_none());
        chain.after(entered, &request(), &Ok(json!(1)));

        assert_eq!(log.entries(), vec!["before:early", "before:late", "after:late", "after:early"]);
    }

    #[test]
    fn test_short_circuit_skips_later_hooks() {
        let log = Arc::new(Log::default());
        let chain = InterceptorChain::new(vec![
            recorder("cache", 0, Some(json!("cached")), &log),
            recorder("audit", 1, None, &log),
        ]);

        let (entered, short) = chain.before(&request());
        assert_eq!(entered, 1);
        assert_eq!(short, Some(json!("cached")));
        chain.after(entered, &request(), &Ok(json!("cached")));

        assert_eq!(log.entries(), vec!["before:cache", "after:cache"]);
    }
}
