//! Tests for the protocol module
//!
//! These tests cover request id allocation, response conversion into call
//! results and message type codes.

#[cfg(test)]
mod tests {
    use super::super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn add_request() -> Request {
        Request::new(
            "Calculator",
            "add",
            vec!["int".into(), "int".into()],
            vec![json!(1), json!(2)],
        )
    }

    #[test]
    fn test_request_creation() {
        let req = add_request();
        assert_eq!(req.service_name, "Calculator");
        assert_eq!(req.method_name, "add");
        assert_eq!(req.params, vec![json!(1), json!(2)]);
        assert!(req.trace_id.is_none());
        assert!(!req.generic_invoke);
    }

    #[test]
    fn test_request_generic_and_trace() {
        let req = add_request().generic().with_trace_id("trace-1");
        assert!(req.generic_invoke);
        assert_eq!(req.trace_id.as_deref(), Some("trace-1"));
    }

    #[test]
    fn test_request_signature() {
        assert_eq!(add_request().signature(), "add(int,int)");

        let no_args = Request::new("Clock", "now", vec![], vec![]);
        assert_eq!(no_args.signature(), "now()");
    }

    #[test]
    fn test_request_id_uniqueness() {
        let ids: HashSet<_> = (0..1000).map(|_| add_request().id).collect();
        assert_eq!(ids.len(), 1000, "All request IDs should be unique");
    }

    #[test]
    fn test_request_ids_increase() {
        let first = add_request();
        let second = add_request();
        assert!(second.id > first.id);
    }

    #[test]
    fn test_reissue_keeps_payload_with_new_id() {
        let original = add_request().with_trace_id("t");
        let retry = original.reissue();
        assert_ne!(retry.id, original.id);
        assert_eq!(retry.method_name, original.method_name);
        assert_eq!(retry.params, original.params);
        assert_eq!(retry.trace_id, original.trace_id);
    }

    #[test]
    fn test_response_success_into_result() {
        let resp = Response::success(9, json!(3));
        assert!(resp.is_success());
        assert_eq!(resp.into_result().unwrap(), json!(3));
    }

    #[test]
    fn test_response_success_without_result_is_null() {
        let mut resp = Response::success(9, json!(1));
        resp.result = None;
        assert_eq!(resp.into_result().unwrap(), json!(null));
    }

    #[test]
    fn test_response_error_codes_map_to_errors() {
        let app = Response::error(1, codes::ERROR, "boom").into_result();
        assert!(matches!(app, Err(CadeError::Application { code: -1, .. })));

        let busy = Response::error(1, codes::BUSY, "service busy").into_result();
        assert!(matches!(busy, Err(CadeError::ProviderRejected { code: -3, .. })));

        let limited = Response::error(1, codes::LIMITED, "limited").into_result();
        assert!(limited.unwrap_err().is_retryable());

        let missing = Response::error(1, codes::NO_SUCH_SERVICE, "no such service").into_result();
        assert!(!missing.unwrap_err().is_retryable());
    }

    #[test]
    fn test_message_type_codes() {
        assert_eq!(MessageType::Request.code(), 1);
        assert_eq!(MessageType::Response.code(), 2);
        assert_eq!(MessageType::try_from(3).unwrap(), MessageType::HeartbeatRequest);
        assert_eq!(MessageType::try_from(4).unwrap(), MessageType::HeartbeatResponse);
        assert!(matches!(
            MessageType::try_from(42),
            Err(CadeError::UnknownMessageType(42))
        ));
    }

    #[test]
    fn test_message_from_conversions() {
        let msg: Message = add_request().into();
        assert_eq!(msg.message_type(), MessageType::Request);

        let msg: Message = Response::success(1, json!(null)).into();
        assert_eq!(msg.message_type(), MessageType::Response);
    }

    #[test]
    fn test_endpoint_address_and_equality() {
        let a = Endpoint::new("Calculator", "127.0.0.1", 9000);
        let b = Endpoint::new("Calculator", "127.0.0.1", 9000);
        let c = Endpoint::new("Clock", "127.0.0.1", 9000);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.address(), c.address());
        assert_eq!(a.to_string(), "Calculator@127.0.0.1:9000");
    }
}
