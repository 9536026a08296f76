use mycomize_iot_sync::{IotError, RecordId};

#[test]
fn entity_not_found_display() {
    let err = IotError::EntityNotFound("switch.fan".into());
    assert_eq!(err.to_string(), "entity not found: switch.fan");
}

#[test]
fn partial_resolution_display_lists_missing() {
    let err = IotError::PartialResolution {
        missing: vec!["switch.fan".into(), "light.grow".into()],
    };
    assert_eq!(
        err.to_string(),
        "unable to resolve durable ids for 2 entities: switch.fan, light.grow"
    );
}

#[test]
fn unauthorized_display() {
    assert_eq!(
        IotError::Unauthorized.to_string(),
        "backend session is no longer authorized"
    );
}

#[test]
fn gateway_not_found_display_for_unsaved() {
    let err = IotError::GatewayNotFound(RecordId::UNSAVED);
    assert_eq!(err.to_string(), "gateway not found: unsaved");
}

#[test]
fn only_backend_unauthorized_is_terminal() {
    assert!(IotError::Unauthorized.is_unauthorized());
    assert!(!IotError::GatewayUnauthorized.is_unauthorized());
    assert!(!IotError::Api("x".into()).is_unauthorized());
}

#[test]
fn transient_errors() {
    assert!(IotError::Api("timeout".into()).is_transient());
    assert!(IotError::Gateway("refused".into()).is_transient());
    assert!(!IotError::Unauthorized.is_transient());
    assert!(!IotError::EntityNotFound("switch.fan".into()).is_transient());
}

#[test]
fn serde_error_converts() {
    let err: IotError = serde_json::from_str::<serde_json::Value>("{not json")
        .unwrap_err()
        .into();
    assert!(matches!(err, IotError::Serialization(_)));
}
