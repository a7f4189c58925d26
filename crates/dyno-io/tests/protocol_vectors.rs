use dyno_core::OperatorCommand;
use dyno_io::protocol::{IncomingMessage, ProtocolVersion};

#[test]
fn parses_hello_message() {
    let raw = r#"{
        "type":"hello",
        "protocol_version":{"major":1,"minor":0},
        "capabilities":["setpoints.v1","command.v1"],
        "client_id":"bench-panel"
    }"#;

    let msg = IncomingMessage::parse(raw).expect("hello should parse");
    match msg {
        IncomingMessage::Hello(hello) => {
            assert!(hello.protocol_version.is_supported());
            assert_eq!(hello.client_id.as_deref(), Some("bench-panel"));
            assert_eq!(hello.capabilities.len(), 2);
        }
        _ => panic!("expected hello message"),
    }
}

#[test]
fn parses_setpoints_message() {
    let raw = r#"{
        "type":"setpoints",
        "protocol_version":{"major":1,"minor":0},
        "sequence":7,
        "mut_current_a":3.5,
        "load_rpm":1200
    }"#;

    let msg = IncomingMessage::parse(raw).expect("setpoints should parse");
    match msg {
        IncomingMessage::Setpoints(sp) => {
            assert_eq!(sp.sequence, 7);
            assert_eq!(sp.protocol_version, ProtocolVersion::v1());
            assert_eq!(sp.mut_current_a, 3.5);
            assert_eq!(sp.load_rpm, 1200.0);
        }
        _ => panic!("expected setpoints message"),
    }
}

#[test]
fn parses_command_and_selection_messages() {
    let cmd = IncomingMessage::parse(r#"{"type":"command","command":"start_experiment"}"#)
        .expect("command should parse");
    assert!(matches!(
        cmd,
        IncomingMessage::Command(ref c) if c.command == OperatorCommand::StartExperiment
    ));
    assert!(cmd.protocol_version().is_supported());

    let select = IncomingMessage::parse(r#"{"type":"select_experiment","name":"ramp.json"}"#)
        .expect("selection should parse");
    match select {
        IncomingMessage::SelectExperiment(sel) => assert_eq!(sel.name.as_deref(), Some("ramp.json")),
        _ => panic!("expected select_experiment message"),
    }
}

#[test]
fn rejects_unknown_or_malformed_messages() {
    assert!(IncomingMessage::parse(r#"{"type":"subscribe"}"#).is_none());
    assert!(IncomingMessage::parse(r#"{"type":"command","command":"self_destruct"}"#).is_none());
    assert!(IncomingMessage::parse(r#"{"type":"setpoints","load_rpm":1}"#).is_none());
    assert!(IncomingMessage::parse("not json").is_none());
}
