//! Validation-table coverage: every command against its required and
//! optional header sets, in both directions.

use tungsten_stomp::{validate, Frame, FrameSource, StompError};

fn frame(command: &str, headers: &[(&str, &str)]) -> Frame {
    let mut f = Frame::new(command);
    for (name, value) in headers {
        f = f.header(*name, *value);
    }
    f
}

/// (command, source, required headers, optional headers)
const TABLE: &[(
    &str,
    FrameSource,
    &[(&str, &str)],
    &[(&str, &str)],
)] = &[
    (
        "CONNECT",
        FrameSource::Client,
        &[("host", "/"), ("accept-version", "1.2")],
        &[("login", "guest"), ("passcode", "guest"), ("heart-beat", "0,0")],
    ),
    (
        "STOMP",
        FrameSource::Client,
        &[("host", "/"), ("accept-version", "1.2")],
        &[("login", "guest"), ("passcode", "guest"), ("heart-beat", "0,0")],
    ),
    (
        "CONNECTED",
        FrameSource::Server,
        &[("version", "1.2")],
        &[("session", "s"), ("server", "x/1"), ("heart-beat", "0,0")],
    ),
    (
        "SEND",
        FrameSource::Client,
        &[("destination", "/queue/a")],
        &[("transaction", "tx1")],
    ),
    (
        "SUBSCRIBE",
        FrameSource::Client,
        &[("destination", "/queue/a"), ("id", "sub-1")],
        &[("ack", "client")],
    ),
    ("UNSUBSCRIBE", FrameSource::Client, &[("id", "sub-1")], &[]),
    (
        "ACK",
        FrameSource::Client,
        &[("id", "tok")],
        &[("transaction", "tx1")],
    ),
    (
        "NACK",
        FrameSource::Client,
        &[("id", "tok")],
        &[("transaction", "tx1")],
    ),
    ("BEGIN", FrameSource::Client, &[("transaction", "tx1")], &[]),
    ("COMMIT", FrameSource::Client, &[("transaction", "tx1")], &[]),
    ("ABORT", FrameSource::Client, &[("transaction", "tx1")], &[]),
    ("DISCONNECT", FrameSource::Client, &[], &[("receipt", "r1")]),
    (
        "MESSAGE",
        FrameSource::Server,
        &[
            ("destination", "/queue/a"),
            ("message-id", "m1"),
            ("subscription", "sub-1"),
        ],
        &[("ack", "tok")],
    ),
    ("RECEIPT", FrameSource::Server, &[("receipt-id", "r1")], &[]),
    ("ERROR", FrameSource::Server, &[], &[("message", "oops")]),
];

#[test]
fn required_headers_alone_validate() {
    for (command, source, required, _) in TABLE {
        let f = frame(command, required);
        assert!(
            validate(&f, *source).is_ok(),
            "{command} with only required headers should validate"
        );
    }
}

#[test]
fn required_plus_optional_headers_validate() {
    for (command, source, required, optional) in TABLE {
        let mut all: Vec<(&str, &str)> = required.to_vec();
        all.extend_from_slice(optional);
        let f = frame(command, &all);
        assert!(
            validate(&f, *source).is_ok(),
            "{command} with required+optional headers should validate"
        );
    }
}

#[test]
fn dropping_any_required_header_fails() {
    for (command, source, required, _) in TABLE {
        for skip in 0..required.len() {
            let subset: Vec<(&str, &str)> = required
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, h)| *h)
                .collect();
            let f = frame(command, &subset);
            assert!(
                matches!(validate(&f, *source), Err(StompError::ProtocolFrame(_))),
                "{command} without '{}' should fail",
                required[skip].0
            );
        }
    }
}

#[test]
fn custom_headers_allowed_only_on_send_message_error() {
    for (command, source, required, _) in TABLE {
        let mut all: Vec<(&str, &str)> = required.to_vec();
        all.push(("x-custom-header", "value"));
        let f = frame(command, &all);
        let allowed = matches!(*command, "SEND" | "MESSAGE" | "ERROR");
        assert_eq!(
            validate(&f, *source).is_ok(),
            allowed,
            "custom header on {command}: expected allowed={allowed}"
        );
    }
}

#[test]
fn commands_fail_validation_in_opposite_direction() {
    for (command, source, required, _) in TABLE {
        let opposite = match source {
            FrameSource::Client => FrameSource::Server,
            FrameSource::Server => FrameSource::Client,
        };
        let f = frame(command, required);
        assert!(
            validate(&f, opposite).is_err(),
            "{command} should be invalid as a {opposite:?} frame"
        );
    }
}

#[test]
fn unknown_command_is_a_protocol_error() {
    let f = frame("WRONG_HEADER", &[]);
    assert!(matches!(
        validate(&f, FrameSource::Client),
        Err(StompError::ProtocolFrame(_))
    ));
    assert!(validate(&f, FrameSource::Server).is_err());
}

#[test]
fn malformed_escape_in_custom_header_rejected() {
    let f = frame(
        "SEND",
        &[("destination", "/queue/a"), ("note", "ends-with\\")],
    );
    assert!(validate(&f, FrameSource::Client).is_err());

    let f = frame("SEND", &[("destination", "/queue/a"), ("note", "a\\qb")]);
    assert!(validate(&f, FrameSource::Client).is_err());

    // the four legal sequences pass
    let f = frame(
        "SEND",
        &[("destination", "/queue/a"), ("note", "a\\\\b\\nc\\rd\\ce")],
    );
    assert!(validate(&f, FrameSource::Client).is_ok());
}
