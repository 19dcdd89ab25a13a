//! Heart-beat header parsing and interval negotiation.

use tungsten_stomp::{negotiate, negotiated_interval, parse_heartbeat, StompError};

// ---------------------------------------------------------------------------
// parsing: exactly two non-negative integers
// ---------------------------------------------------------------------------

#[test]
fn well_formed_values_parse() {
    assert_eq!(parse_heartbeat("10000,10000").unwrap(), (10000, 10000));
    assert_eq!(parse_heartbeat("0,0").unwrap(), (0, 0));
    assert_eq!(parse_heartbeat("5000,15000").unwrap(), (5000, 15000));
    assert_eq!(parse_heartbeat(" 100 , 200 ").unwrap(), (100, 200));
}

#[test]
fn wrong_field_counts_are_rejected() {
    for bad in ["", "000", "10000", "1,2,3", ","] {
        assert!(
            matches!(parse_heartbeat(bad), Err(StompError::ProtocolFrame(_))),
            "{bad:?} should not parse"
        );
    }
}

#[test]
fn non_numeric_and_negative_fields_are_rejected() {
    for bad in ["A,B", "7,B", "A,7", "-1,5", "5,-1", "1.5,2"] {
        assert!(
            matches!(parse_heartbeat(bad), Err(StompError::ProtocolFrame(_))),
            "{bad:?} should not parse"
        );
    }
}

// ---------------------------------------------------------------------------
// negotiation: zero on either side disables, otherwise max
// ---------------------------------------------------------------------------

#[test]
fn zero_on_either_side_disables_a_direction() {
    assert_eq!(negotiated_interval(0, 0), 0);
    assert_eq!(negotiated_interval(0, 10000), 0);
    assert_eq!(negotiated_interval(10000, 0), 0);
}

#[test]
fn both_nonzero_takes_the_maximum() {
    assert_eq!(negotiated_interval(5000, 10000), 10000);
    assert_eq!(negotiated_interval(10000, 5000), 10000);
    assert_eq!(negotiated_interval(7, 7), 7);
}

#[test]
fn symmetric_policies_negotiate_to_the_larger() {
    // broker (5000,5000) with client (3000,3000): both directions settle
    // on 5000
    assert_eq!(negotiate(5000, 5000, 3000, 3000), (5000, 5000));
    assert_eq!(negotiate(3000, 3000, 5000, 5000), (5000, 5000));
}

#[test]
fn directions_negotiate_independently() {
    // local send pairs with remote recv, local recv with remote send
    assert_eq!(negotiate(1000, 2000, 3000, 4000), (4000, 3000));
    // disabling one side of one direction only kills that direction
    assert_eq!(negotiate(0, 2000, 3000, 4000), (0, 3000));
    assert_eq!(negotiate(1000, 2000, 0, 4000), (4000, 0));
    assert_eq!(negotiate(1000, 0, 3000, 4000), (4000, 0));
    assert_eq!(negotiate(1000, 2000, 3000, 0), (0, 3000));
    assert_eq!(negotiate(0, 0, 0, 0), (0, 0));
}
