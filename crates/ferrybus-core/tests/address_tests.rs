//! Endpoint parsing and formatting tests

use ferrybus_core::{ContextKind, Endpoint, Error};

fn valid_endpoints() -> Vec<Endpoint> {
    let mut all = vec![];
    for kind in ContextKind::ALL {
        all.push(Endpoint::bare(kind));
        if kind.is_hub_affine() {
            continue;
        }
        for tab in [0, 1, 42, u32::MAX] {
            all.push(Endpoint::in_tab(kind, tab));
            for frame in [0, 7] {
                all.push(Endpoint::in_frame(kind, tab, frame));
            }
        }
    }
    all
}

#[test]
fn test_round_trip_all_valid_endpoints() {
    for ep in valid_endpoints() {
        let text = ep.format();
        assert_eq!(Endpoint::parse(&text).unwrap(), ep, "round trip of {}", text);
    }
}

#[test]
fn test_format_is_left_inverse_of_parse() {
    for text in ["coordinator", "popup", "devtools@3", "window@1.0", "content-script@9.2"] {
        assert_eq!(Endpoint::parse(text).unwrap().format(), text);
    }
}

#[test]
fn test_unknown_kind() {
    let err = Endpoint::parse("background").unwrap_err();
    assert!(matches!(err, Error::AddressParse(_)));
}

#[test]
fn test_malformed_text() {
    for text in [
        "",
        "window@",
        "window@x",
        "window@1.",
        "window@1.2.3",
        "content-script@-1",
        " popup",
        "popup ",
        "window@99999999999",
    ] {
        assert!(Endpoint::parse(text).is_err(), "{:?} should not parse", text);
    }
}

#[test]
fn test_display_and_from_str() {
    let ep: Endpoint = "devtools@12".parse().unwrap();
    assert_eq!(ep.to_string(), "devtools@12");
    assert_eq!(ep, Endpoint::try_from("devtools@12").unwrap());
}

#[test]
fn test_serde_shape() {
    let ep = Endpoint::in_frame(ContextKind::Window, 4, 1);
    let json = serde_json::to_value(ep).unwrap();
    assert_eq!(json, serde_json::json!({"context": "window", "tabId": 4, "frameId": 1}));

    let bare: Endpoint = serde_json::from_value(serde_json::json!({"context": "popup", "tabId": null})).unwrap();
    assert_eq!(bare, Endpoint::bare(ContextKind::Popup));
}
