#![no_main]

//! Arbitrary header values and bodies must never panic the event builder,
//! and every body must be recoverable from its encoded form.

use arbitrary::Arbitrary;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flowtap::event::builder::{encode_body, resolve_host};
use flowtap::event::EventBuilder;
use flowtap::{CapturedFlow, FlowId, HttpRequest, HttpResponse, OutboundEvent};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct Input {
    host_header: Option<String>,
    authority: Option<String>,
    header_name: String,
    header_value: String,
    status: u16,
    body: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let encoded = encode_body(&input.body);
    let decoded = match std::str::from_utf8(&input.body) {
        Ok(_) => encoded.clone().into_bytes(),
        Err(_) => STANDARD.decode(&encoded).expect("non-UTF-8 bodies are base64"),
    };
    assert_eq!(decoded, input.body);

    let Ok(mut request) = HttpRequest::new("GET", "http://fuzz.invalid/") else {
        return;
    };
    if let Some(host) = &input.host_header {
        request = request.with_header("Host", host);
    }
    if let Some(authority) = &input.authority {
        request = request.with_header(":authority", authority);
    }
    request = request
        .with_header(&input.header_name, &input.header_value)
        .with_body(input.body.clone());

    let expected = input
        .authority
        .clone()
        .or(input.host_header.clone())
        .unwrap_or_else(|| "fuzz.invalid".to_string());
    // Header lookup is case-insensitive; a fuzzed "host" header may win.
    let host = resolve_host(&request);
    if !input.header_name.eq_ignore_ascii_case("host")
        && !input.header_name.eq_ignore_ascii_case(":authority")
    {
        assert_eq!(host, expected);
    }

    let response = HttpResponse::new(input.status, "").with_body(input.body);
    let flow = CapturedFlow::new(FlowId::generate(), request).with_response(response);

    let builder = EventBuilder;
    let now = chrono::Utc::now();
    let meta = builder.connection_metadata(&flow, now);
    let detail = builder.response_detail(&meta, flow.response.as_ref().expect("set above"));
    let event = OutboundEvent::from(detail);
    let json = event.to_json().expect("events always serialize");
    let _: serde_json::Value = serde_json::from_slice(&json).expect("output is valid JSON");
});
