//! Robustness tests for the public parsing and checking API.
//!
//! Feeds in the wild are large, hand-edited and occasionally truncated;
//! these check that odd input is either tolerated or rejected cleanly.

use ipflip::blocklist::{is_blocked, parse_blocklist, Blocklist, ParseError};
use std::net::IpAddr;

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

#[test]
fn test_empty_feed() {
    assert!(parse_blocklist(b"").unwrap().is_empty());
}

#[test]
fn test_header_only_feed() {
    assert!(parse_blocklist(b"Updated: 2024-01-01 12:00:00 +0000\n")
        .unwrap()
        .is_empty());
}

#[test]
fn test_realistic_feed_excerpt() {
    let feed = "Updated: 2024-01-01 12:00:00 +0000\n\
                1.2.3.4;example.org;;Roskomnadzor;27-31-2018/Id2971-18;2018-04-16\n\
                5.6.7.8 | 9.10.11.12 | 2a00:1450::1;;https://example.net;court;2-1234/2019;2019-01-01\n\
                ;blocked-domain.example;;FNS;2-6-27/2015-12-20;2016-01-01\n\
                \"13.14.15.16\";\"quoted;domain\";;MVD;1/2020;2020-01-01\n";

    let list = parse_blocklist(feed.as_bytes()).unwrap();

    for addr in ["1.2.3.4", "5.6.7.8", "9.10.11.12", "2a00:1450::1", "13.14.15.16"] {
        assert!(is_blocked(&list, &ip(addr)), "{} should be blocked", addr);
    }
    assert_eq!(list.len(), 5);
    assert!(!is_blocked(&list, &ip("8.8.8.8")));
}

#[test]
fn test_quoted_field_spanning_lines() {
    let feed = "h\n1.1.1.1;\"line one\nline two\";x\n2.2.2.2;y\n";
    let list = parse_blocklist(feed.as_bytes()).unwrap();
    assert!(is_blocked(&list, &ip("1.1.1.1")));
    assert!(is_blocked(&list, &ip("2.2.2.2")));
    assert_eq!(list.len(), 2);
}

#[test]
fn test_truncated_download_is_an_error() {
    let feed = "h\n1.1.1.1;x\n2.2.2.2;\"cut off mid";
    assert!(matches!(
        parse_blocklist(feed.as_bytes()),
        Err(ParseError::UnterminatedQuote { .. })
    ));
}

#[test]
fn test_stray_quote_reports_line() {
    let feed = "h\n1.1.1.1;x\n2.2.2.2;bad\"quote\n";
    match parse_blocklist(feed.as_bytes()) {
        Err(ParseError::BareQuote { line }) => assert_eq!(line, 3),
        other => panic!("expected bare quote error, got {:?}", other),
    }
}

#[test]
fn test_garbage_addresses_skipped() {
    let feed = "h\n999.1.1.1;x\n1.2.3;x\nhello;x\n | | ;x\n10.0.0.1/24;x\n7.7.7.7;x\n";
    let list = parse_blocklist(feed.as_bytes()).unwrap();
    assert_eq!(list.len(), 1);
    assert!(is_blocked(&list, &ip("7.7.7.7")));
}

#[test]
fn test_invalid_utf8_tolerated() {
    let mut feed = b"h\n1.1.1.1;".to_vec();
    feed.extend_from_slice(&[0xff, 0xfe, 0xfd]);
    feed.extend_from_slice(b"\n2.2.2.2;x\n");

    let list = parse_blocklist(&feed).unwrap();
    assert!(is_blocked(&list, &ip("1.1.1.1")));
    assert!(is_blocked(&list, &ip("2.2.2.2")));
}

#[test]
fn test_large_feed() {
    let mut feed = String::from("Updated: now\n");
    for i in 0..100_000u32 {
        let [a, b, c, d] = i.to_be_bytes();
        feed.push_str(&format!("{}.{}.{}.{};domain{}.example;;x;y;z\n", a + 10, b, c, d, i));
    }

    let list = parse_blocklist(feed.as_bytes()).unwrap();
    assert_eq!(list.len(), 100_000);
    assert!(is_blocked(&list, &ip("10.0.0.0")));
    assert!(is_blocked(&list, &ip("10.1.134.159")));
}

#[test]
fn test_blocklist_collects_canonical_addresses() {
    let list: Blocklist = ["::ffff:192.0.2.1", "192.0.2.1", "2001:db8::1"]
        .iter()
        .map(|s| ip(s))
        .collect();

    assert_eq!(list.len(), 2);
    assert!(is_blocked(&list, &ip("192.0.2.1")));
    assert!(is_blocked(&list, &ip("::ffff:192.0.2.1")));
}

mod config {
    use ipflip::config::Config;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        let file = write_config("feed: [unclosed\n  url: ");
        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let file = write_config("reachability:\n  interval_ms: soon\n");
        assert!(Config::load_or_default(file.path()).is_err());
    }

    #[test]
    fn test_empty_mapping_uses_defaults_for_checking() {
        let file = write_config("{}\n");
        let config = Config::load_or_default(file.path()).unwrap();
        assert!(config.feed.url.starts_with("https://"));
    }

    #[test]
    fn test_empty_mapping_not_enough_to_run() {
        let file = write_config("{}\n");
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults_for_checking() {
        let config = Config::load_or_default("/nonexistent/ipflip.yaml").unwrap();
        assert_eq!(config.reachability.deadline_secs, 15);
    }
}
