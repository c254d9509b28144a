use std::path::PathBuf;

use giftsregister_to_md::{
    encode_link_url, extract_pdf_links, extract_row_id, extract_url_id, PdfError,
};

#[test]
fn row_id_from_registration_number() {
    assert_eq!(extract_row_id("G12-23"), Some("12".to_string()));
    assert_eq!(extract_row_id("G305_21"), Some("305".to_string()));
    assert_eq!(extract_row_id("12-23"), None);
    assert_eq!(extract_row_id(""), None);
}

#[test]
fn url_id_prefers_g_number_separator_pattern() {
    assert_eq!(
        extract_url_id("https://example.com/photos/G45_01.jpg"),
        Some("45".to_string())
    );
}

#[test]
fn url_id_falls_back_through_the_cascade() {
    // Bare G-number, no separator pair.
    assert_eq!(extract_url_id("https://host/img/G99.png"), Some("99".to_string()));
    // Number with separator, no G prefix.
    assert_eq!(extract_url_id("https://host/img/123_09.png"), Some("123".to_string()));
    // Plain numbered jpg.
    assert_eq!(extract_url_id("https://host/img/777.jpg"), Some("777".to_string()));
    assert_eq!(extract_url_id("https://host/img/777.JPG"), Some("777".to_string()));
}

#[test]
fn url_id_absent_when_nothing_matches() {
    assert_eq!(extract_url_id("https://host/about"), None);
}

#[test]
fn encode_keeps_url_delimiters_and_escapes_the_rest() {
    let encoded = encode_link_url("https://host/path/a photo.jpg?x=1&y=2#frag");
    assert_eq!(encoded, "https://host/path/a%20photo.jpg?x=1&y=2#frag");
}

#[test]
fn encode_escapes_non_ascii() {
    assert_eq!(encode_link_url("https://host/café.jpg"), "https://host/caf%C3%A9.jpg");
}

#[test]
fn extract_links_missing_file_is_an_error() {
    let p = PathBuf::from("./this/does/not/exist.pdf");
    let err = extract_pdf_links(&p).unwrap_err();
    match err {
        PdfError::OpenFailed(_) => {}
    }
}
