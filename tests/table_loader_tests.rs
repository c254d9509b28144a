use std::path::PathBuf;

use giftsregister_to_md::{
    load_gift_table, Cell, LoadError, COL_DATE_OF_RECEPTION, COL_REGISTRATION_NUMBER,
};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

// register.xlsx: header row, a header echo repeated as data, two gift rows,
// and a merged-title row with text only in the first column.
#[test]
fn load_register_fixture_yields_only_gift_rows() {
    let table = load_gift_table(&fixture("register.xlsx"), false).expect("load ok");

    assert_eq!(table.rows.len(), 2);
    assert_eq!(
        table.rows[0][COL_REGISTRATION_NUMBER],
        Cell::Text("G1-23".to_string())
    );
    assert_eq!(
        table.rows[1][COL_REGISTRATION_NUMBER],
        Cell::Text("G2-23".to_string())
    );
}

#[test]
fn load_register_fixture_coerces_cells() {
    let table = load_gift_table(&fixture("register.xlsx"), false).expect("load ok");

    // Date text becomes an ISO-8601 string, numeric cells stay numeric,
    // absent cells stay the no-value marker.
    assert_eq!(
        table.rows[0][COL_DATE_OF_RECEPTION],
        Cell::Text("2023-01-02T00:00:00".to_string())
    );
    assert_eq!(table.rows[0][5], Cell::Number(150.0));
    assert_eq!(table.rows[1][5], Cell::Number(75.5));
    assert_eq!(table.rows[0][6], Cell::Empty);
}

#[test]
fn load_register_fixture_with_id_column() {
    let table = load_gift_table(&fixture("register.xlsx"), true).expect("load ok");

    assert_eq!(table.columns.len(), 12);
    assert_eq!(table.columns[11], "Id");
    assert_eq!(table.rows[0][11], Cell::Text("1".to_string()));
    assert_eq!(table.rows[1][11], Cell::Text("2".to_string()));
}

#[test]
fn load_rejects_wrong_column_count() {
    match load_gift_table(&fixture("narrow.xlsx"), false) {
        Err(LoadError::ColumnCount { found }) => assert_eq!(found, 3),
        other => panic!("expected ColumnCount, got {:?}", other),
    }
}

#[test]
fn load_missing_file_is_an_error() {
    let p = fixture("no-such-register.xlsx");
    assert!(matches!(
        load_gift_table(&p, false),
        Err(LoadError::OpenFailed(_))
    ));
}
