use std::sync::Arc;

use axum::http::{self, Request, StatusCode};
use http_body_util::BodyExt;
use mock_server::{app, app_with, Db, MockBook, ENDPOINT_PATH, SESSION_KEY};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Form POST carrying the session key plus `pairs`.
fn form_request(pairs: &[(&str, &str)]) -> Request<String> {
    let mut all = vec![("sesskey", SESSION_KEY), ("version", "5.89")];
    all.extend_from_slice(pairs);
    Request::builder()
        .method("POST")
        .uri(ENDPOINT_PATH)
        .header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(serde_urlencoded::to_string(&all).unwrap())
        .unwrap()
}

fn shared_book(book: MockBook) -> Db {
    Arc::new(RwLock::new(book))
}

// --- session ---

#[tokio::test]
async fn wrong_session_key_is_rejected() {
    let request = Request::builder()
        .method("POST")
        .uri(ENDPOINT_PATH)
        .header(http::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body("req=getBookTables&sesskey=wrong".to_string())
        .unwrap();
    let resp = app().oneshot(request).await.unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["status"], "nok");
    assert_eq!(body["errorMsg"], "invalid session key");
}

#[tokio::test]
async fn unknown_request_is_reported() {
    let resp = app().oneshot(form_request(&[("req", "dropBook")])).await.unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["status"], "nok");
    assert_eq!(body["errorMsg"], "unknown request dropBook");
}

#[tokio::test]
async fn non_form_body_returns_400() {
    let request = Request::builder()
        .method("POST")
        .uri(ENDPOINT_PATH)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body("{}".to_string())
        .unwrap();
    let resp = app().oneshot(request).await.unwrap();
    assert!(resp.status().is_client_error());
}

// --- getBookTables ---

#[tokio::test]
async fn get_book_tables_lists_every_category() {
    let resp = app()
        .oneshot(form_request(&[("req", "getBookTables"), ("includeFields", "true")]))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["status"], "ok");
    let categories = body["bookTables"]["categories"].as_array().unwrap();
    assert_eq!(categories.len(), 4);
    assert_eq!(categories[1]["code"], "test_code");
    assert_eq!(categories[1]["fields"][0]["fixed_code"], "description");
}

// --- getTableValues ---

#[tokio::test]
async fn get_table_values_without_filter_returns_all_rows() {
    let resp = app()
        .oneshot(form_request(&[("req", "getTableValues"), ("catId", "2")]))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["tableValues"]["id"], 2);
    let description = &body["tableValues"]["fields"][0];
    assert_eq!(description["values"].as_array().unwrap().len(), 2);
    assert_eq!(description["values"][0], json!({"id": 5001, "value": "First item"}));
}

#[tokio::test]
async fn get_table_values_applies_filter() {
    let filter = json!({"applyViewFilters": {"filterGroup": {"operator": "and", "filters": [
        {"id": "tmpId", "json": {"predicate": "is", "operand": "Second item"}, "field_id": 201, "filter_type": "text"}
    ]}}})
    .to_string();
    let resp = app()
        .oneshot(form_request(&[
            ("req", "getTableValues"),
            ("catId", "2"),
            ("filterRowIds", filter.as_str()),
        ]))
        .await
        .unwrap();
    let body = body_json(resp).await;
    let values = body["tableValues"]["fields"][0]["values"].as_array().unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0]["id"], 5002);
}

#[tokio::test]
async fn get_table_values_unknown_table() {
    let resp = app()
        .oneshot(form_request(&[("req", "getTableValues"), ("catId", "99")]))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["errorMsg"], "unknown table 99");
}

// --- createOrUpdateTableRow ---

#[tokio::test]
async fn create_row_from_temp_id() {
    let db = shared_book(MockBook::seeded());
    let resp = app_with(db.clone())
        .oneshot(form_request(&[
            ("req", "createOrUpdateTableRow"),
            ("rowId", "tmpnew"),
            ("fieldValues", r#"{"201":"Third item"}"#),
            ("bypassUrlTrigger", "false"),
        ]))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body, json!({"status": "ok", "rows": [{"id": 9000}]}));
    assert_eq!(db.read().await.table("test_code").unwrap().rows.len(), 3);
}

#[tokio::test]
async fn update_missing_row_fails() {
    let resp = app()
        .oneshot(form_request(&[
            ("req", "createOrUpdateTableRow"),
            ("rowId", "123"),
            ("fieldValues", r#"{"201":"x"}"#),
        ]))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["status"], "nok");
    assert_eq!(body["errorMsg"], "row 123 not found");
}

// --- createOrUpdateTableRows ---

#[tokio::test]
async fn batch_write_records_page_and_rows() {
    let db = shared_book(MockBook::seeded());
    let rows = json!({"5001": {"202": 7}, "tmpA": {"201": "New"}}).to_string();
    let resp = app_with(db.clone())
        .oneshot(form_request(&[("req", "createOrUpdateTableRows"), ("rows", rows.as_str())]))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["rows"].as_array().unwrap().len(), 2);

    let book = db.read().await;
    assert_eq!(book.batch_pages, vec![2]);
    assert_eq!(book.table("test_code").unwrap().rows[0].values[&202], json!(7));
}

#[tokio::test]
async fn batch_write_injects_deadlocks() {
    let db = shared_book(MockBook::seeded().with_deadlocks(1));
    let rows = json!({"tmpA": {"201": "New"}}).to_string();

    let resp = app_with(db.clone())
        .oneshot(form_request(&[("req", "createOrUpdateTableRows"), ("rows", rows.as_str())]))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["status"], "nok");
    assert!(body["error"].as_str().unwrap().contains("Deadlock"));

    let resp = app_with(db.clone())
        .oneshot(form_request(&[("req", "createOrUpdateTableRows"), ("rows", rows.as_str())]))
        .await
        .unwrap();
    assert_eq!(body_json(resp).await["status"], "ok");
    assert_eq!(db.read().await.batch_pages, vec![1, 1]);
}

// --- fileUpload ---

fn multipart_request(fields: &[(&str, &str)], file: &[u8]) -> Request<String> {
    let boundary = "mockboundary";
    let mut body = String::new();
    for (name, value) in fields {
        body.push_str(&format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        ));
    }
    body.push_str(&format!(
        "--{boundary}\r\nContent-Disposition: form-data; name=\"qqfile\"; filename=\"notes.txt\"\r\nContent-Type: text/plain\r\n\r\n{}\r\n--{boundary}--\r\n",
        String::from_utf8_lossy(file)
    ));
    Request::builder()
        .method("POST")
        .uri(ENDPOINT_PATH)
        .header(
            http::header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(body)
        .unwrap()
}

#[tokio::test]
async fn file_upload_stores_file() {
    let db = shared_book(MockBook::seeded());
    let resp = app_with(db.clone())
        .oneshot(multipart_request(
            &[
                ("req", "fileUpload"),
                ("sesskey", SESSION_KEY),
                ("uuid", "u-1"),
                ("rowId", "5001"),
                ("fieldId", "203"),
            ],
            b"hello",
        ))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["fileName"], "notes.txt");

    let book = db.read().await;
    assert_eq!(book.uploads.len(), 1);
    assert_eq!(book.uploads[0].uuid, "u-1");
    assert_eq!(book.uploads[0].content_type, "text/plain");
    assert_eq!(book.uploads[0].bytes, b"hello");
}

#[tokio::test]
async fn file_upload_unknown_row_fails() {
    let resp = app()
        .oneshot(multipart_request(
            &[
                ("req", "fileUpload"),
                ("sesskey", SESSION_KEY),
                ("rowId", "1"),
                ("fieldId", "203"),
            ],
            b"hello",
        ))
        .await
        .unwrap();
    let body = body_json(resp).await;
    assert_eq!(body["errorMsg"], "row 1 not found");
}
