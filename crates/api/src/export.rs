//! CSV download responses.
//!
//! Exports are UTF-8 with a BOM so spreadsheet tools detect the encoding, and
//! filenames carry the UTC date.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::Utc;

const UTF8_BOM: &[u8] = b"\xef\xbb\xbf";

/// Build an attachment response from rows of already stringified cells.
pub fn csv_attachment(prefix: &str, headers: &[&str], rows: &[Vec<String>]) -> Response {
    let mut writer = csv::Writer::from_writer(Vec::new());
    if writer.write_record(headers).is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    for row in rows {
        if writer.write_record(row).is_err() {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    let Ok(body) = writer.into_inner() else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let mut payload = Vec::with_capacity(UTF8_BOM.len() + body.len());
    payload.extend_from_slice(UTF8_BOM);
    payload.extend_from_slice(&body);

    let filename = format!("{}_{}.csv", prefix, Utc::now().format("%Y-%m-%d"));
    let disposition = format!("attachment; filename=\"{filename}\"");

    (
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/csv; charset=utf-8"),
            ),
            (
                header::CONTENT_DISPOSITION,
                HeaderValue::from_str(&disposition)
                    .unwrap_or_else(|_| HeaderValue::from_static("attachment")),
            ),
        ],
        payload,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn test_csv_has_bom_and_dated_filename() {
        let rows = vec![vec!["10.0.0.1".to_string(), "25".to_string()]];
        let response = csv_attachment("brute_force_report", &["source_ip", "attempts"], &rows);

        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(disposition.contains("brute_force_report_"));
        assert!(disposition.ends_with(".csv\""));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.starts_with(UTF8_BOM));
        let text = String::from_utf8(body[UTF8_BOM.len()..].to_vec()).unwrap();
        assert!(text.starts_with("source_ip,attempts"));
        assert!(text.contains("10.0.0.1,25"));
    }
}
