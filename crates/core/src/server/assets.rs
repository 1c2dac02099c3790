use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};

/// The upload page, compiled into the binary.
#[derive(rust_embed::RustEmbed)]
#[folder = "../../web"]
struct ClientAssets;

pub(super) async fn embedded_client(uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/');
    let path = if path.is_empty() { "index.html" } else { path };

    match ClientAssets::get(path) {
        Some(file) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            ([(header::CONTENT_TYPE, mime.as_ref())], file.data).into_response()
        }
        None => match ClientAssets::get("index.html") {
            Some(index) => (
                [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                index.data,
            )
                .into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
    }
}
