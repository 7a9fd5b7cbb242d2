//! In-process fake of the S3 REST subset used by the storage provider.
//!
//! Records every request so tests can assert on the exact protocol exchange.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub key: String,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
    pub authorization: Option<String>,
}

#[derive(Default)]
struct FakeState {
    requests: Vec<RecordedRequest>,
    objects: HashMap<String, Vec<u8>>,
    parts: BTreeMap<u32, Vec<u8>>,
    fail_part: Option<u32>,
    completion_error_document: bool,
}

type Shared = Arc<Mutex<FakeState>>;

pub struct FakeS3 {
    pub endpoint: String,
    state: Shared,
    handle: JoinHandle<()>,
}

impl FakeS3 {
    pub const UPLOAD_ID: &'static str = "fake-upload-1";

    pub async fn start() -> Self {
        let state: Shared = Arc::default();
        let app = Router::new()
            .route("/{bucket}/{*key}", any(handle))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            endpoint: format!("http://{}", addr),
            state,
            handle,
        }
    }

    /// Answer the given part number with a 500
    pub fn fail_part(&self, part_number: u32) {
        self.state.lock().unwrap().fail_part = Some(part_number);
    }

    /// Answer the completion call with 200 and an `<Error>` body
    pub fn fail_completion_with_error_document(&self) {
        self.state.lock().unwrap().completion_error_document = true;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }
}

impl Drop for FakeS3 {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn xml(status: StatusCode, body: String) -> Response {
    (status, [("Content-Type", "application/xml")], body).into_response()
}

async fn handle(
    State(state): State<Shared>,
    method: Method,
    Path((_bucket, key)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.lock().unwrap();
    state.requests.push(RecordedRequest {
        method: method.to_string(),
        key: key.clone(),
        query: query.clone(),
        body: body.to_vec(),
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    });

    let part_number = query.get("partNumber").and_then(|n| n.parse::<u32>().ok());
    let in_upload = query.contains_key("uploadId");

    match (method, part_number) {
        (Method::POST, _) if query.contains_key("uploads") => {
            state.parts.clear();
            xml(
                StatusCode::OK,
                format!(
                    "<InitiateMultipartUploadResult><Bucket>b</Bucket><Key>{}</Key><UploadId>{}</UploadId></InitiateMultipartUploadResult>",
                    key,
                    FakeS3::UPLOAD_ID
                ),
            )
        }
        (Method::PUT, Some(n)) if in_upload => {
            if state.fail_part == Some(n) {
                return xml(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "<Error><Code>InternalError</Code></Error>".to_string(),
                );
            }
            state.parts.insert(n, body.to_vec());
            (StatusCode::OK, [("ETag", format!("\"etag-{}\"", n))]).into_response()
        }
        (Method::POST, _) if in_upload => {
            if state.completion_error_document {
                return xml(
                    StatusCode::OK,
                    "<Error><Code>InternalError</Code><Message>We encountered an internal error.</Message></Error>"
                        .to_string(),
                );
            }
            let assembled: Vec<u8> = std::mem::take(&mut state.parts).into_values().flatten().collect();
            state.objects.insert(key.clone(), assembled);
            xml(
                StatusCode::OK,
                format!("<CompleteMultipartUploadResult><Key>{}</Key></CompleteMultipartUploadResult>", key),
            )
        }
        (Method::DELETE, _) if in_upload => {
            state.parts.clear();
            StatusCode::NO_CONTENT.into_response()
        }
        (Method::PUT, None) => {
            state.objects.insert(key, body.to_vec());
            (StatusCode::OK, [("ETag", "\"etag\"".to_string())]).into_response()
        }
        (Method::GET, _) => match state.objects.get(&key) {
            Some(data) => (StatusCode::OK, data.clone()).into_response(),
            None => xml(StatusCode::NOT_FOUND, "<Error><Code>NoSuchKey</Code></Error>".to_string()),
        },
        (Method::DELETE, _) => match state.objects.remove(&key) {
            Some(_) => StatusCode::NO_CONTENT.into_response(),
            None => xml(StatusCode::NOT_FOUND, "<Error><Code>NoSuchKey</Code></Error>".to_string()),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}
