use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::accel::{capability, Capability};
use crate::codec::{self, RawImage};
use crate::config::AppConfig;
use crate::enhancer::{Enhancer, EnhancerConfig};
use crate::error::EnhanceError;
use crate::models::{catalog, ModelResolver, ScaleFactor};

/// Upscaled payloads are large; the axum default multipart limit is far too
/// small for photos.
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

const DEFAULT_SCALE: u32 = 4;
const DEFAULT_TILE: u32 = 0;

#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: AppConfig,
    resolver: Arc<ModelResolver>,
    capability: Capability,
}

impl AppState {
    pub fn new(config: AppConfig, weights_dir: PathBuf) -> Self {
        let cap = capability(config.inference.accelerator);
        Self {
            inner: Arc::new(AppStateInner {
                config,
                resolver: Arc::new(ModelResolver::new(weights_dir)),
                capability: cap,
            }),
        }
    }

    pub fn resolver(&self) -> &Arc<ModelResolver> {
        &self.inner.resolver
    }

    pub fn capability(&self) -> Capability {
        self.inner.capability
    }
}

/// Response envelope for `/api/enhance`. Handled failures keep HTTP 200 and
/// report through `success`/`error`; clients branch on the body, not the
/// status line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhanceResponse {
    pub success: bool,
    pub message: String,
    pub original_dimensions: Option<String>,
    pub enhanced_dimensions: Option<String>,
    pub enhanced_image_base64: Option<String>,
    pub error: Option<String>,
}

impl EnhanceResponse {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: "Enhancement failed".to_string(),
            original_dimensions: None,
            enhanced_dimensions: None,
            enhanced_image_base64: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InfoResponse {
    pub scale_options: Vec<u32>,
    pub default_tile: u32,
    pub supported_formats: Vec<String>,
    pub models_available: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceMetadata {
    pub message: String,
    pub version: String,
    pub description: String,
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/api/enhance", post(enhance))
        .route("/api/info", get(info_handler))
        .route("/api/health", get(health))
        .route("/", get(root))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        message: "Image Enhancement API is running".to_string(),
    })
}

async fn info_handler() -> Json<InfoResponse> {
    let models_available = catalog()
        .iter()
        .map(|spec| (spec.scale.to_string(), spec.filename.to_string()))
        .collect();

    Json(InfoResponse {
        scale_options: ScaleFactor::ALL.iter().map(|s| s.factor()).collect(),
        default_tile: DEFAULT_TILE,
        supported_formats: vec!["PNG".to_string(), "JPG".to_string(), "JPEG".to_string()],
        models_available,
    })
}

async fn root() -> Json<ServiceMetadata> {
    Json(ServiceMetadata {
        message: "AI Image Enhancement API".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: "Real-ESRGAN based image enhancement service".to_string(),
    })
}

struct EnhanceParams {
    image_bytes: Vec<u8>,
    scale: ScaleFactor,
    tile: u32,
}

async fn enhance(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Json<EnhanceResponse> {
    let request_id = Uuid::new_v4();

    let params = match read_enhance_request(multipart).await {
        Ok(params) => params,
        Err(err) => {
            warn!(%request_id, kind = err.kind(), error = %err, "Enhancement request rejected");
            return Json(EnhanceResponse::failure(err.to_string()));
        }
    };

    info!(
        %request_id,
        scale = %params.scale,
        tile = params.tile,
        bytes = params.image_bytes.len(),
        "Enhancement request accepted"
    );

    let resolver = Arc::clone(state.resolver());
    let capability = state.capability();
    let inference = state.inner.config.inference.clone();
    let span = tracing::info_span!("enhance", %request_id);

    let outcome = tokio::task::spawn_blocking(move || {
        let _guard = span.enter();
        run_enhancement(&resolver, capability, inference.tile_pad, inference.pre_pad, params)
    })
    .await;

    match outcome {
        Ok(Ok(result)) => {
            info!(
                %request_id,
                original = %result.original_dimensions,
                enhanced = %result.enhanced_dimensions,
                "Enhancement completed"
            );
            Json(EnhanceResponse {
                success: true,
                message: "Image enhanced successfully".to_string(),
                original_dimensions: Some(result.original_dimensions),
                enhanced_dimensions: Some(result.enhanced_dimensions),
                enhanced_image_base64: Some(result.data_url),
                error: None,
            })
        }
        Ok(Err(err)) => {
            warn!(%request_id, kind = err.kind(), error = %err, "Enhancement failed");
            Json(EnhanceResponse::failure(err.to_string()))
        }
        Err(join_err) => {
            error!(%request_id, error = %join_err, "Enhancement task panicked");
            Json(EnhanceResponse::failure("enhancement task failed"))
        }
    }
}

/// Pull the form fields out of the multipart stream and validate them.
/// Everything here runs before any model resolution: a rejected request
/// never touches the weights cache or the network.
async fn read_enhance_request(mut multipart: Multipart) -> Result<EnhanceParams, EnhanceError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut file_content_type: Option<String> = None;
    let mut scale_raw: Option<String> = None;
    let mut tile_raw: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                return Err(EnhanceError::Validation(format!(
                    "malformed multipart request: {err}"
                )))
            }
        };

        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                file_content_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(|err| {
                    EnhanceError::Validation(format!("failed to read uploaded file: {err}"))
                })?;
                file_bytes = Some(bytes.to_vec());
            }
            Some("scale") => {
                scale_raw = Some(field.text().await.map_err(|err| {
                    EnhanceError::Validation(format!("failed to read scale field: {err}"))
                })?);
            }
            Some("tile") => {
                tile_raw = Some(field.text().await.map_err(|err| {
                    EnhanceError::Validation(format!("failed to read tile field: {err}"))
                })?);
            }
            _ => {}
        }
    }

    let image_bytes =
        file_bytes.ok_or_else(|| EnhanceError::Validation("missing file field".to_string()))?;

    let is_image = file_content_type
        .as_deref()
        .is_some_and(|ct| ct.starts_with("image/"));
    if !is_image {
        return Err(EnhanceError::Validation(
            "Uploaded file is not an image".to_string(),
        ));
    }

    if image_bytes.is_empty() {
        return Err(EnhanceError::Validation(
            "Uploaded file is empty".to_string(),
        ));
    }

    let scale_value = match scale_raw {
        Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
            EnhanceError::Validation(format!("invalid scale value: {raw:?}"))
        })?,
        None => DEFAULT_SCALE,
    };
    let scale = ScaleFactor::try_from(scale_value)?;

    let tile = match tile_raw {
        Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
            EnhanceError::Validation(format!("invalid tile value: {raw:?}"))
        })?,
        None => DEFAULT_TILE,
    };

    Ok(EnhanceParams {
        image_bytes,
        scale,
        tile,
    })
}

struct EnhanceOutcome {
    original_dimensions: String,
    enhanced_dimensions: String,
    data_url: String,
}

/// The blocking portion of a request: decode, resolve weights, construct the
/// enhancer, infer, encode. The enhancer is released on every exit path
/// before the result propagates, so weights and accelerator buffers never
/// outlive the request.
fn run_enhancement(
    resolver: &ModelResolver,
    capability: Capability,
    tile_pad: u32,
    pre_pad: u32,
    params: EnhanceParams,
) -> Result<EnhanceOutcome, EnhanceError> {
    let original = codec::decode_image(&params.image_bytes)?;
    let model_path = resolver.resolve(params.scale)?;

    let enhancer_config = EnhancerConfig {
        scale: params.scale,
        tile_size: params.tile,
        tile_pad,
        pre_pad,
        precision: capability.precision(),
    };
    let mut enhancer = Enhancer::construct(&model_path, enhancer_config)?;

    let result = enhance_and_encode(&mut enhancer, &original);
    enhancer.release();
    result
}

fn enhance_and_encode(
    enhancer: &mut Enhancer,
    original: &RawImage,
) -> Result<EnhanceOutcome, EnhanceError> {
    let enhanced = enhancer.infer(original)?;
    let png = codec::encode_png(&enhanced)?;

    Ok(EnhanceOutcome {
        original_dimensions: original.dimensions(),
        enhanced_dimensions: enhanced.dimensions(),
        data_url: codec::to_data_url(&png),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::AcceleratorMode;
    use crate::models::spec_for;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::path::PathBuf;
    use tower::{Service, ServiceExt};

    const BOUNDARY: &str = "pixlift-test-boundary";

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}-{}-{timestamp}", std::process::id()))
    }

    fn test_state() -> AppState {
        let mut config = AppConfig::default();
        config.inference.accelerator = AcceleratorMode::ForceCpu;
        AppState::new(config, unique_temp_dir("pixlift-weights"))
    }

    fn test_router() -> Router {
        app_router(test_state())
    }

    async fn send_request(router: &mut Router, request: Request<Body>) -> axum::response::Response {
        router
            .as_service()
            .ready()
            .await
            .unwrap()
            .call(request)
            .await
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    fn multipart_field(name: &str, value: &str) -> String {
        format!(
            "--{BOUNDARY}\r\ncontent-disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
        )
    }

    fn multipart_file(content_type: &str, bytes: &[u8]) -> Vec<u8> {
        let mut body = format!(
            "--{BOUNDARY}\r\ncontent-disposition: form-data; name=\"file\"; filename=\"test.png\"\r\ncontent-type: {content_type}\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
        body
    }

    fn multipart_request(mut body: Vec<u8>, extra_fields: &[(&str, &str)]) -> Request<Body> {
        for (name, value) in extra_fields {
            body.extend_from_slice(multipart_field(name, value).as_bytes());
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/enhance")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let mut app = test_router();
        let req = Request::builder()
            .uri("/api/health")
            .body(Body::empty())
            .unwrap();

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["message"], "Image Enhancement API is running");
    }

    #[tokio::test]
    async fn test_info_endpoint() {
        let mut app = test_router();
        let req = Request::builder()
            .uri("/api/info")
            .body(Body::empty())
            .unwrap();

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["scale_options"], serde_json::json!([2, 4, 8]));
        assert_eq!(json["default_tile"], 0);
        assert_eq!(
            json["supported_formats"],
            serde_json::json!(["PNG", "JPG", "JPEG"])
        );
        for scale in ScaleFactor::ALL {
            let filename = &json["models_available"][scale.to_string()];
            assert_eq!(filename, spec_for(scale).filename);
        }
    }

    #[tokio::test]
    async fn test_root_metadata() {
        let mut app = test_router();
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["message"], "AI Image Enhancement API");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_enhance_rejects_non_image_upload() {
        let state = test_state();
        let mut app = app_router(state.clone());

        let body = multipart_file("text/plain", b"not an image");
        let resp = send_request(&mut app, multipart_request(body, &[])).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "Enhancement failed");
        assert_eq!(json["error"], "Uploaded file is not an image");
        assert_eq!(state.resolver().resolve_calls(), 0);
    }

    #[tokio::test]
    async fn test_enhance_rejects_empty_upload() {
        let state = test_state();
        let mut app = app_router(state.clone());

        let body = multipart_file("image/png", b"");
        let resp = send_request(&mut app, multipart_request(body, &[])).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Uploaded file is empty");
        assert_eq!(state.resolver().resolve_calls(), 0);
    }

    #[tokio::test]
    async fn test_enhance_rejects_unsupported_scale() {
        let state = test_state();
        let mut app = app_router(state.clone());

        let body = multipart_file("image/png", b"fake png bytes");
        let resp = send_request(&mut app, multipart_request(body, &[("scale", "3")])).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "Unsupported scale 3 (supported: 2, 4, 8)");
        assert_eq!(state.resolver().resolve_calls(), 0);
        assert_eq!(state.resolver().downloads(), 0);
    }

    #[tokio::test]
    async fn test_enhance_rejects_non_numeric_scale() {
        let mut app = test_router();

        let body = multipart_file("image/png", b"fake png bytes");
        let resp = send_request(&mut app, multipart_request(body, &[("scale", "big")])).await;

        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("invalid scale"));
    }

    #[tokio::test]
    async fn test_enhance_rejects_missing_file_field() {
        let state = test_state();
        let mut app = app_router(state.clone());

        let resp = send_request(&mut app, multipart_request(Vec::new(), &[("scale", "4")])).await;

        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error"], "missing file field");
        assert_eq!(state.resolver().resolve_calls(), 0);
    }

    fn tiny_png() -> Vec<u8> {
        let img = crate::codec::RawImage {
            data: vec![200u8; 4 * 4 * 3],
            width: 4,
            height: 4,
        };
        codec::encode_png(&img).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_enhance_download_failure_yields_fetch_error_envelope() {
        // A regular file where the weights directory should be makes the
        // download fail before any network traffic.
        let dir = unique_temp_dir("pixlift-blocked");
        std::fs::create_dir_all(&dir).unwrap();
        let blocked = dir.join("weights");
        std::fs::write(&blocked, b"not a directory").unwrap();

        let mut config = AppConfig::default();
        config.inference.accelerator = AcceleratorMode::ForceCpu;
        let state = AppState::new(config, blocked);
        let mut app = app_router(state.clone());

        let body = multipart_file("image/png", &tiny_png());
        let resp = send_request(&mut app, multipart_request(body, &[("scale", "2")])).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "Enhancement failed");
        assert!(json["error"].as_str().unwrap().contains("fetch"));
        assert!(json["enhanced_image_base64"].is_null());
        assert_eq!(state.resolver().resolve_calls(), 1);
        assert_eq!(state.resolver().downloads(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_enhance_undecodable_image_fails_before_model_resolution() {
        let state = test_state();
        let mut app = app_router(state.clone());

        // Valid multipart, valid scale, but the payload is not decodable.
        let body = multipart_file("image/png", b"definitely not a png");
        let resp = send_request(&mut app, multipart_request(body, &[("scale", "2")])).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let json = body_json(resp).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "Enhancement failed");
        assert!(json["error"].as_str().is_some());
        assert_eq!(state.resolver().resolve_calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_api_route_is_not_found() {
        let mut app = test_router();
        let req = Request::builder()
            .uri("/api/unknown")
            .body(Body::empty())
            .unwrap();

        let resp = send_request(&mut app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn failure_envelope_shape() {
        let resp = EnhanceResponse::failure("boom");
        assert!(!resp.success);
        assert_eq!(resp.message, "Enhancement failed");
        assert_eq!(resp.error.as_deref(), Some("boom"));
        assert!(resp.original_dimensions.is_none());
        assert!(resp.enhanced_image_base64.is_none());
    }
}
