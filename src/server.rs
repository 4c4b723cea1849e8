use crate::classify::LegendEntry;
use crate::config::AppConfig;
use crate::output;
use crate::session::{ChartBar, Session, SessionError, Tooltip};
use crate::types::BackgroundLayer;
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use geo::algorithm::contains::Contains;
use geo::bounding_rect::BoundingRect;
use geo::Point;
use geojson::FeatureCollection;
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::info;

// Wrapper for RTree indexing
pub struct AreaIndex {
    index: usize,
    aabb: AABB<[f64; 2]>,
}

impl RTreeObject for AreaIndex {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

pub struct AppState {
    session: Mutex<Session>,
    tree: RTree<AreaIndex>,
    background: FeatureCollection,
}

impl AppState {
    pub fn new(session: Session, background: &[BackgroundLayer]) -> Self {
        info!("Building spatial index for API...");
        // Units without a bounding rect (empty geometry) are left out of the index
        let tree_items: Vec<AreaIndex> = session
            .features()
            .iter()
            .enumerate()
            .filter_map(|(i, unit)| {
                let rect = unit.geometry.bounding_rect()?;
                Some(AreaIndex {
                    index: i,
                    aabb: AABB::from_corners(
                        [rect.min().x, rect.min().y],
                        [rect.max().x, rect.max().y],
                    ),
                })
            })
            .collect();

        let tree = RTree::bulk_load(tree_items);
        info!("Spatial index built.");

        Self {
            session: Mutex::new(session),
            tree,
            background: output::background_collection(background),
        }
    }

    // Handlers run one at a time against the session
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Deserialize)]
pub struct QueryParams {
    lat: f64,
    lon: f64,
}

#[derive(Deserialize)]
pub struct SelectRequest {
    name: String,
}

#[derive(Serialize)]
pub struct AttributeInfo {
    name: String,
    label: String,
}

#[derive(Serialize)]
pub struct AttributesResponse {
    active: String,
    attributes: Vec<AttributeInfo>,
}

#[derive(Serialize)]
pub struct SelectResponse {
    active: String,
    legend: Vec<LegendEntry>,
}

#[derive(Debug)]
pub struct ApiError(SessionError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            SessionError::UnknownAttribute(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

pub fn router(state: Arc<AppState>, static_dir: Option<&std::path::Path>) -> Router {
    let api = Router::new()
        .route("/api/attributes", get(attributes_handler))
        .route("/api/attribute", post(select_handler))
        .route("/api/features", get(features_handler))
        .route("/api/background", get(background_handler))
        .route("/api/chart", get(chart_handler))
        .route("/api/legend", get(legend_handler))
        .route("/api/query", get(query_handler));

    let app = match static_dir {
        Some(dir) => api.fallback_service(ServeDir::new(dir)),
        None => api,
    };

    app.layer(CorsLayer::permissive()).with_state(state)
}

pub async fn start_server(
    config: AppConfig,
    session: Session,
    background: Vec<BackgroundLayer>,
) -> Result<()> {
    let state = Arc::new(AppState::new(session, &background));

    let port = config.server.port;
    let addr = SocketAddr::from(([127, 0, 0, 1], port));

    info!("Starting server on http://{}", addr);

    let app = router(state, config.server.static_dir.as_deref());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn attributes_handler(State(state): State<Arc<AppState>>) -> Json<AttributesResponse> {
    let session = state.session();
    Json(AttributesResponse {
        active: session.active_attribute().name.clone(),
        attributes: session
            .attributes()
            .iter()
            .map(|a| AttributeInfo {
                name: a.name.clone(),
                label: a.label().to_string(),
            })
            .collect(),
    })
}

async fn select_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SelectRequest>,
) -> Result<Json<SelectResponse>, ApiError> {
    let mut session = state.session();
    let legend = session
        .select_attribute(&request.name)
        .map_err(ApiError)?
        .legend();
    Ok(Json(SelectResponse {
        active: request.name,
        legend,
    }))
}

async fn features_handler(State(state): State<Arc<AppState>>) -> Json<FeatureCollection> {
    Json(output::feature_collection(&state.session()))
}

async fn background_handler(State(state): State<Arc<AppState>>) -> Json<FeatureCollection> {
    Json(state.background.clone())
}

async fn chart_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ChartBar>> {
    Json(state.session().chart_series())
}

async fn legend_handler(State(state): State<Arc<AppState>>) -> Json<Vec<LegendEntry>> {
    Json(state.session().legend())
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<QueryParams>,
) -> Json<Option<Tooltip>> {
    let point = Point::new(params.lon, params.lat);
    let envelope = AABB::from_point([params.lon, params.lat]);

    let session = state.session();
    let candidates = state.tree.locate_in_envelope_intersecting(&envelope);

    for candidate in candidates {
        if let Some(unit) = session.features().get(candidate.index) {
            if unit.geometry.contains(&point) {
                return Json(session.tooltip(candidate.index));
            }
        }
    }

    Json(None)
}
