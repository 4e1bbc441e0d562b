use crate::config::{Config, RegistryBackend};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use opalio_core::messaging::{service, PublishNotification, RemoteError};
use opalio_core::storage::fragment_store::{
    method, RetrieveLocalObjectRequest, StoreLocalObjectRequest,
};
use opalio_core::{
    FragmentMap, FragmentStore, HandlerRegistry, HttpMessaging, LockManager, Messaging, NodeInfo,
    ObjectId, ObjectStore, OpalError, PermissiveHandler, Publisher, RedisRegistry, Registry,
    Result, RoutingPublisher, StaticRegistry, StoredObject,
};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct ServerState {
    pub node: NodeInfo,
    pub fragment_store: Arc<FragmentStore>,
    pub registry: Arc<dyn Registry>,
    /// Object id to hosting addresses, fed by publish/unpublish
    /// announcements routed to this node.
    pub publications: Mutex<HashMap<ObjectId, HashSet<String>>>,
}

#[derive(Debug, Deserialize)]
struct StoreObjectQuery {
    #[serde(default = "default_coder")]
    coder: String,
    #[serde(default = "default_object_type")]
    object_type: String,
}

fn default_coder() -> String {
    "reed-solomon/5/3".to_string()
}

fn default_object_type() -> String {
    "blob".to_string()
}

pub async fn run_server(config: Config) -> Result<()> {
    let node_id = config.node.effective_node_id();
    let address = config.node.effective_address();
    let node = NodeInfo::healthy(&node_id, &address);

    let registry: Arc<dyn Registry> = match config.registry.backend {
        RegistryBackend::Redis => {
            let redis_config = config.registry.redis.as_ref().ok_or_else(|| {
                OpalError::Config("redis configuration is required for redis backend".to_string())
            })?;
            Arc::new(
                RedisRegistry::new(&redis_config.url, config.registry.namespace_or_default())
                    .await?,
            )
        }
        RegistryBackend::Standalone => Arc::new(StaticRegistry::new(vec![node.clone()])),
    };

    let messaging: Arc<dyn Messaging> = Arc::new(HttpMessaging::new(registry.clone()));
    let publisher: Arc<dyn Publisher> = Arc::new(RoutingPublisher::new(messaging.clone()));

    let mut handlers = HandlerRegistry::new();
    for object_type in &config.object_types {
        handlers.register(PermissiveHandler::new(object_type));
    }

    let store = ObjectStore::open(
        config.storage.data_dir.clone(),
        config.storage.capacity_bytes,
        address.clone(),
        handlers,
        publisher,
        Arc::new(LockManager::new()),
    )?;
    let fragment_store = Arc::new(FragmentStore::new(store, messaging));

    registry.register_node(&node).await?;

    let state = Arc::new(ServerState {
        node: node.clone(),
        fragment_store,
        registry: registry.clone(),
        publications: Mutex::new(HashMap::new()),
    });

    // Heartbeat: node registrations expire unless refreshed.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            if let Err(error) = registry.register_node(&node).await {
                tracing::warn!("Failed to refresh node registration: {}", error);
            }
        }
    });

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/v1/objects", post(store_object))
        .route("/v1/objects/:object_id", get(get_object))
        .route("/v1/objects/:object_id/retrieve", post(retrieve_object))
        .route(
            "/internal/v1/services/:service/:method",
            post(service_dispatch),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.node.bind_addr).await?;
    tracing::info!("Server listening on {}", config.node.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let response = serde_json::json!({
        "node_id": state.node.node_id,
        "address": state.node.address,
        "status": state.node.status,
        "time": chrono::Utc::now().to_rfc3339(),
    });

    (StatusCode::OK, axum::Json(response))
}

/// Store the request body as a fragmented object homed on this node.
async fn store_object(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<StoreObjectQuery>,
    body: Bytes,
) -> Response {
    let request = StoreLocalObjectRequest {
        erasure_coder: query.coder,
        object: StoredObject::new(&query.object_type, body),
    };

    match state.fragment_store.store_local_object(request).await {
        Ok(map) => (StatusCode::CREATED, axum::Json(map)).into_response(),
        Err(error) => error_response(&error),
    }
}

/// Serve an object hosted locally.
async fn get_object(
    State(state): State<Arc<ServerState>>,
    Path(object_id): Path<String>,
) -> Response {
    let object_id: ObjectId = match object_id.parse() {
        Ok(id) => id,
        Err(error) => return error_response(&error),
    };

    match state.fragment_store.retrieve_local_object(object_id).await {
        Ok(object) if object.is_deleted() => error_response(&OpalError::DeletedObject(object_id)),
        Ok(object) => (StatusCode::OK, object.data).into_response(),
        Err(error) => error_response(&error),
    }
}

/// Fetch a fragmented object from the cluster, given its fragment map.
async fn retrieve_object(
    State(state): State<Arc<ServerState>>,
    Path(object_id): Path<String>,
    axum::Json(map): axum::Json<FragmentMap>,
) -> Response {
    let object_id: ObjectId = match object_id.parse() {
        Ok(id) => id,
        Err(error) => return error_response(&error),
    };
    if map.object_id != object_id {
        return error_response(&OpalError::InvalidRequest(
            "fragment map does not describe the requested object".to_string(),
        ));
    }

    match state.fragment_store.retrieve_remote_object(&map).await {
        Ok(object) => (StatusCode::OK, object.data).into_response(),
        Err(error) => error_response(&error),
    }
}

async fn service_dispatch(
    State(state): State<Arc<ServerState>>,
    Path((service_name, method_name)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    match handle_service(&state, &service_name, &method_name, body).await {
        Ok(reply) => (StatusCode::OK, reply).into_response(),
        Err(error) => {
            tracing::debug!(
                service = %service_name,
                method = %method_name,
                error = %error,
                "service request failed"
            );
            error_response(&error)
        }
    }
}

async fn handle_service(
    state: &Arc<ServerState>,
    service_name: &str,
    method_name: &str,
    body: Bytes,
) -> Result<Bytes> {
    match (service_name, method_name) {
        (service::FRAGMENTED_OBJECT, method::STORE_LOCAL_OBJECT) => {
            let request: StoreLocalObjectRequest = serde_json::from_slice(&body)?;
            let map = state.fragment_store.store_local_object(request).await?;
            Ok(map.to_wire())
        }
        (service::FRAGMENTED_OBJECT, method::RETRIEVE_LOCAL_OBJECT) => {
            let request: RetrieveLocalObjectRequest = serde_json::from_slice(&body)?;
            let object = state
                .fragment_store
                .retrieve_local_object(request.object_id)
                .await?;
            Ok(Bytes::from(serde_json::to_vec(&object)?))
        }
        (service::FRAGMENTED_OBJECT, method::STORE_FRAGMENT) => {
            let fragment: StoredObject = serde_json::from_slice(&body)?;
            let object_id = state.fragment_store.store_fragment(fragment).await?;
            Ok(Bytes::from(object_id.to_string()))
        }
        (service::PUBLISH_DAEMON, "publish") => {
            let notification: PublishNotification = serde_json::from_slice(&body)?;
            let mut publications = state.publications.lock().await;
            publications
                .entry(notification.object_id)
                .or_default()
                .insert(notification.node_address);
            Ok(Bytes::new())
        }
        (service::PUBLISH_DAEMON, "unpublish") => {
            let notification: PublishNotification = serde_json::from_slice(&body)?;
            let mut publications = state.publications.lock().await;
            if let Some(addresses) = publications.get_mut(&notification.object_id) {
                addresses.remove(&notification.node_address);
                if addresses.is_empty() {
                    publications.remove(&notification.object_id);
                }
            }
            Ok(Bytes::new())
        }
        _ => Err(OpalError::InvalidRequest(format!(
            "no such service method: {}/{}",
            service_name, method_name
        ))),
    }
}

fn error_response(error: &OpalError) -> Response {
    let status = match error {
        OpalError::NotFound(_) => StatusCode::NOT_FOUND,
        OpalError::DeletedObject(_) => StatusCode::GONE,
        OpalError::ObjectExists(_) => StatusCode::CONFLICT,
        OpalError::NoSpace { .. } => StatusCode::INSUFFICIENT_STORAGE,
        OpalError::UnacceptableObject(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OpalError::InvalidObject(_)
        | OpalError::InvalidRequest(_)
        | OpalError::Serialization(_)
        | OpalError::UnsupportedAlgorithm(_) => StatusCode::BAD_REQUEST,
        OpalError::NotRecoverable(_) | OpalError::InsufficientFragments { .. } => {
            StatusCode::BAD_GATEWAY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (status, axum::Json(RemoteError::from_error(error))).into_response()
}
