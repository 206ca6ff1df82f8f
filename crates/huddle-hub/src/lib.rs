//! # huddle-hub
//!
//! Signaling hub for project rooms. Handles:
//! - WebSocket admission (client tokens, project ids, the internal SFU channel)
//! - Room membership and presence
//! - Ordered offer/answer/ICE relay between browsers and the SFU
//! - Relay of editor, whiteboard and file events inside a room

pub mod access;
pub mod client;
pub mod hub;
pub mod ice;
pub mod project_state;

pub use access::{OpenAccess, ProjectAccess};
pub use client::Identity;
pub use hub::{Departure, Hub, HubEvent, HubHandle};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Json, Router,
};
use huddle_common::config::HubConfig;
use huddle_common::error::{HuddleError, HuddleResult};
use huddle_common::protocol::SFU_CHANNEL;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Limits applied to every connection.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub send_queue_capacity: usize,
    pub inbox_capacity: usize,
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_message_bytes: usize,
    pub sfu_token: Option<String>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

impl From<&HubConfig> for HubSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            send_queue_capacity: config.send_queue_capacity,
            inbox_capacity: config.inbox_capacity,
            write_wait: config.write_wait(),
            pong_wait: config.pong_wait(),
            ping_period: config.ping_period(),
            max_message_bytes: config.max_message_bytes,
            sfu_token: config.sfu_token.clone(),
        }
    }
}

/// Shared state of the WebSocket router.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub settings: Arc<HubSettings>,
    pub jwt_secret: Arc<str>,
    pub access: Arc<dyn ProjectAccess>,
}

impl AppState {
    /// Spawn a Hub actor and wrap it for the router.
    pub fn new(settings: HubSettings, jwt_secret: &str, access: Arc<dyn ProjectAccess>) -> Self {
        let hub = Hub::spawn(settings.inbox_capacity);
        Self {
            hub,
            settings: Arc::new(settings),
            jwt_secret: Arc::from(jwt_secret),
            access,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConnectParams {
    auth_token: Option<String>,
    sfu_token: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

/// Build the Hub router: `/ws/{project_id}` and `/health`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/{project_id}", get(ws_handler))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// WebSocket upgrade handler. Rejections happen here, before the Hub sees anything.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(project_id): Path<String>,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> HuddleResult<Response> {
    let identity = resolve_identity(&state, &project_id, &params).await?;
    let hub = state.hub.clone();
    let settings = state.settings.clone();

    Ok(ws
        .max_message_size(settings.max_message_bytes)
        .on_upgrade(move |socket| client::serve(socket, identity, hub, settings)))
}

async fn resolve_identity(
    state: &AppState,
    project_id: &str,
    params: &ConnectParams,
) -> HuddleResult<Identity> {
    if project_id == SFU_CHANNEL {
        if let Some(expected) = &state.settings.sfu_token {
            if params.sfu_token.as_deref() != Some(expected.as_str()) {
                tracing::warn!("SFU connection rejected: bad sfu_token");
                return Err(HuddleError::Forbidden);
            }
        }
        tracing::info!("Internal SFU client is connecting");
        return Ok(Identity::sfu());
    }

    let token = params
        .auth_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(HuddleError::MissingToken)?;
    let claims = huddle_common::auth::validate_token(token, &state.jwt_secret)
        .map_err(|_| HuddleError::InvalidToken)?;
    let project_uuid = project_id
        .parse::<Uuid>()
        .map_err(|_| HuddleError::InvalidProjectId)?;

    let Some(role) = state.access.role(project_uuid, &claims.user_id).await? else {
        tracing::info!(
            user = %claims.username,
            project = %project_id,
            "Connection denied: not a member"
        );
        return Err(HuddleError::NotAMember);
    };

    Ok(Identity {
        user_id: claims.user_id,
        username: claims.username,
        project_id: project_id.to_owned(),
        role,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use huddle_common::auth::Claims;
    use jsonwebtoken::{encode, EncodingKey, Header};

    struct NoMembers;

    #[async_trait]
    impl ProjectAccess for NoMembers {
        async fn role(&self, _project_id: Uuid, _user_id: &str) -> HuddleResult<Option<String>> {
            Ok(None)
        }
    }

    fn state(access: Arc<dyn ProjectAccess>, sfu_token: Option<&str>) -> AppState {
        let settings = HubSettings {
            sfu_token: sfu_token.map(str::to_owned),
            ..HubSettings::default()
        };
        AppState::new(settings, "s3cret", access)
    }

    fn token() -> String {
        let claims = Claims {
            user_id: "u1".into(),
            username: "ada".into(),
            exp: 4_102_444_800,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(b"s3cret")).unwrap()
    }

    fn params(auth_token: Option<String>, sfu_token: Option<&str>) -> ConnectParams {
        ConnectParams {
            auth_token,
            sfu_token: sfu_token.map(str::to_owned),
        }
    }

    #[tokio::test]
    async fn sfu_channel_skips_user_auth() {
        let state = state(Arc::new(OpenAccess), None);
        let identity = resolve_identity(&state, SFU_CHANNEL, &params(None, None))
            .await
            .unwrap();
        assert!(identity.is_sfu());
        assert_eq!(identity.user_id, "sfu");
    }

    #[tokio::test]
    async fn sfu_token_is_checked_when_configured() {
        let state = state(Arc::new(OpenAccess), Some("internal"));
        let denied = resolve_identity(&state, SFU_CHANNEL, &params(None, Some("guess"))).await;
        assert!(matches!(denied, Err(HuddleError::Forbidden)));
        let allowed = resolve_identity(&state, SFU_CHANNEL, &params(None, Some("internal"))).await;
        assert!(allowed.is_ok());
    }

    #[tokio::test]
    async fn clients_are_rejected_in_order_token_then_project_then_membership() {
        let open = state(Arc::new(OpenAccess), None);
        let project = Uuid::new_v4().to_string();

        let missing = resolve_identity(&open, &project, &params(None, None)).await;
        assert!(matches!(missing, Err(HuddleError::MissingToken)));

        let bad = resolve_identity(&open, &project, &params(Some("nope".into()), None)).await;
        assert!(matches!(bad, Err(HuddleError::InvalidToken)));

        let not_uuid = resolve_identity(&open, "lobby", &params(Some(token()), None)).await;
        assert!(matches!(not_uuid, Err(HuddleError::InvalidProjectId)));

        let closed = state(Arc::new(NoMembers), None);
        let outsider = resolve_identity(&closed, &project, &params(Some(token()), None)).await;
        assert!(matches!(outsider, Err(HuddleError::NotAMember)));

        let identity = resolve_identity(&open, &project, &params(Some(token()), None))
            .await
            .unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.role, "editor");
        assert_eq!(identity.project_id, project);
    }
}
