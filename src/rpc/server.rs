//! HTTP wiring for the RPC surface: unary methods as `POST /v1/<Method>`
//! JSON endpoints, server-streaming methods as SSE responses fed from the
//! service's receiver channels.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use axum::routing::post;
use axum::{Json, Router};
use futures::stream::{BoxStream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use super::messages::*;
use super::service::DepiService;
use crate::error::Result;

type SseResponse =
    Sse<KeepAliveStream<BoxStream<'static, std::result::Result<Event, Infallible>>>>;

fn sse_stream<T: Serialize + Send + 'static>(rx: mpsc::Receiver<T>) -> SseResponse {
    let stream = ReceiverStream::new(rx)
        .map(|item| {
            let event = Event::default()
                .json_data(&item)
                .unwrap_or_else(|err| Event::default().data(format!("encoding error: {err}")));
            Ok(event)
        })
        .boxed();
    Sse::new(stream).keep_alive(KeepAlive::default())
}

macro_rules! unary {
    ($name:ident, $method:ident, $req:ty, $resp:ty) => {
        async fn $name(
            State(service): State<Arc<DepiService>>,
            Json(req): Json<$req>,
        ) -> Json<$resp> {
            Json(service.$method(req).await)
        }
    };
}

macro_rules! streaming {
    ($name:ident, $method:ident, $req:ty) => {
        async fn $name(
            State(service): State<Arc<DepiService>>,
            Json(req): Json<$req>,
        ) -> SseResponse {
            sse_stream(service.$method(req).await)
        }
    };
}

unary!(login, login, LoginRequest, LoginResponse);
unary!(login_with_token, login_with_token, LoginWithTokenRequest, LoginResponse);
unary!(logout, logout, SessionRequest, GenericResponse);
unary!(ping, ping, SessionRequest, GenericResponse);
unary!(get_branch_list, get_branch_list, SessionRequest, GetBranchListResponse);
unary!(current_branch, current_branch, SessionRequest, CurrentBranchResponse);
unary!(set_branch, set_branch, SetBranchRequest, GenericResponse);
unary!(create_branch, create_branch, CreateBranchRequest, GenericResponse);
unary!(create_tag, create_tag, CreateTagRequest, GenericResponse);
unary!(
    get_resource_groups_for_tag,
    get_resource_groups_for_tag,
    GetResourceGroupsForTagRequest,
    GetResourceGroupsResponse
);
unary!(add_resource_group, add_resource_group, AddResourceGroupRequest, GenericResponse);
unary!(edit_resource_group, edit_resource_group, EditResourceGroupRequest, GenericResponse);
unary!(
    remove_resource_group,
    remove_resource_group,
    RemoveResourceGroupRequest,
    GenericResponse
);
unary!(get_resource_groups, get_resource_groups, SessionRequest, GetResourceGroupsResponse);
unary!(
    get_last_known_version,
    get_last_known_version,
    GetLastKnownVersionRequest,
    GetLastKnownVersionResponse
);
unary!(add_resource, add_resource, AddResourceRequest, GenericResponse);
unary!(get_resources, get_resources, GetResourcesRequest, GetResourcesResponse);
unary!(link_resources, link_resources, LinkResourcesRequest, GenericResponse);
unary!(unlink_resources, unlink_resources, LinkResourcesRequest, GenericResponse);
unary!(get_links, get_links, GetLinksRequest, GetLinksResponse);
unary!(
    get_dependency_graph,
    get_dependency_graph,
    GetDependencyGraphRequest,
    GetDependencyGraphResponse
);
unary!(
    update_resource_group,
    update_resource_group,
    UpdateResourceGroupRequest,
    GenericResponse
);
unary!(mark_links_clean, mark_links_clean, MarkLinksCleanRequest, GenericResponse);
unary!(
    mark_inferred_dirtiness_clean,
    mark_inferred_dirtiness_clean,
    MarkInferredDirtinessCleanRequest,
    GenericResponse
);
unary!(get_dirty_links, get_dirty_links, GetDirtyLinksRequest, GetDirtyLinksResponse);
unary!(
    add_resources_to_blackboard,
    add_resources_to_blackboard,
    AddResourcesToBlackboardRequest,
    GenericResponse
);
unary!(
    remove_resources_from_blackboard,
    remove_resources_from_blackboard,
    RemoveResourcesFromBlackboardRequest,
    GenericResponse
);
unary!(
    link_blackboard_resources,
    link_blackboard_resources,
    BlackboardLinksRequest,
    GenericResponse
);
unary!(
    unlink_blackboard_resources,
    unlink_blackboard_resources,
    BlackboardLinksRequest,
    GenericResponse
);
unary!(save_blackboard, save_blackboard, SessionRequest, GenericResponse);
unary!(clear_blackboard, clear_blackboard, SessionRequest, GenericResponse);
unary!(
    get_blackboard_resources,
    get_blackboard_resources,
    SessionRequest,
    GetBlackboardResourcesResponse
);
unary!(unwatch_blackboard, unwatch_blackboard, SessionRequest, GenericResponse);
unary!(
    watch_resource_group,
    watch_resource_group,
    WatchResourceGroupRequest,
    GenericResponse
);
unary!(
    unwatch_resource_group,
    unwatch_resource_group,
    WatchResourceGroupRequest,
    GenericResponse
);
unary!(unwatch_depi, unwatch_depi, SessionRequest, GenericResponse);
unary!(update_depi, update_depi, UpdateDepiRequest, GenericResponse);
unary!(dump_database, dump_database, SessionRequest, GenericResponse);

streaming!(get_resources_stream, get_resources_stream, GetResourcesRequest);
streaming!(get_links_stream, get_links_stream, GetLinksRequest);
streaming!(get_all_links_stream, get_all_links_stream, SessionRequest);
streaming!(get_dirty_links_stream, get_dirty_links_stream, GetDirtyLinksRequest);
streaming!(watch_blackboard, watch_blackboard, SessionRequest);
streaming!(watch_depi, watch_depi, SessionRequest);
streaming!(register_callback, register_callback, SessionRequest);

pub fn router(service: Arc<DepiService>) -> Router {
    Router::new()
        .route("/v1/Login", post(login))
        .route("/v1/LoginWithToken", post(login_with_token))
        .route("/v1/Logout", post(logout))
        .route("/v1/Ping", post(ping))
        .route("/v1/GetBranchList", post(get_branch_list))
        .route("/v1/CurrentBranch", post(current_branch))
        .route("/v1/SetBranch", post(set_branch))
        .route("/v1/CreateBranch", post(create_branch))
        .route("/v1/CreateTag", post(create_tag))
        .route("/v1/GetResourceGroupsForTag", post(get_resource_groups_for_tag))
        .route("/v1/AddResourceGroup", post(add_resource_group))
        .route("/v1/EditResourceGroup", post(edit_resource_group))
        .route("/v1/RemoveResourceGroup", post(remove_resource_group))
        .route("/v1/GetResourceGroups", post(get_resource_groups))
        .route("/v1/GetLastKnownVersion", post(get_last_known_version))
        .route("/v1/AddResource", post(add_resource))
        .route("/v1/GetResources", post(get_resources))
        .route("/v1/GetResourcesAsStream", post(get_resources_stream))
        .route("/v1/LinkResources", post(link_resources))
        .route("/v1/UnlinkResources", post(unlink_resources))
        .route("/v1/GetLinks", post(get_links))
        .route("/v1/GetLinksAsStream", post(get_links_stream))
        .route("/v1/GetAllLinksAsStream", post(get_all_links_stream))
        .route("/v1/GetDependencyGraph", post(get_dependency_graph))
        .route("/v1/UpdateResourceGroup", post(update_resource_group))
        .route("/v1/MarkLinksClean", post(mark_links_clean))
        .route("/v1/MarkInferredDirtinessClean", post(mark_inferred_dirtiness_clean))
        .route("/v1/GetDirtyLinks", post(get_dirty_links))
        .route("/v1/GetDirtyLinksAsStream", post(get_dirty_links_stream))
        .route("/v1/AddResourcesToBlackboard", post(add_resources_to_blackboard))
        .route(
            "/v1/RemoveResourcesFromBlackboard",
            post(remove_resources_from_blackboard),
        )
        .route("/v1/LinkBlackboardResources", post(link_blackboard_resources))
        .route("/v1/UnlinkBlackboardResources", post(unlink_blackboard_resources))
        .route("/v1/SaveBlackboard", post(save_blackboard))
        .route("/v1/ClearBlackboard", post(clear_blackboard))
        .route("/v1/GetBlackboardResources", post(get_blackboard_resources))
        .route("/v1/WatchBlackboard", post(watch_blackboard))
        .route("/v1/UnwatchBlackboard", post(unwatch_blackboard))
        .route("/v1/WatchResourceGroup", post(watch_resource_group))
        .route("/v1/UnwatchResourceGroup", post(unwatch_resource_group))
        .route("/v1/RegisterCallback", post(register_callback))
        .route("/v1/WatchDepi", post(watch_depi))
        .route("/v1/UnwatchDepi", post(unwatch_depi))
        .route("/v1/UpdateDepi", post(update_depi))
        .route("/v1/DumpDatabase", post(dump_database))
        .with_state(service)
}

/// Bind the configured port and serve until shutdown.
pub async fn serve(service: Arc<DepiService>, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("depi server listening on port {}", port);
    axum::serve(listener, router(service)).await?;
    Ok(())
}
