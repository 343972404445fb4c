use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;
use tracing::warn;

type TryHandle = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const FAMILIES: &[TryHandle] = &[
    handlers::core::try_handle,
    handlers::setup::try_handle,
    handlers::school::try_handle,
    handlers::classes::try_handle,
    handlers::students::try_handle,
    handlers::subjects::try_handle,
    handlers::objectives::try_handle,
    handlers::scores::try_handle,
    handlers::extras::try_handle,
    handlers::calc::try_handle,
    handlers::reports::try_handle,
    handlers::backup::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    for try_handle in FAMILIES {
        if let Some(resp) = try_handle(state, &req) {
            return resp;
        }
    }

    warn!(method = %req.method, "unknown method");
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
