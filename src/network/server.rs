//! HTTP surface of a node, backed by `NodeService`.

use super::{
    status_for, ChallengeRequest, ChallengeResponse, LastBlockMapResponse, NodeService, ProposalRequest,
};
use crate::base::{Hash, Height, NodeAddress};
use crate::block::BlockMapItemType;
use crate::consensus::{Ballot, StateType};
use crate::error::IsaacError;
use crate::state::Operation;
use actix_web::http::StatusCode;
use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

type Service = web::Data<Arc<NodeService>>;

fn error_response(err: IsaacError) -> HttpResponse {
    let kind = err.kind();
    debug!(error = %err, %kind, "request failed");
    let status = StatusCode::from_u16(status_for(kind)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(json!({ "error": err.to_string(), "kind": kind.to_string() }))
}

fn not_found(what: String) -> HttpResponse {
    HttpResponse::NotFound().json(json!({ "error": format!("{what} not found") }))
}

fn bad_request(reason: String) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({ "error": reason }))
}

fn found<T: Serialize>(value: Option<T>, what: impl FnOnce() -> String) -> HttpResponse {
    match value {
        Some(v) => HttpResponse::Ok().json(v),
        None => not_found(what()),
    }
}

fn respond<T: Serialize>(res: crate::error::Result<Option<T>>, what: impl FnOnce() -> String) -> HttpResponse {
    match res {
        Ok(v) => found(v, what),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct KnownHeight {
    known: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct KnownHash {
    known: Option<String>,
}

async fn receive_ballots(ballots: web::Json<Vec<Ballot>>, service: Service) -> impl Responder {
    let queued = service.receive_ballots(ballots.into_inner());
    HttpResponse::Ok().json(json!({ "queued": queued }))
}

async fn get_operation(hash: web::Path<String>, service: Service) -> impl Responder {
    let hash: Hash = match hash.parse() {
        Ok(h) => h,
        Err(e) => return bad_request(format!("{e}")),
    };
    respond(service.operation(&hash), || format!("operation {hash}"))
}

async fn send_operation(operation: web::Json<Operation>, service: Service) -> impl Responder {
    match service.receive_operation(operation.into_inner()) {
        Ok(added) => HttpResponse::Ok().json(json!({ "added": added })),
        Err(e) => error_response(e),
    }
}

async fn get_proposal(hash: web::Path<String>, service: Service) -> impl Responder {
    let hash: Hash = match hash.parse() {
        Ok(h) => h,
        Err(e) => return bad_request(format!("{e}")),
    };
    respond(service.proposal(&hash), || format!("proposal {hash}"))
}

async fn request_proposal(req: web::Json<ProposalRequest>, service: Service) -> impl Responder {
    let req = req.into_inner();
    respond(service.request_proposal(req.point, &req.proposer), || {
        format!("proposal at {} by {}", req.point, req.proposer)
    })
}

async fn last_blockmap(query: web::Query<KnownHash>, service: Service) -> impl Responder {
    let known = match query.known.as_deref().map(str::parse::<Hash>).transpose() {
        Ok(k) => k,
        Err(e) => return bad_request(format!("{e}")),
    };
    match service.last_blockmap(known) {
        Ok((blockmap, updated)) => HttpResponse::Ok().json(LastBlockMapResponse { blockmap, updated }),
        Err(e) => error_response(e),
    }
}

async fn get_blockmap(height: web::Path<i64>, service: Service) -> impl Responder {
    let height = Height::new(height.into_inner());
    respond(service.blockmap(height), || format!("blockmap {height}"))
}

async fn get_blockmap_item(path: web::Path<(i64, String)>, service: Service) -> impl Responder {
    let (height, item_type) = path.into_inner();
    let height = Height::new(height);
    let item_type: BlockMapItemType = match item_type.parse() {
        Ok(t) => t,
        Err(e) => return bad_request(format!("{e}")),
    };
    match service.blockmap_item(height, item_type) {
        Ok(Some(bytes)) => HttpResponse::Ok().content_type("application/octet-stream").body(bytes),
        Ok(None) => not_found(format!("{item_type} of {height}")),
        Err(e) => error_response(e),
    }
}

async fn last_suffrage_proof(query: web::Query<KnownHeight>, service: Service) -> impl Responder {
    let known = query.known.map(Height::new);
    match service.last_suffrage_proof(known) {
        Ok(Some(proof)) => HttpResponse::Ok().json(proof),
        Ok(None) => HttpResponse::NoContent().finish(),
        Err(e) => error_response(e),
    }
}

async fn get_suffrage_proof(height: web::Path<i64>, service: Service) -> impl Responder {
    let height = Height::new(height.into_inner());
    respond(service.suffrage_proof(height), || format!("suffrage proof {height}"))
}

async fn node_challenge(req: web::Json<ChallengeRequest>, service: Service) -> impl Responder {
    let input = match hex::decode(&req.input) {
        Ok(b) => b,
        Err(e) => return bad_request(format!("challenge input: {e}")),
    };
    match service.node_challenge(&input) {
        Ok(signature) => HttpResponse::Ok().json(ChallengeResponse { signature }),
        Err(e) => error_response(e),
    }
}

async fn sync_sources(service: Service) -> impl Responder {
    HttpResponse::Ok().json(service.sync_sources())
}

/// Health body of a node; a broken node answers 503 with its last error.
fn health_report(node: &NodeAddress, state: StateType, last_error: Option<String>) -> (StatusCode, Value) {
    if state == StateType::Broken {
        let body = json!({
            "status": "broken",
            "node": node.to_string(),
            "state": state.as_str(),
            "error": last_error.unwrap_or_else(|| "unknown".to_string()),
        });
        return (StatusCode::SERVICE_UNAVAILABLE, body);
    }
    let body = json!({
        "status": "healthy",
        "node": node.to_string(),
        "state": state.as_str(),
    });
    (StatusCode::OK, body)
}

async fn health(service: Service) -> impl Responder {
    let (status, body) = health_report(service.address(), service.state(), service.last_error());
    HttpResponse::build(status).json(body)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/ballots", web::post().to(receive_ballots))
        .route("/operation", web::post().to(send_operation))
        .route("/operation/{hash}", web::get().to(get_operation))
        .route("/proposal/request", web::post().to(request_proposal))
        .route("/proposal/{hash}", web::get().to(get_proposal))
        .route("/blockmap/last", web::get().to(last_blockmap))
        .route("/blockmap/{height}", web::get().to(get_blockmap))
        .route("/blockmap/{height}/item/{type}", web::get().to(get_blockmap_item))
        .route("/suffrage_proof/last", web::get().to(last_suffrage_proof))
        .route("/suffrage_proof/{height}", web::get().to(get_suffrage_proof))
        .route("/node_challenge", web::post().to(node_challenge))
        .route("/sync_sources", web::get().to(sync_sources))
        .route("/health", web::get().to(health));
}

/// Serves `service` on `bind` until the actix system stops.
pub async fn start_server(bind: String, service: Arc<NodeService>, max_message_size: usize) -> std::io::Result<()> {
    let data = web::Data::new(service);

    info!(%bind, "starting HTTP server");

    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .app_data(web::JsonConfig::default().limit(max_message_size))
            .configure(configure)
    })
    .bind(bind)?
    .run()
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_node_reports_its_error() {
        let node = NodeAddress::new("a").unwrap();

        let (status, body) = health_report(&node, StateType::Consensus, None);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["state"], StateType::Consensus.as_str());

        let reason = "no genesis block".to_string();
        let (status, body) = health_report(&node, StateType::Broken, Some(reason.clone()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "broken");
        assert_eq!(body["state"], StateType::Broken.as_str());
        assert_eq!(body["error"], reason.as_str());
    }
}
