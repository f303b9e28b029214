use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, Responder};
use serde_json::Value;
use std::sync::Arc;

use super::handler::IntakeHandler;
use super::response::{IntakeError, IntakeResponse};

/// Register the order routes on an actix-web app.
///
/// Expects `web::Data<Arc<IntakeHandler>>` in app data.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/orders", web::post().to(submit_order))
        .route("/orders/{order_id}", web::put().to(put_order))
        .route("/orders/{order_id}", web::get().to(get_order));
}

fn respond(response: IntakeResponse) -> HttpResponse {
    let status =
        StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(&response.body)
}

async fn submit_order(handler: web::Data<Arc<IntakeHandler>>, body: web::Bytes) -> impl Responder {
    respond(handler.handle_json(&body).await)
}

/// The path names the order; a body `orderId` is optional but must agree.
async fn put_order(
    handler: web::Data<Arc<IntakeHandler>>,
    path: web::Path<String>,
    body: web::Bytes,
) -> impl Responder {
    let order_id = path.into_inner();

    let mut value = match serde_json::from_slice::<Value>(&body) {
        Ok(value) => value,
        Err(_) => return respond(handler.handle_json(&body).await),
    };

    if let Value::Object(fields) = &mut value {
        match fields.get("orderId") {
            Some(Value::String(id)) if *id != order_id => {
                let error = IntakeError::BadRequest(format!(
                    "orderId '{}' in body does not match path '{}'",
                    id, order_id
                ));
                return respond(IntakeResponse::from_result(&Err(error), Some(&order_id)));
            }
            None | Some(Value::Null) => {
                fields.insert("orderId".to_string(), Value::String(order_id));
            }
            Some(_) => {}
        }
    }

    respond(handler.handle_value(value).await)
}

async fn get_order(handler: web::Data<Arc<IntakeHandler>>, path: web::Path<String>) -> impl Responder {
    let order_id = path.into_inner();
    match handler.get_order(&order_id).await {
        Ok(order) => HttpResponse::Ok().json(order),
        Err(e) => respond(IntakeResponse::from_result(&Err(e), Some(&order_id))),
    }
}
