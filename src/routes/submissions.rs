use actix_web::{HttpResponse, Responder, post, web};

use super::error_response;
use crate::engine::{Engine, RunRequest};

#[post("/compile")]
pub async fn post_compile_handler(
    engine: web::Data<Engine>,
    body: web::Json<RunRequest>,
) -> impl Responder {
    log::info!(
        "Compile requested by {} for course {} lesson {}",
        body.owner(),
        body.course_id,
        body.lesson_id
    );

    match engine.compile(&body).await {
        Ok(outcome) => HttpResponse::Ok().json(outcome),
        Err(e) => error_response(&e),
    }
}

/// A failing compile is a successful request: the body carries the
/// diagnostics under `"stage": "compilation_failed"`
#[post("/test")]
pub async fn post_test_handler(
    engine: web::Data<Engine>,
    body: web::Json<RunRequest>,
) -> impl Responder {
    log::info!(
        "Test requested by {} for course {} lesson {}",
        body.owner(),
        body.course_id,
        body.lesson_id
    );

    match engine.test(&body).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => error_response(&e),
    }
}
