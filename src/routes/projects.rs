use actix_web::{HttpResponse, Responder, post, web};

use super::error_response;
use crate::engine::{Engine, ProjectRequest};

#[post("/courses/{course_id}/project")]
pub async fn post_project_handler(
    engine: web::Data<Engine>,
    path: web::Path<String>,
    body: web::Json<ProjectRequest>,
) -> impl Responder {
    let course_id = path.into_inner();
    log::info!(
        "Course project for {course_id} requested with {} extra dependencies",
        body.dependencies.len()
    );

    match engine
        .create_course_project(&course_id, &body.dependencies)
        .await
    {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => error_response(&e),
    }
}
