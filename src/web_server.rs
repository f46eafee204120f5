use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::engine::Engine;
use crate::routes::{
    json_error_handler, post_compile_handler, post_project_handler, post_test_handler,
};

/// Registers every endpoint; shared with the route tests
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error_handler))
        .service(post_compile_handler)
        .service(post_test_handler)
        .service(post_project_handler);
}

pub fn build_server(server_config: ServerConfig, engine: web::Data<Engine>) -> std::io::Result<Server> {
    let bind_address = server_config
        .bind_address
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let bind_port = server_config.bind_port.unwrap_or(12345);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(engine.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind((bind_address.as_str(), bind_port))?
    .run();

    log::info!("Listening on {bind_address}:{bind_port}");
    Ok(server)
}
