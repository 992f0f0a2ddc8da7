use crate::gateway::{GatewayConfig, GatewayState};
use actix_cors::Cors;
use actix_web::{HttpRequest, HttpResponse, HttpServer, get, post, web};
use std::io::Write;

#[get("/health")]
pub async fn health(_req: HttpRequest, _: web::Data<GatewayState>) -> HttpResponse {
    HttpResponse::Ok().body("Ok")
}

#[post("/v1/chat/completions")]
pub async fn chat_completions(
    _req: HttpRequest,
    payload: web::Json<serde_json::Value>,
    app_state: web::Data<GatewayState>,
) -> Result<HttpResponse, actix_web::Error> {
    app_state.dispatch(payload.into_inner()).await
}

pub async fn startup(config: GatewayConfig, gateway_state: GatewayState) -> std::io::Result<()> {
    let app_state = web::Data::new(gateway_state);

    println!("Starting server at {}:{}", config.host, config.port);

    // default level is info
    env_logger::Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter(None, log::LevelFilter::Info)
        .init();

    log::info!(
        "pipeline stages: [{}]",
        app_state.pipeline.stage_names().join(", ")
    );
    log::info!("upstream endpoint: {}", app_state.config.upstream_url);
    if app_state.config.api_key.is_none() {
        log::warn!("no upstream API key configured, requests are sent unauthenticated");
    }

    HttpServer::new(move || {
        actix_web::App::new()
            .wrap(actix_web::middleware::Logger::default())
            .wrap(Cors::permissive())
            .app_data(app_state.clone())
            .service(health)
            .service(chat_completions)
    })
    .bind((config.host, config.port))?
    .run()
    .await?;

    std::io::Result::Ok(())
}
