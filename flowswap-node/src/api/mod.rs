//! HTTP surface: actix-web server wiring for the swap and admin routes.

pub mod error;
pub mod routes;
pub mod types;

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use tracing::info;

use crate::context::AppContext;

pub async fn serve(ctx: Arc<AppContext>, bind: &str, port: u16) -> std::io::Result<()> {
    info!(bind, port, "starting api server");
    let data = web::Data::new(ctx);
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .wrap(Cors::permissive())
            .service(
                web::scope("/api")
                    .route("/health", web::get().to(routes::health))
                    .service(
                        web::scope("/flowswap")
                            .route("/init", web::post().to(routes::init))
                            .route("/init-leg", web::post().to(routes::init_leg))
                            .route("/list", web::get().to(routes::list_swaps))
                            .route("/{id}", web::get().to(routes::get_swap))
                            .route("/{id}/btc-funded", web::post().to(routes::btc_funded))
                            .route("/{id}/m1-locked", web::post().to(routes::m1_locked))
                            .route("/{id}/btc-claimed", web::post().to(routes::btc_claimed))
                            .route("/{id}/usdc-funded", web::post().to(routes::usdc_funded)),
                    )
                    .service(
                        web::scope("/admin")
                            .route(
                                "/swap/{id}/force-fail",
                                web::post().to(routes::force_fail),
                            )
                            .route(
                                "/cleanup-terminal",
                                web::post().to(routes::cleanup_terminal),
                            ),
                    ),
            )
    })
    .bind((bind, port))?
    .run()
    .await
}
