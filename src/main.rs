use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use kube::{
    api::{Api, ListParams},
    error::{Error as KubeError, ErrorResponse},
    Client,
};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
pub use operator::{self, apis::authproxyworkload_types::AuthProxyWorkload, telemetry, State};
use operator::{config::Config, webhook};
use std::sync::Arc;
use tracing::*;

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(metrics)
}

#[get("/health/liveness")]
async fn liveness(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("alive")
}

// Ready means the API server answers us; an unauthorized answer maps to 401
// so a misconfigured service account is visible from probes
#[get("/health/readiness")]
async fn readiness(_: HttpRequest, client: Data<Arc<Client>>) -> impl Responder {
    let apws: Api<AuthProxyWorkload> = Api::all(client.as_ref().as_ref().clone());
    match apws.list(&ListParams::default().limit(1)).await {
        Ok(_) => HttpResponse::Ok().json("ready"),
        Err(KubeError::Api(ErrorResponse { reason, .. })) if reason == "Unauthorized" => {
            HttpResponse::Unauthorized().json("not ready")
        }
        Err(_) => HttpResponse::InternalServerError().json("not ready"),
    }
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}

async fn app_main() -> anyhow::Result<()> {
    telemetry::init().await;
    let config = Config::default();

    // The controller task and the HTTPS server below share one State
    let state = State::default();
    let controller = operator::run(state.clone());

    let kube_client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("no usable kubeconfig or in-cluster environment: {e}"))?;

    // The webhook must terminate TLS itself
    let mut tls_config = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
    tls_config.set_private_key_file(&config.tls_key, SslFiletype::PEM)?;
    tls_config.set_certificate_chain_file(&config.tls_cert)?;
    let server_bind_address = format!("{}:{}", config.server_host, config.server_port);

    let server = HttpServer::new({
        let state = state.clone();
        let config_data = Data::new(config.clone());
        let kube_data = Data::new(Arc::new(kube_client.clone()));
        let metrics_data = Data::new(state.admission_metrics());
        move || {
            App::new()
                .app_data(Data::new(state.clone()))
                .app_data(config_data.clone())
                .app_data(kube_data.clone())
                .app_data(metrics_data.clone())
                .wrap(
                    middleware::Logger::default()
                        .exclude("/health/liveness")
                        .exclude("/health/readiness"),
                )
                .service(index)
                .service(liveness)
                .service(readiness)
                .service(metrics)
                .service(webhook::mutate_workloads)
        }
    })
    .bind_openssl(server_bind_address.clone(), tls_config)?
    .shutdown_timeout(5);

    info!("Starting HTTPS server at https://{}/", server_bind_address);
    debug!("Config: {:?}", config);

    // Wait on the controller and the server together; each side shuts down
    // cleanly on its own signal handling
    tokio::join!(controller, server.run()).1?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(app_main())
}
