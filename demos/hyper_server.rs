//! A minimal hyper server authenticating each connection through ntlm_auth helpers
//!
//! `cargo run --example hyper_server -- [config.toml]`
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::http::response::Builder;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;

use winbind_auth::http::{authorization_header, AuthState};
use winbind_auth::{AuthConfig, Authenticator, ConnectionScope, Generation};

type Body = BoxBody<Bytes, Infallible>;

// Connection specific context. Dropping the scope forgets the identity.
struct ConnCtx {
    scope: ConnectionScope,
    requests: AtomicU64,
}

impl ConnCtx {
    async fn handle_conn(self: Arc<Self>, req: Request<hyper::body::Incoming>) -> Result<Response<Body>, Infallible> {
        // every request on the connection is a new generation
        let generation = Generation::from(self.requests.fetch_add(1, Ordering::Relaxed));
        let header = req
            .headers()
            .get(authorization_header(false))
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        // helper I/O blocks, keep it off the reactor
        let ctx = Arc::clone(&self);
        let state = tokio::task::spawn_blocking(move || {
            ctx.scope
                .authenticator()
                .http_incoming_auth(ctx.scope.id(), generation, false, |_| header.as_deref())
        })
        .await;

        let response = match state {
            Err(err) => {
                log::error!("authentication task failed: {}", err);
                respond(Response::builder().status(500), Empty::new().boxed())
            }
            // Pass along a http-response to the client, if needed for auth.
            // The client will retry the request and include additional auth data.
            Ok(AuthState::Response(resp)) => {
                let mut builder = Response::builder().status(resp.status_code);
                for (k, v) in &resp.headers {
                    builder = builder.header(*k, v);
                }
                if !resp.keep_alive {
                    builder = builder.header("Connection", "close");
                }
                respond(builder, Empty::new().boxed())
            }
            Ok(AuthState::Declined) => respond(
                Response::builder().status(403),
                Full::new(Bytes::from("no acceptable credentials")).boxed(),
            ),
            Ok(AuthState::Success { user, mechanism, headers }) => {
                let mut builder = Response::builder();
                for (k, v) in &headers {
                    builder = builder.header(*k, v);
                }
                let body = format!("Hello {} (authenticated via {})", user, mechanism);
                respond(builder, Full::new(Bytes::from(body)).boxed())
            }
        };
        Ok(response)
    }
}

fn respond(builder: Builder, body: Body) -> Response<Body> {
    builder.body(body).unwrap_or_else(|err| {
        log::error!("invalid response: {}", err);
        let mut resp = Response::new(Empty::new().boxed());
        *resp.status_mut() = hyper::StatusCode::INTERNAL_SERVER_ERROR;
        resp
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => AuthConfig::load(path)?,
        None => AuthConfig { ntlm: true, negotiate: true, ..AuthConfig::default() },
    };
    let auth = Arc::new(Authenticator::new(config));

    let addr = "127.0.0.1:3000";
    println!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let ctx = Arc::new(ConnCtx { scope: auth.open_connection(), requests: AtomicU64::new(0) });

        tokio::task::spawn(async move {
            let service = service_fn(move |req| Arc::clone(&ctx).handle_conn(req));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                log::warn!("Error serving connection from {}: {:?}", peer, err);
            }
        });
    }
}
