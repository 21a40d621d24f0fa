//! Preview proxy server: request admission and upstream forwarding.
//!
//! The path contract is `/{sandboxIdOrToken}/{port}/{rest...}`. A request
//! that authenticates is forwarded to the sandbox upstream, possibly with a
//! freshly minted auth cookie appended to the response; one that does not is
//! answered with a temporary redirect to the auth URL. Missing or invalid
//! credentials never surface as a 4xx/5xx to the browser.

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri, header};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, error, info, warn};
use tokio::net::TcpListener;

use crate::api::ApiClient;
use crate::config::ProxyConfig;
use crate::proxy::AuthUrlProvider;
use crate::proxy::cookie::CookieCodec;
use crate::proxy::exchange::CookieMinter;
use crate::proxy::resolver::{CredentialResolver, Resolution};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn empty() -> BoxBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

fn status_response(status: StatusCode) -> Response<BoxBody> {
    Response::builder().status(status).body(empty()).unwrap()
}

struct ProxyService {
    resolver: CredentialResolver,
    auth_urls: Arc<dyn AuthUrlProvider>,
    upstream_template: String,
    client: Client<HttpConnector, Incoming>,
}

impl ProxyService {
    async fn handle(
        self: Arc<Self>,
        mut req: Request<Incoming>,
    ) -> Result<Response<BoxBody>, hyper::Error> {
        let original_uri = req.uri().to_string();
        let path = req.uri().path().to_string();

        let trimmed = path.strip_prefix('/').unwrap_or(&path);
        let mut segments = trimmed.splitn(3, '/');
        let target = segments.next().unwrap_or_default().to_string();
        let port = segments.next().and_then(|p| p.parse::<u16>().ok());
        let rest = segments.next().unwrap_or_default().to_string();

        if target.is_empty() {
            return Ok(status_response(StatusCode::NOT_FOUND));
        }
        let Some(port) = port else {
            return Ok(status_response(StatusCode::NOT_FOUND));
        };

        match self.resolver.resolve(&mut req, &target, port).await {
            Resolution::Authenticated {
                sandbox_id,
                set_cookie,
            } => {
                self.forward(req, &sandbox_id, port, &rest, set_cookie)
                    .await
            }
            Resolution::Denied { reasons } => {
                warn!("denying preview of {target}: {}", reasons.join("; "));
                match self.auth_urls.auth_url(&target, &original_uri).await {
                    Ok(url) => {
                        let location = match HeaderValue::from_str(&url) {
                            Ok(location) => location,
                            Err(err) => {
                                error!("auth URL is not a valid header value: {err}");
                                return Ok(status_response(StatusCode::BAD_GATEWAY));
                            }
                        };
                        let mut response = status_response(StatusCode::TEMPORARY_REDIRECT);
                        response.headers_mut().insert(header::LOCATION, location);
                        Ok(response)
                    }
                    Err(err) => {
                        error!("auth URL lookup failed for {target}: {err:#}");
                        Ok(status_response(StatusCode::BAD_GATEWAY))
                    }
                }
            }
        }
    }

    async fn forward(
        &self,
        mut req: Request<Incoming>,
        sandbox_id: &str,
        port: u16,
        rest: &str,
        set_cookie: Option<String>,
    ) -> Result<Response<BoxBody>, hyper::Error> {
        let base = self
            .upstream_template
            .replace("{sandbox}", sandbox_id)
            .replace("{port}", &port.to_string());
        let mut target = format!("{}/{}", base.trim_end_matches('/'), rest);
        if let Some(query) = req.uri().query() {
            target.push('?');
            target.push_str(query);
        }
        let uri: Uri = match target.parse() {
            Ok(uri) => uri,
            Err(err) => {
                error!("upstream URI '{target}' is invalid: {err}");
                return Ok(status_response(StatusCode::BAD_GATEWAY));
            }
        };

        debug!("forwarding sandbox {sandbox_id} request to {uri}");
        *req.uri_mut() = uri;
        // Let the client derive Host from the upstream authority.
        req.headers_mut().remove(header::HOST);

        match self.client.request(req).await {
            Ok(response) => {
                let mut response = response.map(|body| body.boxed());
                if let Some(cookie) = set_cookie {
                    match HeaderValue::from_str(&cookie) {
                        Ok(value) => {
                            response.headers_mut().append(header::SET_COOKIE, value);
                        }
                        Err(err) => error!("minted cookie is not a valid header value: {err}"),
                    }
                }
                Ok(response)
            }
            Err(err) => {
                error!("upstream request for sandbox {sandbox_id} failed: {err}");
                Ok(status_response(StatusCode::BAD_GATEWAY))
            }
        }
    }
}

/// Run the preview proxy until the process is stopped.
pub async fn run(config: ProxyConfig) -> Result<()> {
    let api = Arc::new(ApiClient::new(
        &config.daytona_api_url,
        &config.daytona_api_key,
    ));
    let minter = CookieMinter {
        codec: CookieCodec::new(&config.auth_cookie_secret),
        prefix: config.auth_cookie_prefix.clone(),
        secure: config.tls_enabled,
    };
    let resolver = CredentialResolver::new(
        api.clone(),
        api.clone(),
        api.clone(),
        minter,
        &config.auth_key_header,
        &config.auth_key_query_param,
    )?;

    let service = Arc::new(ProxyService {
        resolver,
        auth_urls: api,
        upstream_template: config.upstream_template.clone(),
        client: Client::builder(TokioExecutor::new()).build_http(),
    });

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.port))
        .await
        .with_context(|| format!("binding proxy listener on port {}", config.port))?;
    info!("preview proxy listening on port {}", config.port);

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                debug!("proxy accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let service = service.clone();

        tokio::task::spawn(async move {
            let handler = service_fn(move |req| {
                let service = service.clone();
                service.handle(req)
            });
            if let Err(err) = http1::Builder::new().serve_connection(io, handler).await {
                debug!("proxy connection error: {err:?}");
            }
        });
    }
}
