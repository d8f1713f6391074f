#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::store::CoordinationStore;

/// Liveness plus readiness; readiness also requires the coordination store to answer.
#[derive(Clone)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
	store: Arc<dyn CoordinationStore>,
}

impl HealthState {
	pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
			store,
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn mark_not_ready(&self) {
		self.ready.store(false, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

pub fn spawn_health_server(bind: SocketAddr, state: HealthState) {
	tokio::spawn(async move {
		if let Err(err) = run_health_server(bind, state).await {
			warn!(error = %err, "health server stopped");
		}
	});
}

async fn run_health_server(bind: SocketAddr, state: HealthState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_health(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "health connection error");
			}
		});
	}
}

async fn handle_health(req: Request<Incoming>, state: HealthState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let wants_store = req.method() == Method::GET && req.uri().path() == "/readyz" && state.is_ready();
	let store_ok = if wants_store {
		match state.store.ping().await {
			Ok(()) => true,
			Err(e) => {
				warn!(error = %e, "readiness: coordination store ping failed");
				false
			}
		}
	} else {
		false
	};

	let (status, body) = route(req.method(), req.uri().path(), state.is_ready(), store_ok);
	let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
	*resp.status_mut() = status;
	Ok(resp)
}

/// Map a request to its status and body.
pub fn route(method: &Method, path: &str, ready: bool, store_ok: bool) -> (StatusCode, &'static str) {
	if method != Method::GET {
		return (StatusCode::METHOD_NOT_ALLOWED, "");
	}

	match path {
		"/healthz" => (StatusCode::OK, "ok"),
		"/readyz" if ready && store_ok => (StatusCode::OK, "ready"),
		"/readyz" => (StatusCode::SERVICE_UNAVAILABLE, "not-ready"),
		_ => (StatusCode::NOT_FOUND, ""),
	}
}
