use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, MethodRouter},
    Router,
};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::{Arc, Once};
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{MakeSpan, OnResponse, TraceLayer};
use tracing::Span;

use super::handlers;
use super::response::ApiError;
use crate::{auth, AppState};

pub fn create_router(state: Arc<AppState>) -> Router {
    let timeout = Duration::from_secs(state.config.request_timeout_secs);

    let api = Router::new()
        // The bare paths reach the handlers so a missing artifact ID gets a proper error
        .route("/artifacts", artifact_routes())
        .route("/artifacts/", artifact_routes())
        .route("/artifacts/:artifact_id", artifact_routes());

    Router::new()
        .nest("/v8", api)
        .fallback(fallback)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_token,
        ))
        .layer(TimeoutLayer::new(timeout))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(RequestSpan)
                .on_response(LogResponse),
        )
        .with_state(state)
}

fn artifact_routes() -> MethodRouter<Arc<AppState>> {
    get(handlers::fetch_artifact)
        .post(handlers::store_artifact)
        .put(handlers::store_artifact)
}

async fn fallback() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "not_found", "no such endpoint")
}

// ============================================================================
// Observability
// ============================================================================

/// One span per request carrying the method and escaped path.
#[derive(Debug, Clone, Copy)]
struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        tracing::info_span!(
            "request",
            method = %request.method(),
            path = %request.uri().path(),
        )
    }
}

/// Log the final status and elapsed time of every request.
#[derive(Debug, Clone, Copy)]
struct LogResponse;

impl<B> OnResponse<B> for LogResponse {
    fn on_response(self, response: &Response<B>, latency: Duration, _span: &Span) {
        tracing::info!(
            status = response.status().as_u16(),
            duration_ms = latency.as_secs_f64() * 1000.0,
            "Request completed"
        );
    }
}

/// Where a panic happened, recorded by the panic hook on the panicking thread.
struct PanicReport {
    location: String,
    backtrace: Backtrace,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicReport>> = const { RefCell::new(None) };
}

/// Install a panic hook that records the panic site and its backtrace, so the
/// recovery boundary can log where the panic happened. Idempotent; the
/// previously installed hook still runs.
pub fn capture_panic_backtraces() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let report = PanicReport {
                location: info
                    .location()
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                backtrace: Backtrace::force_capture(),
            };
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(report));
            previous(info);
        }));
    });
}

fn take_panic_report() -> Option<PanicReport> {
    LAST_PANIC.with(|slot| slot.borrow_mut().take())
}

/// Last-resort boundary: a panicking handler becomes a bare 500.
/// Unwinding is caught on the thread that panicked, so the hook's report is
/// still in this thread's slot.
fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response<Body> {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        *s
    } else {
        "unknown panic payload"
    };

    match take_panic_report() {
        Some(report) => tracing::error!(
            panic = %message,
            location = %report.location,
            backtrace = %report.backtrace,
            "Request handler panicked"
        ),
        None => tracing::error!(
            panic = %message,
            backtrace = %Backtrace::force_capture(),
            "Request handler panicked"
        ),
    }

    StatusCode::INTERNAL_SERVER_ERROR.into_response()
}
