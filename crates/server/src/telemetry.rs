//! Tracing setup and per-request spans.
//!
//! Every HTTP request runs inside an `http.request` span. Events emitted
//! anywhere below that span are prefixed with `[request_id=...]` in both
//! log formats.

use std::time::Duration;

use axum::{body::HttpBody, extract::MatchedPath, http};
use tower_http::{
    request_id::RequestId,
    trace::{MakeSpan, OnResponse},
};
use tracing::{
    field::{self, Field, Visit},
    span, Event, Span, Subscriber,
};
use tracing_subscriber::{
    fmt::{format::Writer, writer::MakeWriter, FmtContext, FormatEvent, FormatFields},
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    EnvFilter, Layer,
};

use crate::config::{LogFormat, ServerConfig};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn init(config: &ServerConfig) {
    // RUST_LOG wins when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nkata_server=info"));

    let subscriber = subscriber(config.log_format(), filter, std::io::stderr);
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

pub fn subscriber<W>(
    format: LogFormat,
    filter: EnvFilter,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let base = tracing_subscriber::fmt::format()
        .with_target(true)
        .with_level(true);

    let output = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .event_format(RequestIdPrefix(base.json()))
            .with_writer(writer)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .event_format(RequestIdPrefix(base))
            .with_writer(writer)
            .boxed(),
    };

    Box::new(
        tracing_subscriber::registry()
            .with(filter)
            .with(RequestIdCapture)
            .with(output),
    )
}

/// Stores the `request_id` field of new spans in the span extensions.
struct RequestIdCapture;

#[derive(Clone)]
struct SpanRequestId(String);

#[derive(Default)]
struct RequestIdField(Option<String>);

impl Visit for RequestIdField {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "request_id" {
            self.0 = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "request_id" && self.0.is_none() {
            self.0 = Some(format!("{value:?}").trim_matches('"').to_owned());
        }
    }
}

impl<S> Layer<S> for RequestIdCapture
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut field = RequestIdField::default();
        attrs.record(&mut field);
        if let (Some(request_id), Some(span)) = (field.0, ctx.span(id)) {
            span.extensions_mut().insert(SpanRequestId(request_id));
        }
    }
}

struct RequestIdPrefix<E>(E);

impl<S, N, E> FormatEvent<S, N> for RequestIdPrefix<E>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let request_id = ctx.lookup_current().and_then(|current| {
            current
                .scope()
                .find_map(|span| span.extensions().get::<SpanRequestId>().cloned())
        });
        if let Some(SpanRequestId(request_id)) = request_id {
            write!(writer, "[request_id={request_id}] ")?;
        }
        self.0.format_event(ctx, writer, event)
    }
}

/// Opens the `http.request` span for each request.
#[derive(Clone, Copy, Default)]
pub struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn make_span(&mut self, request: &http::Request<B>) -> Span {
        let path = request.uri().path();
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map_or(path, MatchedPath::as_str);
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .and_then(|id| id.header_value().to_str().ok())
            .unwrap_or("unknown");

        tracing::info_span!(
            "http.request",
            method = %request.method(),
            route = %route,
            request_id = %request_id,
            status_code = field::Empty,
            latency_ms = field::Empty
        )
    }
}

/// Records status and latency on the request span.
#[derive(Clone, Copy, Default)]
pub struct RequestCompleted;

impl<B> OnResponse<B> for RequestCompleted
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn on_response(self, response: &http::Response<B>, latency: Duration, span: &Span) {
        let status = response.status().as_u16();
        let latency_ms = latency.as_secs_f64() * 1000.0;

        span.record("status_code", field::display(status));
        span.record("latency_ms", field::display(latency_ms));
        tracing::debug!(parent: span, status, latency_ms, "request completed");
    }
}
