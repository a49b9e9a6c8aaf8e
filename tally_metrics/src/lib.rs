//! Prometheus metrics for the rollup engine and the `/metrics` exporter.
use anyhow::Result;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, TextEncoder};
use tracing::{info, warn};

pub static SAMPLES_RECORDED: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        Opts::new("tally_samples_recorded_total", "Samples ingested into the finest level"),
        &["series"]
    )
    .expect("register tally_samples_recorded_total")
});
pub static ROWS_COMPACTED: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        Opts::new("tally_rows_compacted_total", "Fine rows folded into a coarser level"),
        &["series", "level"]
    )
    .expect("register tally_rows_compacted_total")
});
pub static COARSE_UPSERTS: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        Opts::new("tally_coarse_upserts_total", "Coarse rows inserted or updated by compaction"),
        &["series", "level"]
    )
    .expect("register tally_coarse_upserts_total")
});
pub static QUERIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("tally_queries_total", "Span queries served")
        .expect("register tally_queries_total")
});
pub static COMPACTION_SECS: Lazy<Histogram> = Lazy::new(|| {
    let opts = HistogramOpts::new("tally_compaction_seconds", "Wall time of one compaction pass")
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]);
    prometheus::register_histogram!(opts).expect("register tally_compaction_seconds")
});

/// Render every registered metric in the Prometheus text format.
pub fn render() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Launch Prometheus exporter HTTP server on given address.
/// When `basic_auth` is Some((user, pass)), requires Authorization header.
pub async fn serve(addr: &str, basic_auth: Option<(String, String)>) -> Result<()> {
    let expected = basic_auth.map(|(u, p)| format!("Basic {}", B64.encode(format!("{u}:{p}"))));
    let make_svc = make_service_fn(move |_| {
        let expected = expected.clone();
        async move { Ok::<_, hyper::Error>(service_fn(move |req| metrics_handler(req, expected.clone()))) }
    });
    let server = Server::try_bind(&addr.parse()?)?.serve(make_svc);
    info!(%addr, "metrics exporter listening");
    tokio::spawn(async move {
        if let Err(e) = server.await {
            warn!(error = %e, "metrics server error");
        }
    });
    Ok(())
}

fn reply(status: StatusCode, body: Body) -> Response<Body> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp
}

async fn metrics_handler(req: Request<Body>, expected: Option<String>) -> Result<Response<Body>, hyper::Error> {
    if req.uri().path() != "/metrics" {
        return Ok(reply(StatusCode::NOT_FOUND, Body::empty()));
    }
    if let Some(expected) = expected {
        let presented = req.headers().get("Authorization").and_then(|h| h.to_str().ok());
        if presented != Some(expected.as_str()) {
            return Ok(reply(StatusCode::UNAUTHORIZED, Body::empty()));
        }
    }
    match render() {
        Ok(text) => Ok(reply(StatusCode::OK, Body::from(text))),
        Err(e) => Ok(reply(StatusCode::INTERNAL_SERVER_ERROR, Body::from(e.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_metrics() {
        SAMPLES_RECORDED.with_label_values(&["shares"]).inc();
        QUERIES_TOTAL.inc();
        let text = render().unwrap();
        assert!(text.contains("tally_samples_recorded_total{series=\"shares\"}"));
        assert!(text.contains("tally_queries_total"));
    }

    #[tokio::test]
    async fn handler_enforces_basic_auth() {
        let expected = Some(format!("Basic {}", B64.encode("ops:secret")));
        let req = Request::get("/metrics").body(Body::empty()).unwrap();
        let resp = metrics_handler(req, expected.clone()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = Request::get("/metrics")
            .header("Authorization", expected.clone().unwrap())
            .body(Body::empty())
            .unwrap();
        let resp = metrics_handler(req, expected).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let req = Request::get("/other").body(Body::empty()).unwrap();
        let resp = metrics_handler(req, None).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
