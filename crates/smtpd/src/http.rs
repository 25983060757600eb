use anyhow::Context;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::proto::{MetricFamily, MetricType};
use smtp_server::SmtpServer;
use std::net::SocketAddr;
use tokio::net::TcpListener;

#[derive(Debug)]
pub struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error: {:#}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn report_metrics(State(server): State<SmtpServer>) -> Result<String, AppError> {
    Ok(server.render_metrics()?)
}

/// The same counters as `/metrics`, keyed by metric name
async fn report_metrics_json(
    State(server): State<SmtpServer>,
) -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(metrics_to_json(&server.metrics_registry().gather())))
}

fn metrics_to_json(families: &[MetricFamily]) -> serde_json::Value {
    use serde_json::{Map, Number, Value};

    let mut result = Map::new();
    for mf in families {
        let metric_type = mf.get_field_type();
        let mut family = Map::new();
        family.insert(
            "type".to_string(),
            format!("{metric_type:?}").to_lowercase().into(),
        );
        if !mf.get_help().is_empty() {
            family.insert("help".to_string(), mf.get_help().into());
        }

        // None of our metrics carry labels, so each family
        // has exactly one value
        let value = mf
            .get_metric()
            .first()
            .and_then(|mc| match metric_type {
                MetricType::COUNTER => Number::from_f64(mc.get_counter().value()),
                MetricType::GAUGE => Number::from_f64(mc.get_gauge().value()),
                _ => None,
            })
            .map(Value::Number)
            .unwrap_or(Value::Null);
        family.insert("value".to_string(), value);

        result.insert(mf.get_name().to_string(), Value::Object(family));
    }

    Value::Object(result)
}

pub fn router(server: SmtpServer) -> Router {
    Router::new()
        .route("/metrics", get(report_metrics))
        .route("/metrics.json", get(report_metrics_json))
        .with_state(server)
}

/// Serve the metrics endpoint in the background
pub async fn start(listen: &str, server: SmtpServer) -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("listen on {listen}"))?;
    let addr = listener.local_addr()?;
    tracing::info!("http listener on {addr:?}");

    let app = router(server);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!("http listener on {addr:?} failed: {err:#}");
        }
    });
    Ok(addr)
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;
    use smtp_server::{SmtpServerConfig, UnavailableResolver};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    fn make_server() -> SmtpServer {
        SmtpServer::builder(SmtpServerConfig {
            hostname: Some("mx.example.com".to_string()),
            ..Default::default()
        })
        .resolver(Arc::new(UnavailableResolver))
        .build()
        .unwrap()
    }

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(format!("GET {path} HTTP/1.0\r\nHost: localhost\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn metrics_endpoint() {
        let addr = start("127.0.0.1:0", make_server()).await.unwrap();
        let response = http_get(addr, "/metrics").await;
        assert!(response.contains(" 200 OK"), "{response}");
        assert!(response.contains("smtp_transactions_total 0"), "{response}");
    }

    #[test]
    fn json_from_registry() {
        let registry = prometheus::Registry::new();
        let counter = prometheus::IntCounter::new("widgets_total", "widgets made").unwrap();
        let gauge = prometheus::IntGauge::new("widgets_in_use", "widgets in use").unwrap();
        registry.register(Box::new(counter.clone())).unwrap();
        registry.register(Box::new(gauge.clone())).unwrap();
        counter.inc_by(3);
        gauge.set(7);

        let report = metrics_to_json(&registry.gather());
        assert_equal!(
            report,
            serde_json::json!({
                "widgets_total": {"type": "counter", "help": "widgets made", "value": 3.0},
                "widgets_in_use": {"type": "gauge", "help": "widgets in use", "value": 7.0},
            })
        );
    }

    #[tokio::test]
    async fn metrics_json_endpoint() {
        let addr = start("127.0.0.1:0", make_server()).await.unwrap();
        let response = http_get(addr, "/metrics.json").await;
        assert!(response.contains(" 200 OK"), "{response}");

        let (_headers, body) = response.split_once("\r\n\r\n").unwrap();
        let report: serde_json::Value = serde_json::from_str(body).unwrap();
        assert!(report["smtp_transactions_total"]["type"] == "counter", "{report}");
        assert!(report["smtp_transactions_total"]["value"] == 0.0, "{report}");
        assert!(report["smtp_active_transactions"]["type"] == "gauge", "{report}");
    }
}
