use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{required, transport_error};
use crate::action::HttpParams;
use crate::{resolver, ActionContext, ExecutableAction, NodeError};

#[async_trait]
impl ExecutableAction for HttpParams {
    async fn execute(&self, ctx: &ActionContext<'_>) -> Result<Value, NodeError> {
        let timeout = ctx.services.config.http_timeout;
        let url = required("url", ctx.resolve(&self.url))?;
        let method = method(self.method.as_deref())?;
        let headers = request_headers(self.headers.as_ref())?;

        debug!(%method, "sending http request");
        let mut req = ctx
            .services
            .http
            .request(method, &url)
            .headers(headers)
            .timeout(timeout);

        match self.body.as_ref().map(|b| resolver::resolve(b, ctx.prior_outputs)) {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) if text.trim().is_empty() => {}
            // JSON text goes out as JSON; anything else as a raw body.
            Some(Value::String(text)) => match serde_json::from_str::<Value>(&text) {
                Ok(json) => req = req.json(&json),
                Err(_) => req = req.body(text),
            },
            Some(other) => req = req.json(&other),
        }

        let resp = req.send().await.map_err(|e| transport_error(e, timeout))?;
        let status = resp.status();
        let response_headers: Map<String, Value> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), Value::String(v.to_str().ok()?.to_owned()))))
            .collect();
        let text = resp.text().await.map_err(|e| transport_error(e, timeout))?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));

        if !status.is_success() {
            return Err(NodeError::Api {
                service: "HTTP",
                message: format!("request returned {status}"),
            });
        }

        Ok(json!({
            "success": true,
            "status": status.as_u16(),
            "data": data,
            "headers": response_headers,
        }))
    }
}

fn method(raw: Option<&str>) -> Result<Method, NodeError> {
    let raw = raw.map(str::trim).filter(|m| !m.is_empty()).unwrap_or("POST");
    Method::from_bytes(raw.to_uppercase().as_bytes()).map_err(|_| NodeError::InvalidParameter {
        name: "method",
        message: format!("'{raw}' is not an HTTP method"),
    })
}

/// `headers` arrives as JSON text from the editor, or as an object.
fn request_headers(raw: Option<&Value>) -> Result<HeaderMap, NodeError> {
    let invalid = |message: String| NodeError::InvalidParameter {
        name: "headers",
        message,
    };

    let object = match raw {
        None | Some(Value::Null) => return Ok(HeaderMap::new()),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(HeaderMap::new()),
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(invalid("expected a JSON object".into())),
            Err(e) => return Err(invalid(e.to_string())),
        },
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(invalid("expected a JSON object".into())),
    };

    let mut headers = HeaderMap::new();
    for (name, value) in object {
        let value = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let value = HeaderValue::from_str(&value).map_err(|e| invalid(e.to_string()))?;
        headers.insert(name, value);
    }
    Ok(headers)
}
