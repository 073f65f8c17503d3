use serde::de::DeserializeOwned;

use super::error::HandlerErr;
use super::types::Request;

pub fn req_str(req: &Request, key: &str) -> Result<String, HandlerErr> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) => Ok(v.to_string()),
        None => Err(HandlerErr::bad_params(format!("missing {key}"))),
    }
}

pub fn req_non_empty(req: &Request, key: &str) -> Result<String, HandlerErr> {
    let v = req_str(req, key)?.trim().to_string();
    if v.is_empty() {
        return Err(HandlerErr::bad_params(format!("{key} must not be empty")));
    }
    Ok(v)
}

pub fn opt_str(req: &Request, key: &str) -> Result<Option<String>, HandlerErr> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| HandlerErr::bad_params(format!("{key} must be a string"))),
    }
}

pub fn req_f64(req: &Request, key: &str) -> Result<f64, HandlerErr> {
    opt_f64(req, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {key}")))
}

pub fn opt_f64(req: &Request, key: &str) -> Result<Option<f64>, HandlerErr> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{key} must be a number"))),
    }
}

pub fn opt_i64(req: &Request, key: &str) -> Result<Option<i64>, HandlerErr> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{key} must be an integer"))),
    }
}

pub fn opt_bool(req: &Request, key: &str) -> Result<Option<bool>, HandlerErr> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{key} must be a boolean"))),
    }
}

pub fn req_json<T: DeserializeOwned>(req: &Request, key: &str) -> Result<T, HandlerErr> {
    let Some(v) = req.params.get(key) else {
        return Err(HandlerErr::bad_params(format!("missing {key}")));
    };
    serde_json::from_value(v.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid {key}: {e}")))
}
