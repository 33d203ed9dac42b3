// src/utils/http.rs

//! HTTP client utilities.

use std::time::Duration;

use reqwest::{Response, StatusCode};

use crate::error::{AppError, Result};
use crate::models::HttpConfig;

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(config: &HttpConfig) -> Result<reqwest::Client> {
    create_client_with_agent(config, &config.user_agent)
}

/// Create a client that identifies itself with a specific User-Agent.
pub fn create_client_with_agent(config: &HttpConfig, user_agent: &str) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    Ok(client)
}

/// Map a non-success status to an `AppError` the retry policy can classify.
pub fn check_status(response: Response, context: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(AppError::RateLimited(context.to_string()));
    }
    Err(AppError::upstream(context, status.as_u16()))
}

/// Send a request and decode the JSON body.
pub async fn send_json<T: serde::de::DeserializeOwned>(
    request: reqwest::RequestBuilder,
    context: &str,
) -> Result<T> {
    let response = check_status(request.send().await?, context)?;
    Ok(response.json::<T>().await?)
}
