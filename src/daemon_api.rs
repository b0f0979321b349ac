use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{BlockTemplate, MiningParameters};

pub const TEMPLATE_ENDPOINT: &str = "/block/template";
pub const SUBMIT_ENDPOINT: &str = "/block";

const TEMPLATE_ACCEPTED: u16 = 201;
const BLOCK_ACCEPTED: u16 = 202;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("daemon request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("daemon returned http {status} for {endpoint}")]
    UnexpectedStatus { endpoint: &'static str, status: u16 },
    #[error("malformed daemon response: {0}")]
    MalformedResponse(String),
    #[error("block template blob rejected: {0}")]
    InvalidTemplate(String),
}

/// The two daemon calls the miner depends on. The manager and the tip monitor
/// are written against this trait so tests can drive them with an in-process
/// stub instead of a live daemon.
pub trait Daemon: Send + Sync {
    fn fetch_block_template(&self, address: &str) -> Result<MiningParameters, ApiError>;

    fn submit_block(&self, block: &BlockTemplate) -> Result<(), ApiError>;
}

#[derive(Serialize)]
struct TemplateRequest<'a> {
    address: &'a str,
    #[serde(rename = "reserveSize")]
    reserve_size: u32,
}

#[derive(Deserialize)]
struct TemplateResponse {
    difficulty: u64,
    blob: String,
}

pub struct ApiClient {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        let base_url: String = base_url.into();

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }
}

impl Daemon for ApiClient {
    fn fetch_block_template(&self, address: &str) -> Result<MiningParameters, ApiError> {
        let response = self
            .client
            .post(self.url(TEMPLATE_ENDPOINT))
            .json(&TemplateRequest {
                address,
                reserve_size: 0,
            })
            .send()?;

        let status = response.status().as_u16();
        if status != TEMPLATE_ACCEPTED {
            return Err(ApiError::UnexpectedStatus {
                endpoint: TEMPLATE_ENDPOINT,
                status,
            });
        }

        let body = response.text()?;
        let parsed: TemplateResponse = serde_json::from_str(&body)
            .map_err(|err| ApiError::MalformedResponse(err.to_string()))?;

        let blob = hex::decode(parsed.blob.trim())
            .map_err(|err| ApiError::MalformedResponse(format!("blob is not valid hex: {err}")))?;
        let block_template = BlockTemplate::from_bytes(&blob)
            .map_err(|err| ApiError::InvalidTemplate(err.to_string()))?;

        Ok(MiningParameters {
            block_template,
            difficulty: parsed.difficulty,
        })
    }

    fn submit_block(&self, block: &BlockTemplate) -> Result<(), ApiError> {
        let blob_hex = hex::encode(block.to_bytes());

        // The daemon expects a bare JSON string, not an object.
        let response = self
            .client
            .post(self.url(SUBMIT_ENDPOINT))
            .json(&blob_hex)
            .send()?;

        let status = response.status().as_u16();
        if status != BLOCK_ACCEPTED {
            return Err(ApiError::UnexpectedStatus {
                endpoint: SUBMIT_ENDPOINT,
                status,
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_request_wire_shape() {
        let body = serde_json::to_string(&TemplateRequest {
            address: "miner-address",
            reserve_size: 0,
        })
        .expect("request should serialize");

        assert_eq!(body, r#"{"address":"miner-address","reserveSize":0}"#);
    }

    #[test]
    fn template_response_parses_required_fields() {
        let parsed: TemplateResponse =
            serde_json::from_str(r#"{"difficulty":5000,"blob":"0102","height":12}"#)
                .expect("response should parse");

        assert_eq!(parsed.difficulty, 5000);
        assert_eq!(parsed.blob, "0102");
    }

    #[test]
    fn submit_body_is_a_bare_json_string() {
        let body = serde_json::to_string("01ff02").expect("hex should serialize");
        assert_eq!(body, r#""01ff02""#);
    }

    #[test]
    fn base_url_trailing_slash_is_stripped() {
        let client = ApiClient::new("http://127.0.0.1:11898/", Duration::from_secs(5))
            .expect("client should build");
        assert_eq!(client.url(SUBMIT_ENDPOINT), "http://127.0.0.1:11898/block");
    }
}
