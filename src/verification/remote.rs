// src/verification/remote.rs
//
// HTTP verifier backend. The crop is JPEG-encoded, base64-wrapped and
// POSTed with the target description to `{server_url}/verify`; the server
// answers whether the crop shows the described vehicle.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::candidate::{EngineKind, RejectReason, VehicleView};
use crate::capabilities::{VerifierBackend, VerifierOutcome};
use crate::types::ImageCrop;
use crate::verification::description::NormalizedDescription;

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Serialize)]
pub struct VerifyRequest {
    /// Unique id for correlating logs on both ends
    pub request_id: String,
    pub engine: String,
    pub target_description: String,
    /// Canonical make/model/colour, when the description parses
    pub target: Option<NormalizedDescription>,
    pub frame_id: u64,
    /// Base64-encoded JPEG of the candidate crop
    pub image_base64: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyResponse {
    #[serde(default)]
    pub request_id: Option<String>,
    pub is_match: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub reject_reason: Option<String>,
    #[serde(default)]
    pub view: Option<String>,
    #[serde(default)]
    pub view_score: Option<f32>,
}

impl VerifyResponse {
    pub fn into_outcome(self) -> VerifierOutcome {
        let view = self.view.as_deref().and_then(VehicleView::parse);
        let reject_reason = self.reject_reason.as_deref().and_then(|raw| {
            let parsed = RejectReason::parse(raw);
            if parsed.is_none() {
                debug!("🌐 Unrecognized reject reason '{}'", raw);
            }
            parsed
        });
        VerifierOutcome {
            is_match: self.is_match,
            description: self.description.unwrap_or_default(),
            reject_reason: if self.is_match { None } else { reject_reason },
            view,
            view_score: view.and(self.view_score),
        }
    }
}

// ============================================================================
// REMOTE VERIFIER CLIENT
// ============================================================================

pub struct RemoteVerifierClient {
    http_client: reqwest::Client,
    server_url: String,
    engine: EngineKind,
    jpeg_quality: u8,
}

impl RemoteVerifierClient {
    pub fn new(
        server_url: String,
        engine: EngineKind,
        timeout_secs: u64,
        jpeg_quality: u8,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            server_url,
            engine,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        })
    }

    pub fn build_request(&self, crop: &ImageCrop, target_description: &str) -> Result<VerifyRequest> {
        let jpeg = encode_jpeg(crop, self.jpeg_quality)?;
        Ok(VerifyRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            engine: self.engine.as_str().to_string(),
            target_description: target_description.to_string(),
            target: NormalizedDescription::parse(target_description),
            frame_id: crop.frame_id,
            image_base64: base64::engine::general_purpose::STANDARD.encode(jpeg),
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[async_trait]
impl VerifierBackend for RemoteVerifierClient {
    async fn verify(&self, crop: ImageCrop, target_description: &str) -> Result<VerifierOutcome> {
        let url = format!("{}/verify", self.server_url.trim_end_matches('/'));
        let request = self.build_request(&crop, target_description)?;

        debug!(
            "🌐 Sending {} verification {} (frame {}) to {}",
            request.engine, request.request_id, request.frame_id, url
        );

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("Verification request to {} failed", url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            warn!("🌐 Verification server returned {}: {}", status, body);
            bail!("verification server returned {}", status);
        }

        let reply: VerifyResponse = response
            .json()
            .await
            .context("Failed to parse verification response")?;

        info!(
            "🌐 {} verdict for {}: match={} reason={:?}",
            self.engine.as_str(),
            reply.request_id.as_deref().unwrap_or(&request.request_id),
            reply.is_match,
            reply.reject_reason
        );
        Ok(reply.into_outcome())
    }
}

// ============================================================================
// JPEG ENCODING HELPER
// ============================================================================

fn encode_jpeg(crop: &ImageCrop, quality: u8) -> Result<Vec<u8>> {
    let mut buf = std::io::Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    crop.image
        .write_with_encoder(encoder)
        .context("Failed to JPEG-encode crop")?;
    Ok(buf.into_inner())
}
