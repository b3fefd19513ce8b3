//! WHEP signalling client.

use crate::AbrError;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, IF_MATCH, LINK, LOCATION};
use reqwest::StatusCode;
use tracing::{debug, warn};

const CONTENT_TYPE_SDP: &str = "application/sdp";
const CONTENT_TYPE_TRICKLE_ICE: &str = "application/trickle-ice-sdpfrag";

pub struct WhepClient {
    http: reqwest::Client,
    endpoint: url::Url,
    session_url: Mutex<Option<url::Url>>,
}

impl WhepClient {
    #[must_use]
    pub fn new(http: reqwest::Client, endpoint: url::Url) -> Self {
        Self {
            http,
            endpoint,
            session_url: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn session_url(&self) -> Option<url::Url> {
        self.session_url.lock().clone()
    }

    /// OPTIONS: the `Link` headers enumerate ICE servers.
    pub async fn ice_servers(&self) -> Result<Vec<String>, AbrError> {
        let res = self
            .http
            .request(reqwest::Method::OPTIONS, self.endpoint.clone())
            .send()
            .await
            .map_err(|e| AbrError::Signalling(e.to_string()))?;

        let mut servers = Vec::new();
        for value in res.headers().get_all(LINK) {
            let Ok(value) = value.to_str() else { continue };
            if !value.contains("ice-server") {
                continue;
            }
            if let Some(start) = value.find('<') {
                if let Some(end) = value[start..].find('>') {
                    servers.push(value[start + 1..start + end].to_string());
                }
            }
        }
        Ok(servers)
    }

    /// POST the offer; expects `201 Created` with `Location` and the
    /// answer SDP body.
    pub async fn post_offer(&self, offer_sdp: &str) -> Result<String, AbrError> {
        let res = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, CONTENT_TYPE_SDP)
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|e| AbrError::Signalling(e.to_string()))?;

        if res.status() != StatusCode::CREATED {
            return Err(AbrError::Signalling(format!(
                "unexpected status {} from WHEP POST",
                res.status()
            )));
        }

        let location = res
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AbrError::Signalling("201 response without Location header".into()))?;
        let session_url = self
            .endpoint
            .join(location)
            .map_err(|e| AbrError::Signalling(format!("invalid Location '{location}': {e}")))?;
        debug!(session_url = %session_url, "WHEP session created");
        *self.session_url.lock() = Some(session_url);

        res.text().await.map_err(|e| AbrError::Signalling(e.to_string()))
    }

    /// PATCH one trickle ICE fragment; failures are non-fatal for the
    /// caller.
    pub async fn patch_candidate(&self, frag: &str) -> Result<(), AbrError> {
        let Some(session_url) = self.session_url() else {
            return Err(AbrError::Signalling("no session for candidate".into()));
        };

        let res = self
            .http
            .patch(session_url)
            .header(CONTENT_TYPE, CONTENT_TYPE_TRICKLE_ICE)
            .header(IF_MATCH, "*")
            .body(frag.to_string())
            .send()
            .await
            .map_err(|e| AbrError::Signalling(e.to_string()))?;

        match res.status() {
            StatusCode::NOT_FOUND => Err(AbrError::SessionGone("404 on PATCH".into())),
            s if s.is_success() => Ok(()),
            s => Err(AbrError::Signalling(format!("status {s} on ICE PATCH"))),
        }
    }

    /// DELETE the session resource, if any.
    pub async fn delete(&self) -> Result<(), AbrError> {
        let Some(session_url) = self.session_url.lock().take() else {
            return Ok(());
        };

        let res = self
            .http
            .delete(session_url)
            .send()
            .await
            .map_err(|e| AbrError::Signalling(e.to_string()))?;

        if res.status() == StatusCode::NOT_FOUND {
            return Err(AbrError::SessionGone("404 on DELETE".into()));
        }
        if !res.status().is_success() {
            warn!(status = %res.status(), "unexpected status from WHEP DELETE");
        }
        Ok(())
    }
}

/// Render one ICE candidate attribute as a trickle SDP fragment.
#[must_use]
pub(crate) fn candidate_frag(ufrag: &str, mid: &str, candidate_attr: &str) -> String {
    format!(
        "a=ice-ufrag:{ufrag}\r\nm=audio 9 RTP/AVP 0\r\na=mid:{mid}\r\na=candidate:{candidate_attr}\r\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_frag() {
        let frag = candidate_frag("uf", "0", "1 1 UDP 2 192.0.2.7 4444 typ host");
        assert!(frag.starts_with("a=ice-ufrag:uf\r\n"));
        assert!(frag.contains("a=candidate:1 1 UDP"));
    }
}
