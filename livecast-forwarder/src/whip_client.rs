//! WHIP signalling client.
//!
//! POSTs the local SDP offer, captures the session resource URL from the
//! `Location` header of the `201 Created` response, PATCHes trickle ICE
//! fragments with `If-Match: *`, and DELETEs the session on close.

use crate::ForwarderError;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_TYPE, IF_MATCH, LOCATION};
use reqwest::StatusCode;
use tracing::{debug, warn};

const CONTENT_TYPE_SDP: &str = "application/sdp";
const CONTENT_TYPE_TRICKLE_ICE: &str = "application/trickle-ice-sdpfrag";

pub struct WhipClient {
    http: reqwest::Client,
    endpoint: url::Url,
    session_url: Mutex<Option<url::Url>>,
}

impl WhipClient {
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

    /// POST the offer; expects `201 Created` with a `Location` header and
    /// the answer SDP in the body.
    pub async fn post_offer(&self, offer_sdp: &str) -> Result<String, ForwarderError> {
        let res = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, CONTENT_TYPE_SDP)
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(|e| ForwarderError::DialFailed(e.to_string()))?;

        if res.status() != StatusCode::CREATED {
            return Err(ForwarderError::Signalling(format!(
                "unexpected status {} from WHIP POST",
                res.status()
            )));
        }

        let location = res
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                ForwarderError::Signalling("201 response without Location header".into())
            })?;
        let session_url = self.endpoint.join(location).map_err(|e| {
            ForwarderError::Signalling(format!("invalid Location '{location}': {e}"))
        })?;
        debug!(session_url = %session_url, "WHIP session created");
        *self.session_url.lock() = Some(session_url);

        res.text()
            .await
            .map_err(|e| ForwarderError::Signalling(e.to_string()))
    }

    /// PATCH one trickle ICE fragment to the session resource.
    pub async fn patch_candidate(&self, frag: &str) -> Result<(), ForwarderError> {
        let Some(session_url) = self.session_url() else {
            return Err(ForwarderError::Signalling(
                "no session to patch candidates into".into(),
            ));
        };

        let res = self
            .http
            .patch(session_url)
            .header(CONTENT_TYPE, CONTENT_TYPE_TRICKLE_ICE)
            .header(IF_MATCH, "*")
            .body(frag.to_string())
            .send()
            .await
            .map_err(|e| ForwarderError::Signalling(e.to_string()))?;

        match res.status() {
            StatusCode::NOT_FOUND => Err(ForwarderError::SessionGone(
                "session resource returned 404 on PATCH".into(),
            )),
            s if s.is_success() => Ok(()),
            s => Err(ForwarderError::Signalling(format!(
                "unexpected status {s} from ICE PATCH"
            ))),
        }
    }

    /// DELETE the session resource, if one was created.
    pub async fn delete(&self) -> Result<(), ForwarderError> {
        let Some(session_url) = self.session_url.lock().take() else {
            return Ok(());
        };

        let res = self
            .http
            .delete(session_url)
            .send()
            .await
            .map_err(|e| ForwarderError::Signalling(e.to_string()))?;

        match res.status() {
            StatusCode::NOT_FOUND => Err(ForwarderError::SessionGone(
                "session resource returned 404 on DELETE".into(),
            )),
            s if s.is_success() => Ok(()),
            s => {
                warn!(status = %s, "unexpected status from WHIP DELETE");
                Ok(())
            }
        }
    }
}

/// Render one ICE candidate as a trickle SDP fragment.
#[must_use]
pub(crate) fn candidate_frag(ufrag: &str, mid: &str, candidate: &str) -> String {
    format!("a=ice-ufrag:{ufrag}\r\nm=audio 9 RTP/AVP 0\r\na=mid:{mid}\r\na=candidate:{candidate}\r\n")
}
