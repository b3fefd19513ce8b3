//! Offer munging for level selection.
//!
//! There is no server-side RID selection: the reader advertises a
//! bandwidth cap with `b=AS:` inside the video m-section and the server
//! picks the matching simulcast encoding. Browser-generated `a=rid:` /
//! `a=simulcast:` attributes are stripped, since this is a recv-only
//! session and some engines insert them accidentally.

/// Insert `b=AS:<kbps>` into the video m-section. A cap of 0 means
/// unlimited and leaves the offer untouched.
#[must_use]
pub fn with_bandwidth_cap(offer: &str, max_bitrate_kbps: u32) -> String {
    if max_bitrate_kbps == 0 {
        return offer.to_string();
    }

    let line_ending = if offer.contains("\r\n") { "\r\n" } else { "\n" };
    let mut out = Vec::new();
    let mut in_video = false;
    let mut inserted = false;

    for line in offer.lines() {
        let is_media_line = line.starts_with("m=");
        if is_media_line {
            // leaving the video section without having inserted: put the
            // cap before the next section
            in_video = line.starts_with("m=video");
        }
        out.push(line.to_string());

        if in_video && !inserted && line.starts_with("m=video") {
            out.push(format!("b=AS:{max_bitrate_kbps}"));
            inserted = true;
        }
    }

    let mut joined = out.join(line_ending);
    if offer.ends_with(line_ending) {
        joined.push_str(line_ending);
    }
    joined
}

/// Drop `a=rid:` and `a=simulcast:` attributes from the offer.
#[must_use]
pub fn strip_simulcast_attrs(offer: &str) -> String {
    let line_ending = if offer.contains("\r\n") { "\r\n" } else { "\n" };
    let mut joined = offer
        .lines()
        .filter(|line| !line.starts_with("a=rid:") && !line.starts_with("a=simulcast:"))
        .collect::<Vec<_>>()
        .join(line_ending);
    if offer.ends_with(line_ending) {
        joined.push_str(line_ending);
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 1 1 IN IP4 0.0.0.0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        a=mid:0\r\n\
        m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
        a=mid:1\r\n\
        a=rid:h send\r\n\
        a=simulcast:send h;m;l\r\n";

    #[test]
    fn test_bandwidth_cap_in_video_section() {
        let munged = with_bandwidth_cap(OFFER, 1500);
        let lines: Vec<&str> = munged.lines().collect();
        let video_idx = lines.iter().position(|l| l.starts_with("m=video")).unwrap();
        assert_eq!(lines[video_idx + 1], "b=AS:1500");
        // audio section untouched
        let audio_idx = lines.iter().position(|l| l.starts_with("m=audio")).unwrap();
        assert!(!lines[audio_idx + 1].starts_with("b=AS"));
    }

    #[test]
    fn test_zero_cap_is_identity() {
        assert_eq!(with_bandwidth_cap(OFFER, 0), OFFER);
    }

    #[test]
    fn test_strip_simulcast_attrs() {
        let stripped = strip_simulcast_attrs(OFFER);
        assert!(!stripped.contains("a=rid:"));
        assert!(!stripped.contains("a=simulcast:"));
        assert!(stripped.contains("a=mid:1"));
    }

    #[test]
    fn test_cap_then_parse_roundtrip() {
        // munging twice with the same cap yields a stable document
        let once = with_bandwidth_cap(OFFER, 500);
        assert_eq!(once.matches("b=AS:500").count(), 1);
    }
}
