//! RTSP request and SDP attribute parsing.

use std::collections::HashMap;

use crate::error::HostError;

/// A parsed RTSP request head plus its body.
#[derive(Debug, Clone, Default)]
pub struct RtspRequest {
    pub method: String,
    pub target: String,
    pub cseq: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RtspRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// The `streamid=` selector of a SETUP target, e.g.
    /// `rtsp://host:port/streamid=audio/0/0` -> `audio`.
    pub fn stream_id(&self) -> Option<&str> {
        let idx = self.target.find("streamid=")?;
        let rest = &self.target[idx + "streamid=".len()..];
        Some(rest.split('/').next().unwrap_or(rest))
    }
}

/// Parse the request line and header lines (everything up to the blank
/// line). The body is read separately using `Content-Length`.
pub fn parse_head(lines: &[String]) -> Result<RtspRequest, HostError> {
    let first = lines
        .first()
        .ok_or_else(|| HostError::Protocol("empty RTSP request".into()))?;
    let mut parts = first.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| HostError::Protocol("missing RTSP method".into()))?
        .to_string();
    let target = parts
        .next()
        .ok_or_else(|| HostError::Protocol("missing RTSP target".into()))?
        .to_string();
    if parts.next().is_none() {
        return Err(HostError::Protocol("missing RTSP version".into()));
    }

    let mut headers = Vec::new();
    for line in &lines[1..] {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(HostError::Protocol(format!("malformed header: {}", line)));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let cseq = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("cseq"))
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| "1".to_string());

    Ok(RtspRequest {
        method,
        target,
        cseq,
        headers,
        body: String::new(),
    })
}

/// Collect `a=key:value` attributes from an SDP body.
///
/// The GameStream SDP is an attribute soup (`x-nv-...` keys); everything
/// else in the body is ignored.
pub fn parse_sdp_attributes(body: &str) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    for line in body.lines() {
        let line = line.trim();
        let Some(attr) = line.strip_prefix("a=") else {
            continue;
        };
        if let Some((key, value)) = attr.split_once(':') {
            attributes.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    attributes
}

/// Integer attribute with a default.
pub fn attr_i64(attributes: &HashMap<String, String>, key: &str, default: i64) -> i64 {
    attributes
        .get(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_request_line_and_headers() {
        let req = parse_head(&lines(&[
            "SETUP rtsp://10.0.0.1:48010/streamid=audio/0/0 RTSP/1.0",
            "CSeq: 3",
            "Transport: unicast;X-GS-ClientPort=50000-50001",
        ]))
        .unwrap();

        assert_eq!(req.method, "SETUP");
        assert_eq!(req.cseq, "3");
        assert_eq!(req.stream_id(), Some("audio"));
        assert!(req.header("transport").unwrap().contains("unicast"));
    }

    #[test]
    fn missing_version_is_a_protocol_error() {
        assert!(matches!(
            parse_head(&lines(&["OPTIONS *"])),
            Err(HostError::Protocol(_))
        ));
        assert!(matches!(parse_head(&[]), Err(HostError::Protocol(_))));
    }

    #[test]
    fn sdp_attributes_are_collected() {
        let body = "v=0\r\n\
                    o=android 0 14 IN IPv4 10.0.0.2\r\n\
                    s=NVIDIA Streaming Client\r\n\
                    a=x-nv-video[0].clientViewportWd:1920 \r\n\
                    a=x-nv-video[0].clientViewportHt:1080 \r\n\
                    a=x-nv-video[0].maxFPS:120 \r\n\
                    a=x-nv-vqos[0].bw.maximumBitrateKbps:20000 \r\n";
        let attributes = parse_sdp_attributes(body);

        assert_eq!(
            attr_i64(&attributes, "x-nv-video[0].clientViewportWd", 1280),
            1920
        );
        assert_eq!(attr_i64(&attributes, "x-nv-video[0].maxFPS", 60), 120);
        assert_eq!(
            attr_i64(&attributes, "x-nv-vqos[0].bw.maximumBitrateKbps", 10000),
            20000
        );
        // absent key falls back
        assert_eq!(attr_i64(&attributes, "x-nv-aqos.packetDuration", 5), 5);
    }
}
